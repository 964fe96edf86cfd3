//! CRM status taxonomy as data.
//!
//! Every city pipeline has its own status ids for the same semantic status
//! (`booking`, `meeting`, ...). The catalog holds those tables, the skip lists
//! that guard status writes, the CRM custom-field ids, and the group names the
//! reconciler reacts to. A built-in copy ships with the crate; deployments may
//! load a replacement from a JSON file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cabinet_core::{PipelineId, StatusId};

use crate::constants::BookingSubstage;

const BUILTIN_CATALOG: &str = include_str!("../config/status_catalog.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read status catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid status catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Status table of one city pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatuses {
    pub city: String,
    pub pipeline_id: PipelineId,
    /// Semantic status name to CRM status id.
    pub statuses: BTreeMap<String, StatusId>,
}

/// CRM custom-field ids read from lead payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmFieldIds {
    pub commission: i64,
    pub commission_value: i64,
    pub final_discount: i64,
    pub final_additional_options: i64,
    pub city: i64,
    pub project: i64,
    pub property: i64,
    pub property_str_type: i64,
    pub booking_payment: i64,
    pub booking_payment_type: i64,
    pub booking_expires: i64,
    pub property_final_price: i64,
    pub property_price_with_sale: i64,
    pub meeting_type: i64,
}

/// CRM group-status names the reconciler reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNames {
    pub make_appointment: String,
    pub meeting: String,
    pub meeting_in_progress: String,
    pub start: String,
    pub make_decision: String,
    pub unrealized: String,
    /// Fragment identifying the booking group of a pipeline.
    pub booking_fragment: String,
    /// Groups that may legitimately follow a client fixation.
    pub fixation_followers: Vec<String>,
}

/// Payment-enum value to `price_payed` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFlag {
    pub enum_id: i64,
    pub price_payed: bool,
}

/// On-disk shape of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Lookup order matters: the first table that knows a status id wins.
    pub pipelines: Vec<PipelineStatuses>,
    pub sales_pipelines: Vec<PipelineId>,
    pub agent_assigned_skip: Vec<StatusId>,
    pub status_only_skip: Vec<StatusId>,
    pub assign_agent_cities: Vec<String>,
    pub groups: GroupNames,
    pub fields: CrmFieldIds,
    pub fast_booking_tag: i64,
    pub payment_flags: Vec<PaymentFlag>,
}

/// Group classification used by the meeting sub-machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MeetingGroup {
    MakeAppointment,
    Meeting,
    MeetingInProgress,
    Other,
}

/// Where a CRM status lands in the booking substage vocabulary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubstageLookup<'a> {
    Mapped(BookingSubstage),
    /// A catalogued status with no booking counterpart (call-centre and test
    /// pipelines). The stored substage is kept as it is.
    Unmapped(&'a str),
    /// Missing or uncatalogued status id.
    Unknown,
}

/// Indexed, read-only status catalog.
#[derive(Debug, Clone)]
pub struct StatusCatalog {
    config: CatalogConfig,
    substages: HashMap<StatusId, String>,
    sales: HashSet<PipelineId>,
    agent_assigned_skip: HashSet<StatusId>,
    status_only_skip: HashSet<StatusId>,
    assign_agent: HashSet<StatusId>,
    start: HashSet<StatusId>,
}

impl StatusCatalog {
    pub fn new(config: CatalogConfig) -> Self {
        let mut substages = HashMap::new();
        for table in &config.pipelines {
            for (name, id) in &table.statuses {
                substages.entry(*id).or_insert_with(|| name.clone());
            }
        }

        let named = |name: &str| -> HashSet<StatusId> {
            config
                .pipelines
                .iter()
                .filter(|t| config.assign_agent_cities.contains(&t.city))
                .filter_map(|t| t.statuses.get(name).copied())
                .collect()
        };
        let assign_agent = named("assign_agent");
        let start = named("start");

        Self {
            sales: config.sales_pipelines.iter().copied().collect(),
            agent_assigned_skip: config.agent_assigned_skip.iter().copied().collect(),
            status_only_skip: config.status_only_skip.iter().copied().collect(),
            substages,
            assign_agent,
            start,
            config,
        }
    }

    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_CATALOG)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let config: CatalogConfig = serde_json::from_str(json)?;
        Ok(Self::new(config))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn fields(&self) -> &CrmFieldIds {
        &self.config.fields
    }

    pub fn groups(&self) -> &GroupNames {
        &self.config.groups
    }

    /// Semantic status name of a CRM status id, from the first table that
    /// knows it.
    pub fn status_name(&self, status: StatusId) -> Option<&str> {
        self.substages.get(&status).map(String::as_str)
    }

    /// Booking substage for a CRM status id. Statuses without a booking
    /// counterpart (auto-dial, quality control, ...) yield `None`.
    pub fn substage(&self, status: Option<StatusId>) -> Option<BookingSubstage> {
        match self.lookup_substage(status) {
            SubstageLookup::Mapped(substage) => Some(substage),
            SubstageLookup::Unmapped(_) | SubstageLookup::Unknown => None,
        }
    }

    pub fn lookup_substage(&self, status: Option<StatusId>) -> SubstageLookup<'_> {
        let Some(name) = status.and_then(|s| self.status_name(s)) else {
            return SubstageLookup::Unknown;
        };
        match BookingSubstage::from_slug(name) {
            Some(substage) => SubstageLookup::Mapped(substage),
            None => SubstageLookup::Unmapped(name),
        }
    }

    /// Status id of a semantic status in the given pipeline.
    pub fn status_id(&self, pipeline: PipelineId, name: &str) -> Option<StatusId> {
        self.config
            .pipelines
            .iter()
            .find(|t| t.pipeline_id == pipeline)
            .and_then(|t| t.statuses.get(name).copied())
    }

    pub fn is_sales_pipeline(&self, pipeline: Option<PipelineId>) -> bool {
        pipeline.is_some_and(|p| self.sales.contains(&p))
    }

    pub fn is_agent_assigned_skip(&self, status: StatusId) -> bool {
        self.agent_assigned_skip.contains(&status)
    }

    pub fn is_status_only_skip(&self, status: StatusId) -> bool {
        self.status_only_skip.contains(&status)
    }

    pub fn is_assign_agent_status(&self, status: StatusId) -> bool {
        self.assign_agent.contains(&status)
    }

    pub fn is_start_status(&self, status: StatusId) -> bool {
        self.start.contains(&status)
    }

    /// `price_payed` value for a payment-field enum, when mapped.
    pub fn price_payed_for(&self, enum_id: i64) -> Option<bool> {
        self.config
            .payment_flags
            .iter()
            .find(|flag| flag.enum_id == enum_id)
            .map(|flag| flag.price_payed)
    }

    pub fn meeting_group(&self, group_name: &str) -> MeetingGroup {
        let groups = &self.config.groups;
        if group_name == groups.make_appointment {
            MeetingGroup::MakeAppointment
        } else if group_name == groups.meeting {
            MeetingGroup::Meeting
        } else if group_name == groups.meeting_in_progress {
            MeetingGroup::MeetingInProgress
        } else {
            MeetingGroup::Other
        }
    }

    pub fn may_follow_fixation(&self, group_name: &str) -> bool {
        self.config
            .groups
            .fixation_followers
            .iter()
            .any(|g| g == group_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StatusCatalog {
        StatusCatalog::builtin().unwrap()
    }

    #[test]
    fn substage_lookup_uses_city_order() {
        let c = catalog();
        assert_eq!(
            c.substage(Some(StatusId::new(21197641))),
            Some(BookingSubstage::Booking)
        );
        assert_eq!(
            c.substage(Some(StatusId::new(36204960))),
            Some(BookingSubstage::Confirmation)
        );
        assert_eq!(
            c.substage(Some(StatusId::new(142))),
            Some(BookingSubstage::Realized)
        );
        // Zoom call id is shared by the test and call-center tables.
        assert_eq!(c.status_name(StatusId::new(40127295)), Some("zoom_call"));
    }

    #[test]
    fn non_booking_statuses_have_no_substage() {
        let c = catalog();
        assert_eq!(c.substage(Some(StatusId::new(39338919))), None);
        assert_eq!(c.substage(Some(StatusId::new(1))), None);
        assert_eq!(c.substage(None), None);
    }

    #[test]
    fn call_centre_statuses_are_known_but_unmapped() {
        let c = catalog();
        assert_eq!(
            c.lookup_substage(Some(StatusId::new(39338919))),
            SubstageLookup::Unmapped("redial")
        );
        assert_eq!(
            c.lookup_substage(Some(StatusId::new(21197641))),
            SubstageLookup::Mapped(BookingSubstage::Booking)
        );
        assert_eq!(c.lookup_substage(Some(StatusId::new(1))), SubstageLookup::Unknown);
    }

    #[test]
    fn pipelines_and_skip_lists() {
        let c = catalog();
        assert!(c.is_sales_pipeline(Some(PipelineId::new(1305043))));
        assert!(!c.is_sales_pipeline(Some(PipelineId::new(999))));
        assert!(!c.is_sales_pipeline(None));
        assert!(c.is_agent_assigned_skip(StatusId::new(42477951)));
        assert!(c.is_status_only_skip(StatusId::new(21197641)));
        assert!(!c.is_agent_assigned_skip(StatusId::new(21197641)));
    }

    #[test]
    fn assign_agent_and_start_sets_cover_city_pipelines() {
        let c = catalog();
        for id in [51489690, 51105825, 41481162, 51944400, 50284815] {
            assert!(c.is_assign_agent_status(StatusId::new(id)));
        }
        for id in [21189703, 29096287, 35065581, 50814837, 42477861] {
            assert!(c.is_start_status(StatusId::new(id)));
        }
        assert!(!c.is_start_status(StatusId::new(37592457)));
    }

    #[test]
    fn payment_flags_and_groups() {
        let c = catalog();
        assert_eq!(c.price_payed_for(1309975), Some(true));
        assert_eq!(c.price_payed_for(1309977), Some(false));
        assert_eq!(c.price_payed_for(1), None);
        assert_eq!(c.meeting_group("Встреча назначена"), MeetingGroup::Meeting);
        assert_eq!(c.meeting_group("Бронь"), MeetingGroup::Other);
        assert!(c.may_follow_fixation("Принимают решение"));
        assert!(!c.may_follow_fixation("Бронь"));
    }
}
