//! In-memory adapters for every booking port.
//!
//! Intended for tests and local development; nothing here survives a
//! restart. The recording clients keep every call they receive so tests can
//! assert on the traffic a reconciliation produced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use cabinet_core::{
    AgentId, BookingId, LeadId, MeetingId, PipelineId, ProjectId, PropertyId, StatusId, UserId,
};

use crate::archive::{WebhookRequest, WebhookRequestStore};
use crate::booking::Booking;
use crate::catalog::StatusCatalog;
use crate::change_log::{BookingLog, BookingLogStore};
use crate::dispatcher::TaskContext;
use crate::error::{IntegrationError, QueueError, RepositoryError};
use crate::history::{BookingHistory, HistoryStore};
use crate::meeting::{Meeting, MeetingStatusWrite};
use crate::patch::{BookingPatch, guard};
use crate::ports::{
    AgentImporter, AmocrmStatus, ContactDirectory, ContactImporter, CrmClient, CrmLead,
    EmailTemplate, EmailTemplates, ImportedUser, IntegrationResult, LeadUpdate, MeetingImporter,
    MeetingStore, NewLead, PinningChecker, Project, ProjectDirectory, Property, PropertyStatus,
    PropertyStore, PurchaseMatrix, PurchaseTerms, ReservationClient, ReservationReply,
    RoomCreator, StatusDirectory, TaskInstanceService,
};
use crate::repository::{BookingFilter, BookingRepository, RegressionMonitor, report_regressions};
use crate::sweep::{DistributedLock, LockError, LockLease};
use crate::tasks::{BookingTask, TaskQueue};
use crate::webhook::WebhookLead;

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::backend("in-memory store lock poisoned")
}

fn client_poisoned<T>(_: T) -> IntegrationError {
    IntegrationError::unavailable("in-memory client", "lock poisoned")
}

/// Booking repository over a `HashMap`.
#[derive(Default)]
pub struct InMemoryBookingRepository {
    rows: RwLock<HashMap<BookingId, Booking>>,
    next_id: AtomicI64,
    monitor: Option<Arc<dyn RegressionMonitor>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(monitor: Arc<dyn RegressionMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
            ..Self::default()
        }
    }

    /// Stores `booking` as is, bypassing the guard. Seeds test fixtures.
    pub fn insert(&self, booking: Booking) -> Result<(), RepositoryError> {
        let id = booking.id_typed();
        self.next_id.fetch_max(id.get(), Ordering::SeqCst);
        self.rows.write().map_err(poisoned)?.insert(id, booking);
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Booking>, RepositoryError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by_key(|b| b.id_typed());
        Ok(all)
    }

    fn stored(&self, id: BookingId) -> Result<Booking, RepositoryError> {
        self.rows
            .read()
            .map_err(poisoned)?
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("booking {id}")))
    }

    fn write(&self, id: BookingId, patch: &BookingPatch) -> Result<Booking, RepositoryError> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let mut row = rows
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("booking {id}")))?;
        patch.apply_to(&mut row);
        row.bump_version();
        check_unique_leads(&rows, std::slice::from_ref(&row))?;
        rows.insert(id, row.clone());
        Ok(row)
    }

    fn insert_new(&self, patch: &BookingPatch) -> Result<Booking, RepositoryError> {
        let id = BookingId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut booking = Booking::new(id, Utc::now());
        patch.apply_to(&mut booking);
        booking.bump_version();
        let mut rows = self.rows.write().map_err(poisoned)?;
        check_unique_leads(&rows, std::slice::from_ref(&booking))?;
        rows.insert(id, booking.clone());
        Ok(booking)
    }
}

/// Rejects `changed` rows whose `amocrm_id` another booking already holds,
/// or that share one among themselves.
fn check_unique_leads(
    rows: &HashMap<BookingId, Booking>,
    changed: &[Booking],
) -> Result<(), RepositoryError> {
    let ids: HashSet<BookingId> = changed.iter().map(|b| b.id_typed()).collect();
    let mut taken: HashSet<LeadId> = rows
        .values()
        .filter(|b| !ids.contains(&b.id_typed()))
        .filter_map(|b| b.amocrm_id)
        .collect();
    for lead in changed.iter().filter_map(|b| b.amocrm_id) {
        if !taken.insert(lead) {
            return Err(RepositoryError::conflict(format!(
                "amocrm_id {lead} already belongs to another booking"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError> {
        Ok(self.rows.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn find_by_amocrm_id(&self, lead: LeadId) -> Result<Option<Booking>, RepositoryError> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .values()
            .filter(|b| b.amocrm_id == Some(lead))
            .min_by_key(|b| b.id_typed())
            .cloned())
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, RepositoryError> {
        let rows = self.rows.read().map_err(poisoned)?;
        let mut found: Vec<_> = rows.values().filter(|b| filter.matches(b)).cloned().collect();
        found.sort_by_key(|b| b.id_typed());
        Ok(found)
    }

    async fn create(&self, patch: BookingPatch) -> Result<Booking, RepositoryError> {
        self.insert_new(&patch)
    }

    async fn update(
        &self,
        booking: &Booking,
        patch: BookingPatch,
    ) -> Result<Booking, RepositoryError> {
        let id = booking.id_typed();
        let outcome = guard(patch);
        let stored = self.stored(id)?;
        report_regressions(self.monitor.as_ref(), &stored, &outcome).await;
        self.write(id, &outcome.applied)
    }

    async fn bulk_update(
        &self,
        patch: BookingPatch,
        filter: &BookingFilter,
        exclude: Option<&BookingFilter>,
    ) -> Result<u64, RepositoryError> {
        let outcome = guard(patch);
        let mut rows = self.rows.write().map_err(poisoned)?;
        let changed: Vec<Booking> = rows
            .values()
            .filter(|row| filter.matches(row) && !exclude.is_some_and(|e| e.matches(row)))
            .map(|row| {
                let mut row = row.clone();
                outcome.applied.apply_to(&mut row);
                row.bump_version();
                row
            })
            .collect();
        check_unique_leads(&rows, &changed)?;
        let written = changed.len() as u64;
        for row in changed {
            rows.insert(row.id_typed(), row);
        }
        Ok(written)
    }

    async fn update_or_create(
        &self,
        filter: &BookingFilter,
        patch: BookingPatch,
    ) -> Result<(Booking, bool), RepositoryError> {
        let existing = match filter.amocrm_id {
            Some(lead) => self.find_by_amocrm_id(lead).await?,
            None => self.list(filter).await?.into_iter().next(),
        };
        if let Some(booking) = existing {
            return Ok((self.update(&booking, patch).await?, false));
        }

        let mut seeded = filter.seed();
        seeded.extend(guard(patch.clone()).applied);
        match (self.insert_new(&seeded), filter.amocrm_id) {
            (Err(RepositoryError::Conflict(_)), Some(lead)) => {
                let booking = self
                    .find_by_amocrm_id(lead)
                    .await?
                    .ok_or_else(|| RepositoryError::not_found(format!("booking for lead {lead}")))?;
                Ok((self.update(&booking, patch).await?, false))
            }
            (created, _) => Ok((created?, true)),
        }
    }
}

/// Append-only `Vec` store shared by the history, change-log and webhook
/// archives.
macro_rules! vec_store {
    ($name:ident, $item:ty) => {
        #[derive(Debug, Default)]
        pub struct $name {
            entries: RwLock<Vec<$item>>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn entries(&self) -> Vec<$item> {
                self.entries.read().map(|e| e.clone()).unwrap_or_default()
            }

            fn push(&self, item: $item) -> Result<(), RepositoryError> {
                self.entries.write().map_err(poisoned)?.push(item);
                Ok(())
            }

            fn filtered(&self, keep: impl Fn(&$item) -> bool) -> Result<Vec<$item>, RepositoryError> {
                let entries = self.entries.read().map_err(poisoned)?;
                Ok(entries.iter().filter(|e| keep(*e)).cloned().collect())
            }
        }
    };
}

vec_store!(InMemoryHistoryStore, BookingHistory);
vec_store!(InMemoryBookingLogStore, BookingLog);
vec_store!(InMemoryWebhookRequestStore, WebhookRequest);

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, entry: BookingHistory) -> Result<(), RepositoryError> {
        self.push(entry)
    }

    async fn for_booking(
        &self,
        booking: BookingId,
    ) -> Result<Vec<BookingHistory>, RepositoryError> {
        self.filtered(|e| e.booking_id == booking)
    }
}

#[async_trait]
impl BookingLogStore for InMemoryBookingLogStore {
    async fn append(&self, log: BookingLog) -> Result<(), RepositoryError> {
        self.push(log)
    }

    async fn for_booking(&self, booking: BookingId) -> Result<Vec<BookingLog>, RepositoryError> {
        self.filtered(|e| e.booking_id == Some(booking))
    }
}

#[async_trait]
impl WebhookRequestStore for InMemoryWebhookRequestStore {
    async fn append(&self, request: WebhookRequest) -> Result<(), RepositoryError> {
        self.push(request)
    }

    async fn list(&self, category: Option<&str>) -> Result<Vec<WebhookRequest>, RepositoryError> {
        self.filtered(|e| category.is_none_or(|c| e.category == c))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMeetingStore {
    meetings: RwLock<HashMap<MeetingId, Meeting>>,
}

impl InMemoryMeetingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meeting: Meeting) -> Result<(), RepositoryError> {
        self.meetings
            .write()
            .map_err(poisoned)?
            .insert(meeting.id, meeting);
        Ok(())
    }

    pub fn get(&self, id: MeetingId) -> Option<Meeting> {
        self.meetings.read().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl MeetingStore for InMemoryMeetingStore {
    async fn for_booking(&self, booking: BookingId) -> Result<Option<Meeting>, RepositoryError> {
        let meetings = self.meetings.read().map_err(poisoned)?;
        Ok(meetings
            .values()
            .filter(|m| m.booking_id == booking)
            .min_by_key(|m| m.id)
            .cloned())
    }

    async fn save_status(
        &self,
        meeting: MeetingId,
        write: MeetingStatusWrite,
    ) -> Result<Meeting, RepositoryError> {
        let mut meetings = self.meetings.write().map_err(poisoned)?;
        let row = meetings
            .get_mut(&meeting)
            .ok_or_else(|| RepositoryError::not_found(format!("meeting {meeting}")))?;
        write.apply(row);
        Ok(row.clone())
    }

    async fn set_link(&self, meeting: MeetingId, link: String) -> Result<(), RepositoryError> {
        let mut meetings = self.meetings.write().map_err(poisoned)?;
        let row = meetings
            .get_mut(&meeting)
            .ok_or_else(|| RepositoryError::not_found(format!("meeting {meeting}")))?;
        row.meeting_link = Some(link);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPropertyStore {
    properties: RwLock<HashMap<PropertyId, Property>>,
    next_id: AtomicI64,
}

impl InMemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, property: Property) -> Result<(), RepositoryError> {
        self.next_id.fetch_max(property.id.get(), Ordering::SeqCst);
        self.properties
            .write()
            .map_err(poisoned)?
            .insert(property.id, property);
        Ok(())
    }

    pub fn snapshot(&self, id: PropertyId) -> Option<Property> {
        self.properties.read().ok()?.get(&id).cloned()
    }

    fn modify(
        &self,
        id: PropertyId,
        change: impl FnOnce(&mut Property),
    ) -> Result<(), RepositoryError> {
        let mut properties = self.properties.write().map_err(poisoned)?;
        let row = properties
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::not_found(format!("property {id}")))?;
        change(row);
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn get(&self, id: PropertyId) -> Result<Option<Property>, RepositoryError> {
        Ok(self.properties.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: PropertyId,
        status: PropertyStatus,
    ) -> Result<(), RepositoryError> {
        self.modify(id, |p| p.status = status)
    }

    async fn set_final_price(&self, id: PropertyId, price: Decimal) -> Result<(), RepositoryError> {
        self.modify(id, |p| p.final_price = Some(price))
    }

    async fn upsert_external(
        &self,
        external_id: &str,
        kind: &str,
    ) -> Result<Property, RepositoryError> {
        let mut properties = self.properties.write().map_err(poisoned)?;
        if let Some(found) = properties.values_mut().find(|p| p.external_id == external_id) {
            found.kind = Some(kind.to_string());
            return Ok(found.clone());
        }
        let id = PropertyId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let property = Property {
            id,
            external_id: external_id.to_string(),
            kind: Some(kind.to_string()),
            status: PropertyStatus::Free,
            final_price: None,
            project_id: None,
            building_id: None,
            floor_id: None,
        };
        properties.insert(id, property.clone());
        Ok(property)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProjectDirectory {
    projects: Vec<Project>,
}

impl InMemoryProjectDirectory {
    pub fn new(projects: Vec<Project>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryProjectDirectory {
    async fn get(&self, id: ProjectId) -> Result<Option<Project>, RepositoryError> {
        Ok(self.projects.iter().find(|p| p.id == id).cloned())
    }

    async fn current_by_amocrm_enum(
        &self,
        enum_id: i64,
    ) -> Result<Option<Project>, RepositoryError> {
        Ok(self
            .projects
            .iter()
            .find(|p| p.amocrm_enum == enum_id)
            .cloned())
    }
}

/// Status mirror derived from the status catalog: every semantic status of
/// every pipeline, grouped by the catalog's group names.
#[derive(Debug, Default)]
pub struct InMemoryStatusDirectory {
    statuses: Vec<AmocrmStatus>,
}

impl InMemoryStatusDirectory {
    pub fn new(statuses: Vec<AmocrmStatus>) -> Self {
        Self { statuses }
    }

    pub fn from_catalog(catalog: &StatusCatalog) -> Self {
        let groups = catalog.groups();
        let group_of = |name: &str| -> Option<String> {
            let group = match name {
                "start" => &groups.start,
                "make_appointment" => &groups.make_appointment,
                "meeting" => &groups.meeting,
                "meeting_in_progress" => &groups.meeting_in_progress,
                "make_decision" => &groups.make_decision,
                "booking" => &groups.booking_fragment,
                "unrealized" => &groups.unrealized,
                _ => return None,
            };
            Some(group.clone())
        };
        let statuses = catalog
            .config()
            .pipelines
            .iter()
            .flat_map(|table| {
                table.statuses.iter().map(move |(name, id)| AmocrmStatus {
                    id: *id,
                    name: name.clone(),
                    pipeline_id: table.pipeline_id,
                    group_name: group_of(name),
                })
            })
            .collect();
        Self { statuses }
    }
}

#[async_trait]
impl StatusDirectory for InMemoryStatusDirectory {
    async fn status(&self, id: StatusId) -> Result<Option<AmocrmStatus>, RepositoryError> {
        Ok(self.statuses.iter().find(|s| s.id == id).cloned())
    }

    async fn find_in_group(
        &self,
        pipeline: PipelineId,
        fragment: &str,
    ) -> Result<Option<AmocrmStatus>, RepositoryError> {
        Ok(self
            .statuses
            .iter()
            .filter(|s| s.pipeline_id == pipeline)
            .filter(|s| s.group_name.as_deref().is_some_and(|g| g.contains(fragment)))
            .min_by_key(|s| s.id)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPurchaseMatrix {
    rows: HashMap<i64, PurchaseTerms>,
    default_row: Option<PurchaseTerms>,
}

impl InMemoryPurchaseMatrix {
    pub fn new(rows: HashMap<i64, PurchaseTerms>, default_row: Option<PurchaseTerms>) -> Self {
        Self { rows, default_row }
    }
}

#[async_trait]
impl PurchaseMatrix for InMemoryPurchaseMatrix {
    async fn resolve(&self, payment_type: i64) -> Result<Option<PurchaseTerms>, RepositoryError> {
        Ok(self
            .rows
            .get(&payment_type)
            .or(self.default_row.as_ref())
            .cloned())
    }
}

/// Task queue that keeps every task instead of running it.
#[derive(Debug, Default)]
pub struct RecordingTaskQueue {
    tasks: Mutex<Vec<BookingTask>>,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<BookingTask> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.tasks().iter().map(BookingTask::kind).collect()
    }

    /// Removes and returns everything queued so far.
    pub fn drain(&self) -> Vec<BookingTask> {
        self.tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskQueue for RecordingTaskQueue {
    async fn enqueue(&self, task: BookingTask) -> Result<(), QueueError> {
        let kind = task.kind();
        self.tasks
            .lock()
            .map_err(|_| QueueError {
                kind,
                message: "queue lock poisoned".into(),
            })?
            .push(task);
        Ok(())
    }
}

/// CRM stand-in holding leads in memory.
#[derive(Debug, Default)]
pub struct RecordingCrm {
    leads: Mutex<HashMap<LeadId, CrmLead>>,
    updates: Mutex<Vec<LeadUpdate>>,
    created: Mutex<Vec<NewLead>>,
    notes: Mutex<Vec<(LeadId, String)>>,
    next_id: AtomicI64,
    failing_fetches: AtomicUsize,
}

impl RecordingCrm {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(90_000_000),
            ..Self::default()
        }
    }

    pub fn with_lead(self, lead: CrmLead) -> Self {
        if let Ok(mut leads) = self.leads.lock() {
            leads.insert(lead.id, lead);
        }
        self
    }

    /// Makes the next `count` lead fetches fail as unavailable.
    pub fn failing_fetches(self, count: usize) -> Self {
        self.failing_fetches.store(count, Ordering::SeqCst);
        self
    }

    pub fn updates(&self) -> Vec<LeadUpdate> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn created(&self) -> Vec<NewLead> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn notes(&self) -> Vec<(LeadId, String)> {
        self.notes.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CrmClient for RecordingCrm {
    async fn fetch_leads(&self, ids: &[LeadId]) -> IntegrationResult<Vec<CrmLead>> {
        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(IntegrationError::unavailable("amocrm", "lead fetch failed"));
        }
        let leads = self.leads.lock().map_err(client_poisoned)?;
        Ok(ids.iter().filter_map(|id| leads.get(id).cloned()).collect())
    }

    async fn create_lead(&self, lead: NewLead) -> IntegrationResult<CrmLead> {
        let id = LeadId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let created = CrmLead {
            id,
            status_id: Some(lead.status_id),
            pipeline_id: Some(lead.pipeline_id),
        };
        self.created.lock().map_err(client_poisoned)?.push(lead);
        self.leads
            .lock()
            .map_err(client_poisoned)?
            .insert(id, created.clone());
        Ok(created)
    }

    async fn update_lead(&self, update: LeadUpdate) -> IntegrationResult<CrmLead> {
        let lead = CrmLead {
            id: update.lead_id,
            status_id: Some(update.status_id),
            pipeline_id: Some(update.pipeline_id),
        };
        self.leads
            .lock()
            .map_err(client_poisoned)?
            .insert(lead.id, lead.clone());
        self.updates.lock().map_err(client_poisoned)?.push(update);
        Ok(lead)
    }

    async fn create_note(&self, lead: LeadId, text: &str) -> IntegrationResult<()> {
        self.notes
            .lock()
            .map_err(client_poisoned)?
            .push((lead, text.to_string()));
        Ok(())
    }
}

/// Reservation system stand-in answering with a fixed reply.
#[derive(Debug)]
pub struct RecordingReservation {
    reply: ReservationReply,
    booked: Mutex<Vec<(PropertyId, LeadId)>>,
    unbooked: Mutex<Vec<LeadId>>,
}

impl Default for RecordingReservation {
    fn default() -> Self {
        Self::answering(ReservationReply {
            success: true,
            code: None,
        })
    }
}

impl RecordingReservation {
    pub fn answering(reply: ReservationReply) -> Self {
        Self {
            reply,
            booked: Mutex::new(Vec::new()),
            unbooked: Mutex::new(Vec::new()),
        }
    }

    pub fn booked(&self) -> Vec<(PropertyId, LeadId)> {
        self.booked.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn unbooked(&self) -> Vec<LeadId> {
        self.unbooked.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReservationClient for RecordingReservation {
    async fn book_property(
        &self,
        property: PropertyId,
        deal: LeadId,
    ) -> IntegrationResult<ReservationReply> {
        self.booked
            .lock()
            .map_err(client_poisoned)?
            .push((property, deal));
        Ok(self.reply.clone())
    }

    async fn unbook_property(&self, deal: LeadId) -> IntegrationResult<bool> {
        self.unbooked.lock().map_err(client_poisoned)?.push(deal);
        Ok(true)
    }
}

/// Call made against [`RecordingTaskInstances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInstanceCall {
    CreateChain {
        booking: BookingId,
        context: Option<TaskContext>,
    },
    UpdateStatus {
        booking: BookingId,
        status: String,
    },
}

#[derive(Debug, Default)]
pub struct RecordingTaskInstances {
    existing: Mutex<HashSet<(BookingId, String)>>,
    calls: Mutex<Vec<TaskInstanceCall>>,
    failing_chains: AtomicUsize,
}

impl RecordingTaskInstances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a task instance in `status` as existing for `booking`.
    pub fn seed(&self, booking: BookingId, status: &str) {
        if let Ok(mut existing) = self.existing.lock() {
            existing.insert((booking, status.to_string()));
        }
    }

    /// Makes the next `count` chain creations fail after being recorded.
    pub fn failing_chains(self, count: usize) -> Self {
        self.failing_chains.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<TaskInstanceCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskInstanceService for RecordingTaskInstances {
    async fn exists_with_status(
        &self,
        booking: BookingId,
        status: &str,
    ) -> IntegrationResult<bool> {
        let existing = self.existing.lock().map_err(client_poisoned)?;
        Ok(existing.contains(&(booking, status.to_string())))
    }

    async fn create_chain(
        &self,
        booking: BookingId,
        context: Option<&TaskContext>,
    ) -> IntegrationResult<()> {
        self.calls
            .lock()
            .map_err(client_poisoned)?
            .push(TaskInstanceCall::CreateChain {
                booking,
                context: context.cloned(),
            });
        let failing = self
            .failing_chains
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(IntegrationError::unavailable("task instances", "chain creation failed"));
        }
        Ok(())
    }

    async fn update_status(&self, booking: BookingId, status: &str) -> IntegrationResult<()> {
        self.calls
            .lock()
            .map_err(client_poisoned)?
            .push(TaskInstanceCall::UpdateStatus {
                booking,
                status: status.to_string(),
            });
        Ok(())
    }
}

/// Importers and small services answering from fixed data.
#[derive(Debug, Default)]
pub struct StaticCollaborators {
    pub user: Option<ImportedUser>,
    pub context: Option<TaskContext>,
    pub templates: Vec<EmailTemplate>,
    pub user_emails: HashMap<UserId, String>,
    pub agent_emails: HashMap<AgentId, String>,
    pinned: Mutex<Vec<UserId>>,
    agents_imported: Mutex<u32>,
    rooms: Mutex<Vec<MeetingId>>,
}

impl StaticCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: Option<ImportedUser>) -> Self {
        self.user = user;
        self
    }

    pub fn pinning_checks(&self) -> Vec<UserId> {
        self.pinned.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn agent_imports(&self) -> u32 {
        self.agents_imported.lock().map(|a| *a).unwrap_or_default()
    }

    pub fn rooms_created(&self) -> Vec<MeetingId> {
        self.rooms.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ContactImporter for StaticCollaborators {
    async fn import_contact(&self, _lead: &WebhookLead) -> IntegrationResult<Option<ImportedUser>> {
        Ok(self.user.clone())
    }
}

#[async_trait]
impl AgentImporter for StaticCollaborators {
    async fn import_agent(&self, _lead: &WebhookLead) -> IntegrationResult<()> {
        *self.agents_imported.lock().map_err(client_poisoned)? += 1;
        Ok(())
    }
}

#[async_trait]
impl MeetingImporter for StaticCollaborators {
    async fn import_meeting(
        &self,
        _lead: &WebhookLead,
        _user: Option<&ImportedUser>,
    ) -> IntegrationResult<Option<TaskContext>> {
        Ok(self.context.clone())
    }
}

#[async_trait]
impl PinningChecker for StaticCollaborators {
    async fn check_pinning(&self, user: UserId) -> IntegrationResult<()> {
        self.pinned.lock().map_err(client_poisoned)?.push(user);
        Ok(())
    }
}

#[async_trait]
impl RoomCreator for StaticCollaborators {
    async fn create_room(
        &self,
        meeting: MeetingId,
        starts_at: DateTime<Utc>,
    ) -> IntegrationResult<String> {
        self.rooms.lock().map_err(client_poisoned)?.push(meeting);
        Ok(format!("https://meet.local/{meeting}?at={}", starts_at.timestamp()))
    }
}

#[async_trait]
impl EmailTemplates for StaticCollaborators {
    async fn template(&self, slug: &str) -> IntegrationResult<Option<EmailTemplate>> {
        Ok(self.templates.iter().find(|t| t.slug == slug).cloned())
    }
}

#[async_trait]
impl ContactDirectory for StaticCollaborators {
    async fn user_email(&self, user: UserId) -> IntegrationResult<Option<String>> {
        Ok(self.user_emails.get(&user).cloned())
    }

    async fn agent_email(&self, agent: AgentId) -> IntegrationResult<Option<String>> {
        Ok(self.agent_emails.get(&agent).cloned())
    }
}

/// Process-local lock with expiring leases.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::backend("lock table poisoned"))?;
        let now = Instant::now();
        if held.get(key).is_some_and(|(_, expires)| *expires > now) {
            return Ok(None);
        }
        let token = uuid::Uuid::now_v7().to_string();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
        }))
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::backend("lock table poisoned"))?;
        let now = Instant::now();
        match held.get_mut(&lease.key) {
            Some((token, expires)) if *token == lease.token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::backend("lock table poisoned"))?;
        if held.get(&lease.key).is_some_and(|(token, _)| *token == lease.token) {
            held.remove(&lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::BookingField;
    use crate::repository::QueueRegressionMonitor;

    #[tokio::test]
    async fn update_drops_regressions_and_alerts() {
        let queue = Arc::new(RecordingTaskQueue::new());
        let repo = InMemoryBookingRepository::with_monitor(Arc::new(QueueRegressionMonitor::new(
            queue.clone(),
        )));
        let mut seeded = Booking::new(BookingId::new(1), Utc::now());
        seeded.price_payed = true;
        seeded.payment_amount = Some(Decimal::new(5000, 0));
        repo.insert(seeded.clone()).unwrap();

        let patch = BookingPatch::new()
            .set(BookingField::PricePayed(false))
            .set(BookingField::PaymentAmount(None))
            .set(BookingField::Active(false));
        let updated = repo.update(&seeded, patch).await.unwrap();

        assert!(updated.price_payed);
        assert_eq!(updated.payment_amount, Some(Decimal::new(5000, 0)));
        assert!(!updated.active);
        assert_eq!(queue.kinds(), vec!["booking.regression_alert"]);
    }

    #[tokio::test]
    async fn bulk_update_honours_exclusions() {
        let repo = InMemoryBookingRepository::new();
        for id in 1..=3 {
            let mut b = Booking::new(BookingId::new(id), Utc::now());
            b.amocrm_id = Some(LeadId::new(id * 10));
            repo.insert(b).unwrap();
        }
        let written = repo
            .bulk_update(
                BookingPatch::new().set(BookingField::Active(false)),
                &BookingFilter::new().active(true),
                Some(&BookingFilter::new().amocrm_id(LeadId::new(20))),
            )
            .await
            .unwrap();
        assert_eq!(written, 2);
        let still_active = repo.list(&BookingFilter::new().active(true)).await.unwrap();
        assert_eq!(still_active.len(), 1);
        assert_eq!(still_active[0].amocrm_id, Some(LeadId::new(20)));
    }

    #[tokio::test]
    async fn second_booking_for_the_same_lead_is_a_conflict() {
        let repo = InMemoryBookingRepository::new();
        let patch = || BookingPatch::new().set(BookingField::AmocrmId(Some(LeadId::new(9))));
        let first = repo.create(patch()).await.unwrap();

        let err = repo.create(patch()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let other = repo.create(BookingPatch::new()).await.unwrap();
        let err = repo.update(&other, patch()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.all().unwrap().len(), 2);
        assert_eq!(
            repo.find_by_amocrm_id(LeadId::new(9)).await.unwrap().map(|b| b.id_typed()),
            Some(first.id_typed())
        );
    }

    #[tokio::test]
    async fn update_or_create_reuses_the_row_holding_the_lead() {
        let repo = InMemoryBookingRepository::new();
        let mut held = Booking::new(BookingId::new(4), Utc::now());
        held.amocrm_id = Some(LeadId::new(9));
        held.active = false;
        repo.insert(held).unwrap();

        let (booking, created) = repo
            .update_or_create(
                &BookingFilter::new().amocrm_id(LeadId::new(9)).active(true),
                BookingPatch::new().set(BookingField::Active(true)),
            )
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(booking.id_typed(), BookingId::new(4));
        assert!(booking.active);
        assert_eq!(repo.all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_or_create_seeds_from_filter() {
        let repo = InMemoryBookingRepository::new();
        let filter = BookingFilter::new().amocrm_id(LeadId::new(77));
        let (created, was_created) = repo
            .update_or_create(&filter, BookingPatch::new().set(BookingField::Active(false)))
            .await
            .unwrap();
        assert!(was_created);
        assert_eq!(created.amocrm_id, Some(LeadId::new(77)));

        let (updated, was_created) = repo
            .update_or_create(&filter, BookingPatch::new().set(BookingField::Active(true)))
            .await
            .unwrap();
        assert!(!was_created);
        assert_eq!(updated.id_typed(), created.id_typed());
        assert!(updated.active);
    }

    #[tokio::test]
    async fn lock_excludes_second_holder_until_release() {
        let lock = InMemoryLock::new();
        let lease = lock
            .try_acquire("sweep", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.try_acquire("sweep", Duration::from_secs(60)).await.unwrap().is_none());
        lock.release(&lease).await.unwrap();
        assert!(lock.try_acquire("sweep", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn status_directory_groups_catalog_statuses() {
        let catalog = StatusCatalog::builtin().unwrap();
        let statuses = InMemoryStatusDirectory::from_catalog(&catalog);
        let tmn = PipelineId::new(1305043);
        let booking = statuses
            .find_in_group(tmn, &catalog.groups().booking_fragment)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(booking.id, StatusId::new(21197641));
    }
}
