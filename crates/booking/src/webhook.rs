//! Webhook payload parsing and secret verification.
//!
//! The CRM posts leads as URL-encoded forms with bracketed keys such as
//! `leads[status][0][custom_fields][3][values][0][enum]`. Keys are split into
//! segments once and matched against a fixed schema; anything outside the
//! schema is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cabinet_core::{LeadId, PipelineId, StatusId};

/// Lead actions the CRM reports.
const LEAD_ACTIONS: [&str; 4] = ["status", "update", "create", "add"];

/// One custom field of a lead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub name: Option<String>,
    pub value: Option<String>,
    #[serde(rename = "enum")]
    pub enum_id: Option<i64>,
}

/// Parsed, immutable view of a lead webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookLead {
    pub lead_id: Option<LeadId>,
    pub pipeline_id: Option<PipelineId>,
    pub new_status_id: Option<StatusId>,
    pub updated_at: Option<i64>,
    pub custom_fields: BTreeMap<i64, CustomFieldValue>,
    pub tags: BTreeMap<i64, String>,
}

impl WebhookLead {
    pub fn parse(payload: &[u8]) -> Self {
        let mut lead = WebhookLead::default();
        let mut fields: BTreeMap<String, PartialField> = BTreeMap::new();
        let mut tags: BTreeMap<String, PartialTag> = BTreeMap::new();

        for (key, value) in url::form_urlencoded::parse(payload) {
            let Some(segments) = split_key(&key) else {
                continue;
            };
            let Some(target) = classify(&segments) else {
                continue;
            };
            let value = value.trim();
            match target {
                LeadKey::LeadId => set_once(&mut lead.lead_id, value.parse().ok().map(LeadId::new)),
                LeadKey::StatusId => {
                    set_once(&mut lead.new_status_id, value.parse().ok().map(StatusId::new))
                }
                LeadKey::PipelineId => {
                    set_once(&mut lead.pipeline_id, value.parse().ok().map(PipelineId::new))
                }
                LeadKey::UpdatedAt => set_once(&mut lead.updated_at, value.parse().ok()),
                LeadKey::Field(index, part) => {
                    let entry = fields.entry(index.to_string()).or_default();
                    match part {
                        FieldPart::Id => set_once(&mut entry.id, value.parse().ok()),
                        FieldPart::Name => set_once(&mut entry.name, Some(value.to_string())),
                        FieldPart::Value => set_once(&mut entry.value, Some(value.to_string())),
                        FieldPart::Enum => set_once(&mut entry.enum_id, value.parse().ok()),
                    }
                }
                LeadKey::Tag(index, part) => {
                    let entry = tags.entry(index.to_string()).or_default();
                    match part {
                        TagPart::Id => set_once(&mut entry.id, value.parse().ok()),
                        TagPart::Name => set_once(&mut entry.name, Some(value.to_string())),
                    }
                }
            }
        }

        lead.custom_fields = fields
            .into_values()
            .filter_map(|f| {
                let id = f.id?;
                Some((
                    id,
                    CustomFieldValue {
                        name: f.name,
                        value: f.value,
                        enum_id: f.enum_id,
                    },
                ))
            })
            .collect();
        lead.tags = tags
            .into_values()
            .filter_map(|t| Some((t.id?, t.name.unwrap_or_default())))
            .collect();
        lead
    }

    pub fn field(&self, id: i64) -> Option<&CustomFieldValue> {
        self.custom_fields.get(&id)
    }

    /// Non-empty value of a custom field.
    pub fn field_value(&self, id: i64) -> Option<&str> {
        self.field(id)
            .and_then(|f| f.value.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn field_enum(&self, id: i64) -> Option<i64> {
        self.field(id).and_then(|f| f.enum_id)
    }

    pub fn has_tag(&self, id: i64) -> bool {
        self.tags.contains_key(&id)
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.values().cloned().collect()
    }
}

/// Constant-time secret comparison.
pub fn verify_secret(provided: &str, expected: &str) -> bool {
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

#[derive(Default)]
struct PartialField {
    id: Option<i64>,
    name: Option<String>,
    value: Option<String>,
    enum_id: Option<i64>,
}

#[derive(Default)]
struct PartialTag {
    id: Option<i64>,
    name: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum FieldPart {
    Id,
    Name,
    Value,
    Enum,
}

#[derive(Debug, PartialEq, Eq)]
enum TagPart {
    Id,
    Name,
}

#[derive(Debug, PartialEq, Eq)]
enum LeadKey<'a> {
    LeadId,
    StatusId,
    PipelineId,
    UpdatedAt,
    Field(&'a str, FieldPart),
    Tag(&'a str, TagPart),
}

/// `a[b][c]` -> `["a", "b", "c"]`; `None` for malformed keys.
fn split_key(key: &str) -> Option<Vec<&str>> {
    let (head, mut rest) = match key.find('[') {
        Some(i) => (&key[..i], &key[i..]),
        None => (key, ""),
    };
    let mut segments = vec![head];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        segments.push(&inner[..close]);
        rest = &inner[close + 1..];
    }
    Some(segments)
}

fn classify<'a>(segments: &[&'a str]) -> Option<LeadKey<'a>> {
    let (action, tail) = match segments {
        ["leads", action, "0", tail @ ..] => (*action, tail),
        _ => return None,
    };
    if !LEAD_ACTIONS.contains(&action) {
        return None;
    }
    let key = match tail {
        ["id"] => LeadKey::LeadId,
        ["status_id"] => LeadKey::StatusId,
        ["pipeline_id"] => LeadKey::PipelineId,
        ["updated_at"] => LeadKey::UpdatedAt,
        ["custom_fields", n, "id"] => LeadKey::Field(*n, FieldPart::Id),
        ["custom_fields", n, "name"] => LeadKey::Field(*n, FieldPart::Name),
        ["custom_fields", n, "values", _, "value"] => LeadKey::Field(*n, FieldPart::Value),
        ["custom_fields", n, "values", _, "enum"] => LeadKey::Field(*n, FieldPart::Enum),
        ["tags", n, "id"] => LeadKey::Tag(*n, TagPart::Id),
        ["tags", n, "name"] => LeadKey::Tag(*n, TagPart::Name),
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "leads%5Bstatus%5D%5B0%5D%5Bid%5D=555\
&leads%5Bstatus%5D%5B0%5D%5Bstatus_id%5D=21197641\
&leads%5Bstatus%5D%5B0%5D%5Bpipeline_id%5D=1305043\
&leads%5Bstatus%5D%5B0%5D%5Baccount_id%5D=28800001\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B0%5D%5Bid%5D=363971\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B0%5D%5Bname%5D=%D0%9E%D0%B1%D1%8A%D0%B5%D0%BA%D1%82\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B0%5D%5Bvalues%5D%5B0%5D%5Bvalue%5D=12345\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B1%5D%5Bid%5D=596489\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B1%5D%5Bvalues%5D%5B0%5D%5Benum%5D=777\
&leads%5Bstatus%5D%5B0%5D%5Bcustom_fields%5D%5B1%5D%5Bvalues%5D%5B0%5D%5Bvalue%5D=Project+One\
&leads%5Bstatus%5D%5B0%5D%5Btags%5D%5B0%5D%5Bid%5D=748608\
&leads%5Bstatus%5D%5B0%5D%5Btags%5D%5B0%5D%5Bname%5D=fast";

    #[test]
    fn parses_lead_fields_and_tags() {
        let lead = WebhookLead::parse(PAYLOAD.as_bytes());
        assert_eq!(lead.lead_id, Some(LeadId::new(555)));
        assert_eq!(lead.new_status_id, Some(StatusId::new(21197641)));
        assert_eq!(lead.pipeline_id, Some(PipelineId::new(1305043)));
        assert_eq!(lead.field_value(363971), Some("12345"));
        assert_eq!(lead.field(363971).unwrap().name.as_deref(), Some("Объект"));
        assert_eq!(lead.field_enum(596489), Some(777));
        assert_eq!(lead.field_value(596489), Some("Project One"));
        assert!(lead.has_tag(748608));
        assert_eq!(lead.tag_names(), vec!["fast".to_string()]);
    }

    #[test]
    fn ignores_lookalike_keys() {
        let lead = WebhookLead::parse(
            b"leads[status][0][account_id]=1&leads[status][0][type_id]=2&leads[status][0][id]=3",
        );
        assert_eq!(lead.lead_id, Some(LeadId::new(3)));
        assert!(lead.custom_fields.is_empty());
    }

    #[test]
    fn accepts_every_lead_action() {
        for action in LEAD_ACTIONS {
            let body = format!("leads[{action}][0][id]=10&leads[{action}][0][pipeline_id]=20");
            let lead = WebhookLead::parse(body.as_bytes());
            assert_eq!(lead.lead_id, Some(LeadId::new(10)));
            assert_eq!(lead.pipeline_id, Some(PipelineId::new(20)));
        }
        let lead = WebhookLead::parse(b"leads[delete][0][id]=10");
        assert_eq!(lead.lead_id, None);
    }

    #[test]
    fn unparseable_values_leave_fields_absent() {
        let lead = WebhookLead::parse(
            b"leads[update][0][id]=abc&leads[update][0][custom_fields][0][name]=no-id&garbage",
        );
        assert_eq!(lead, WebhookLead::default());
    }

    #[test]
    fn split_key_rejects_unbalanced_brackets() {
        assert_eq!(split_key("a[b][c]"), Some(vec!["a", "b", "c"]));
        assert_eq!(split_key("a[b"), None);
        assert_eq!(split_key("a[b]x"), None);
    }

    #[test]
    fn secret_comparison() {
        assert!(verify_secret("s3cret", "s3cret"));
        assert!(!verify_secret("s3cret", "s3creT"));
        assert!(!verify_secret("s3cret", "s3cret!"));
    }
}
