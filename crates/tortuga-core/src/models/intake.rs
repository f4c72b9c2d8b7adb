//! Intake form records (medical and dental).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::sync::{now_millis, SyncMetadata};
use super::visit::ServiceKind;

/// Canonical payload for a form with no answers yet.
pub const EMPTY_FORM: &str = "{}";

/// Which intake table a record lives in. Both tables share one shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IntakeKind {
    Medical,
    Dental,
}

impl IntakeKind {
    pub const ALL: [IntakeKind; 2] = [IntakeKind::Medical, IntakeKind::Dental];

    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            IntakeKind::Medical => "medical_intake_records",
            IntakeKind::Dental => "dental_intake_records",
        }
    }

    /// The visit service line this form belongs to.
    pub fn service(&self) -> ServiceKind {
        match self {
            IntakeKind::Medical => ServiceKind::Medical,
            IntakeKind::Dental => ServiceKind::Dental,
        }
    }
}

impl fmt::Display for IntakeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service().as_str())
    }
}

impl FromStr for IntakeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical" => Ok(IntakeKind::Medical),
            "dental" => Ok(IntakeKind::Dental),
            other => Err(format!("Unknown intake kind: {}", other)),
        }
    }
}

/// A serialized intake form attached to a visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRecord {
    /// UUID v4
    pub record_id: String,
    pub kind: IntakeKind,
    pub visit_id: String,
    /// Opaque JSON form payload
    pub form_data: String,
    /// ms epoch
    pub created_at: i64,
    /// ms epoch
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMetadata,
}

impl IntakeRecord {
    pub fn new(kind: IntakeKind, visit_id: String, form_data: String, origin_tablet: &str) -> Self {
        let now = now_millis();
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            kind,
            visit_id,
            form_data,
            created_at: now,
            updated_at: now,
            sync: SyncMetadata::new(origin_tablet),
        }
    }

    /// Parse the stored payload.
    pub fn form_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.form_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tables() {
        assert_eq!(IntakeKind::Medical.table(), "medical_intake_records");
        assert_eq!(IntakeKind::Dental.table(), "dental_intake_records");
        assert_eq!(IntakeKind::Dental.service(), ServiceKind::Dental);
        assert_eq!("dental".parse::<IntakeKind>().unwrap(), IntakeKind::Dental);
    }

    #[test]
    fn test_form_json() {
        let record = IntakeRecord::new(
            IntakeKind::Medical,
            "visit-1".into(),
            r#"{"bloodPressure":"120/80"}"#.into(),
            "tablet-A",
        );
        assert_eq!(record.form_json().unwrap()["bloodPressure"], "120/80");
        assert_eq!(record.record_id.len(), 36);
    }
}
