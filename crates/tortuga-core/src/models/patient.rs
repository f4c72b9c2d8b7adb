//! Patient models.

use serde::{Deserialize, Serialize};

use super::sync::{now_millis, SyncMetadata};

/// A patient record created on one tablet and replicated to the others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    /// `PT-{tabletPrefix}-{sequence}`, e.g. `PT-A-001`
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    /// ISO date `YYYY-MM-DD`
    pub date_of_birth: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    /// ms epoch
    pub created_at: i64,
    /// ms epoch
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMetadata,
}

/// Fields supplied by the intake desk when registering a patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl NewPatient {
    /// Create registration fields with the required values.
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth: date_of_birth.into(),
            phone: None,
            notes: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl Patient {
    /// Build a fresh patient record from registration fields.
    pub fn new(patient_id: String, fields: &NewPatient, origin_tablet: &str) -> Self {
        let now = now_millis();
        Self {
            patient_id,
            first_name: fields.first_name.trim().to_string(),
            last_name: fields.last_name.trim().to_string(),
            date_of_birth: fields.date_of_birth.clone(),
            phone: normalize_optional(fields.phone.as_deref()),
            notes: normalize_optional(fields.notes.as_deref()),
            created_at: now,
            updated_at: now,
            sync: SyncMetadata::new(origin_tablet),
        }
    }
}

/// Format a patient identifier for `prefix` and `sequence`.
pub fn format_patient_id(prefix: &str, sequence: i64) -> String {
    format!("PT-{}-{:03}", prefix, sequence)
}

/// Empty or whitespace-only optional text is stored as NULL.
pub(crate) fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
