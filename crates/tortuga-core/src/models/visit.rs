//! Visit models: one clinic-day session linking the medical and dental
//! service lines for a patient.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::sync::{now_millis, SyncMetadata};

/// Alphabet for short codes. Visually ambiguous characters (0/O, 1/I) are
/// left out so codes survive being read aloud or hand-copied.
const SHORT_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of significant characters in a short code.
pub const SHORT_CODE_LEN: usize = 6;

/// Visit lifecycle. Variants are declared in lifecycle order; a visit only
/// ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VisitStatus {
    Open,
    InProgress,
    Complete,
    Synced,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Open => "open",
            VisitStatus::InProgress => "in-progress",
            VisitStatus::Complete => "complete",
            VisitStatus::Synced => "synced",
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle order.
    pub fn can_advance_to(&self, next: VisitStatus) -> bool {
        next >= *self
    }

    /// Intake forms are editable until the visit is complete.
    pub fn accepts_intake_edits(&self) -> bool {
        *self < VisitStatus::Complete
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(VisitStatus::Open),
            "in-progress" => Ok(VisitStatus::InProgress),
            "complete" => Ok(VisitStatus::Complete),
            "synced" => Ok(VisitStatus::Synced),
            other => Err(format!("Unknown visit status: {}", other)),
        }
    }
}

/// Service lines a visit can touch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Medical,
    Dental,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Medical => "medical",
            ServiceKind::Dental => "dental",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one service line within a visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLine {
    pub touched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl ServiceLine {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Serialized into the `services` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VisitServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medical: Option<ServiceLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dental: Option<ServiceLine>,
}

impl VisitServices {
    pub fn line(&self, kind: ServiceKind) -> Option<&ServiceLine> {
        match kind {
            ServiceKind::Medical => self.medical.as_ref(),
            ServiceKind::Dental => self.dental.as_ref(),
        }
    }

    /// Mutable access to a line, creating an untouched entry if absent.
    pub fn line_mut(&mut self, kind: ServiceKind) -> &mut ServiceLine {
        let slot = match kind {
            ServiceKind::Medical => &mut self.medical,
            ServiceKind::Dental => &mut self.dental,
        };
        slot.get_or_insert_with(ServiceLine::default)
    }

    pub fn is_touched(&self, kind: ServiceKind) -> bool {
        self.line(kind).map(|l| l.touched).unwrap_or(false)
    }
}

/// A clinic visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    /// UUID v4
    pub visit_id: String,
    pub patient_id: String,
    /// Clinic / mission session
    pub clinic_id: String,
    pub status: VisitStatus,
    pub services: VisitServices,
    /// e.g. `K3F-72B`
    pub short_code: String,
    /// ms epoch
    pub opened_at: i64,
    /// ms epoch
    pub updated_at: i64,
    #[serde(flatten)]
    pub sync: SyncMetadata,
}

/// Parameters for opening a visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewVisit {
    pub patient_id: String,
    pub clinic_id: String,
}

impl NewVisit {
    pub fn new(patient_id: impl Into<String>, clinic_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            clinic_id: clinic_id.into(),
        }
    }
}

impl Visit {
    /// Open a new visit with the given short code.
    pub fn new(params: &NewVisit, short_code: String, origin_tablet: &str) -> Self {
        let now = now_millis();
        Self {
            visit_id: uuid::Uuid::new_v4().to_string(),
            patient_id: params.patient_id.clone(),
            clinic_id: params.clinic_id.clone(),
            status: VisitStatus::Open,
            services: VisitServices::default(),
            short_code,
            opened_at: now,
            updated_at: now,
            sync: SyncMetadata::new(origin_tablet),
        }
    }
}

/// Generate a short code of the form `XXX-XXX`.
pub fn generate_short_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(SHORT_CODE_LEN + 1);
    for i in 0..SHORT_CODE_LEN {
        if i == SHORT_CODE_LEN / 2 {
            code.push('-');
        }
        let idx = rng.gen_range(0..SHORT_CODE_ALPHABET.len());
        code.push(SHORT_CODE_ALPHABET[idx] as char);
    }
    code
}

/// Canonical form of a user-typed short code: uppercase, dash restored.
///
/// Returns `None` if the input does not contain exactly six alphanumeric
/// characters.
pub fn normalize_short_code(input: &str) -> Option<String> {
    let chars: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if chars.len() != SHORT_CODE_LEN || !chars.iter().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let (head, tail) = chars.split_at(SHORT_CODE_LEN / 2);
    Some(format!(
        "{}-{}",
        head.iter().collect::<String>(),
        tail.iter().collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_status_ordering() {
        assert!(VisitStatus::Open.can_advance_to(VisitStatus::InProgress));
        assert!(VisitStatus::Open.can_advance_to(VisitStatus::Complete));
        assert!(VisitStatus::Complete.can_advance_to(VisitStatus::Complete));
        assert!(!VisitStatus::Complete.can_advance_to(VisitStatus::InProgress));
        assert!(!VisitStatus::Synced.can_advance_to(VisitStatus::Open));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            VisitStatus::Open,
            VisitStatus::InProgress,
            VisitStatus::Complete,
            VisitStatus::Synced,
        ] {
            assert_eq!(status.as_str().parse::<VisitStatus>().unwrap(), status);
        }
        assert!("closed".parse::<VisitStatus>().is_err());
    }

    #[test]
    fn test_services_json_shape() {
        let mut services = VisitServices::default();
        services.line_mut(ServiceKind::Dental).touched = true;

        let json = serde_json::to_string(&services).unwrap();
        assert_eq!(json, r#"{"dental":{"touched":true}}"#);

        let parsed: VisitServices =
            serde_json::from_str(r#"{"medical":{"touched":true,"completedAt":5,"recordId":"r1"}}"#)
                .unwrap();
        assert!(parsed.line(ServiceKind::Medical).unwrap().is_complete());
        assert!(!parsed.is_touched(ServiceKind::Dental));
    }

    #[test]
    fn test_normalize_short_code() {
        assert_eq!(normalize_short_code("k3f72b").as_deref(), Some("K3F-72B"));
        assert_eq!(normalize_short_code(" K3F-72B ").as_deref(), Some("K3F-72B"));
        assert_eq!(normalize_short_code("K3F-72"), None);
        assert_eq!(normalize_short_code("K3F-7?B"), None);
    }

    proptest! {
        #[test]
        fn generated_codes_are_well_formed(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let code = generate_short_code(&mut rng);
            prop_assert_eq!(code.len(), SHORT_CODE_LEN + 1);
            prop_assert_eq!(&code[3..4], "-");
            prop_assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| SHORT_CODE_ALPHABET.contains(&(c as u8))));
            prop_assert_eq!(normalize_short_code(&code), Some(code.clone()));
        }
    }
}
