//! Intake record repository, shared by the medical and dental tables.

use rusqlite::types::Value;
use rusqlite::Row;

use super::{text, StorageGateway, StoreError, StoreResult};
use crate::models::{now_millis, IntakeKind, IntakeRecord, SyncMetadata, EMPTY_FORM};

const RECORD_COLUMNS: &str =
    "recordId, visitId, formData, createdAt, updatedAt, originTablet, lastSyncedAt, syncVersion";

/// Typed access to one intake table.
pub struct IntakeRepository<'g> {
    gateway: &'g StorageGateway,
    kind: IntakeKind,
}

impl<'g> IntakeRepository<'g> {
    pub fn new(gateway: &'g StorageGateway, kind: IntakeKind) -> Self {
        Self { gateway, kind }
    }

    /// Start a form for a visit. The visit's service line is marked touched
    /// and linked to the new record in the same transaction. A visit holds
    /// at most one record per service line.
    pub fn create(&self, visit_id: &str, form_data: &str) -> StoreResult<IntakeRecord> {
        let form_data = checked_form(form_data)?;

        self.gateway.transaction(|gw| {
            let visits = gw.visits();
            let visit = visits
                .get(visit_id)?
                .ok_or_else(|| StoreError::NotFound(format!("visit {}", visit_id)))?;
            if !visit.status.accepts_intake_edits() {
                return Err(StoreError::InvalidArgument(format!(
                    "visit {} is {}; intake is closed",
                    visit_id, visit.status
                )));
            }
            let linked = visit
                .services
                .line(self.kind.service())
                .and_then(|line| line.record_id.as_deref());
            if let Some(existing) = linked {
                return Err(StoreError::InvalidArgument(format!(
                    "visit {} already has {} record {}",
                    visit_id, self.kind, existing
                )));
            }

            let record = IntakeRecord::new(
                self.kind,
                visit.visit_id.clone(),
                form_data,
                gw.tablet_id(),
            );
            gw.execute(
                &format!(
                    "INSERT INTO {} ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    self.kind.table()
                ),
                &[
                    text(&record.record_id),
                    text(&record.visit_id),
                    text(&record.form_data),
                    Value::Integer(record.created_at),
                    Value::Integer(record.updated_at),
                    text(&record.sync.origin_tablet),
                    Value::Integer(record.sync.last_synced_at),
                    Value::Integer(record.sync.sync_version),
                ],
            )?;

            visits.link_service(&visit.visit_id, self.kind.service(), Some(&record.record_id))?;
            Ok(record)
        })
    }

    pub fn get(&self, record_id: &str) -> StoreResult<Option<IntakeRecord>> {
        let kind = self.kind;
        self.gateway.query_one(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {} WHERE recordId = ?1",
                kind.table()
            ),
            &[text(record_id)],
            |row| record_from_row(kind, row),
        )
    }

    /// All records of this kind for a visit, oldest first.
    pub fn get_for_visit(&self, visit_id: &str) -> StoreResult<Vec<IntakeRecord>> {
        self.list_where("visitId = ?1 ORDER BY createdAt", &[text(visit_id)])
    }

    /// Replace the form payload. Rejected once the visit is complete.
    pub fn update_form(&self, record_id: &str, form_data: &str) -> StoreResult<IntakeRecord> {
        let form_data = checked_form(form_data)?;
        let record = self
            .get(record_id)?
            .ok_or_else(|| StoreError::NotFound(format!("{} record {}", self.kind, record_id)))?;

        if let Some(visit) = self.gateway.visits().get(&record.visit_id)? {
            if !visit.status.accepts_intake_edits() {
                return Err(StoreError::InvalidArgument(format!(
                    "visit {} is {}; intake is closed",
                    visit.visit_id, visit.status
                )));
            }
        }

        self.gateway.execute(
            &format!(
                "UPDATE {} SET formData = ?2, updatedAt = ?3, syncVersion = syncVersion + 1 \
                 WHERE recordId = ?1",
                self.kind.table()
            ),
            &[text(record_id), Value::Text(form_data), Value::Integer(now_millis())],
        )?;

        self.get(record_id)?
            .ok_or_else(|| StoreError::NotFound(format!("{} record {}", self.kind, record_id)))
    }

    /// Records whose last sync predates `before` (0 = never synced).
    pub fn list_unsynced(&self, before: i64) -> StoreResult<Vec<IntakeRecord>> {
        self.list_where("lastSyncedAt < ?1 ORDER BY updatedAt", &[Value::Integer(before)])
    }

    /// Record a remote acknowledgment. Leaves `syncVersion` unchanged.
    pub fn mark_synced(&self, record_id: &str, synced_at: i64) -> StoreResult<bool> {
        let rows_affected = self.gateway.execute(
            &format!(
                "UPDATE {} SET lastSyncedAt = ?2 WHERE recordId = ?1",
                self.kind.table()
            ),
            &[text(record_id), Value::Integer(synced_at)],
        )?;
        Ok(rows_affected > 0)
    }

    fn list_where(&self, clause: &str, params: &[Value]) -> StoreResult<Vec<IntakeRecord>> {
        let kind = self.kind;
        self.gateway.query_all(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM {} WHERE {clause}",
                kind.table()
            ),
            params,
            |row| record_from_row(kind, row),
        )
    }
}

fn record_from_row(kind: IntakeKind, row: &Row<'_>) -> rusqlite::Result<IntakeRecord> {
    Ok(IntakeRecord {
        record_id: row.get(0)?,
        kind,
        visit_id: row.get(1)?,
        form_data: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        sync: SyncMetadata {
            origin_tablet: row.get(5)?,
            last_synced_at: row.get(6)?,
            sync_version: row.get(7)?,
        },
    })
}

/// Blank payloads become `{}`; anything else must be a JSON object.
fn checked_form(form_data: &str) -> StoreResult<String> {
    if form_data.trim().is_empty() {
        return Ok(EMPTY_FORM.to_string());
    }
    match serde_json::from_str::<serde_json::Value>(form_data) {
        Ok(serde_json::Value::Object(_)) => Ok(form_data.to_string()),
        Ok(_) => Err(StoreError::InvalidArgument(
            "form data must be a JSON object".into(),
        )),
        Err(e) => Err(StoreError::InvalidArgument(format!("form data is not JSON: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::models::{NewPatient, NewVisit, ServiceKind, VisitStatus};

    fn setup() -> (StorageGateway, String) {
        let gateway =
            StorageGateway::open_in_memory(StoreConfig::new("unused.db", "tablet-A", "A")).unwrap();
        let patient = gateway
            .patients()
            .create(&NewPatient::new("Ana", "Gómez", "1990-01-01"))
            .unwrap();
        let visit = gateway
            .visits()
            .create(&NewVisit::new(&patient.patient_id, "clinic"))
            .unwrap();
        (gateway, visit.visit_id)
    }

    #[test]
    fn test_create_links_visit() {
        let (gateway, visit_id) = setup();
        let record = gateway
            .intake(IntakeKind::Dental)
            .create(&visit_id, r#"{"chiefComplaint":"toothache"}"#)
            .unwrap();

        assert_eq!(record.sync.sync_version, 1);
        assert_eq!(record.sync.last_synced_at, 0);

        let visit = gateway.visits().get(&visit_id).unwrap().unwrap();
        assert_eq!(visit.status, VisitStatus::InProgress);
        let line = visit.services.line(ServiceKind::Dental).unwrap();
        assert!(line.touched);
        assert_eq!(line.record_id.as_deref(), Some(record.record_id.as_str()));

        // Lives in the dental table only.
        assert!(gateway
            .intake(IntakeKind::Medical)
            .get(&record.record_id)
            .unwrap()
            .is_none());
        assert_eq!(
            gateway.intake(IntakeKind::Dental).get_for_visit(&visit_id).unwrap(),
            vec![record]
        );
    }

    #[test]
    fn test_second_record_for_same_line_rejected() {
        let (gateway, visit_id) = setup();
        let repo = gateway.intake(IntakeKind::Medical);
        let first = repo.create(&visit_id, r#"{"weightKg":70}"#).unwrap();

        let result = repo.create(&visit_id, "{}");
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert_eq!(repo.get_for_visit(&visit_id).unwrap(), vec![first.clone()]);

        let visit = gateway.visits().get(&visit_id).unwrap().unwrap();
        let line = visit.services.line(ServiceKind::Medical).unwrap();
        assert_eq!(line.record_id.as_deref(), Some(first.record_id.as_str()));
        assert_eq!(visit.sync.sync_version, 2);

        // The other service line is still free.
        gateway.intake(IntakeKind::Dental).create(&visit_id, "{}").unwrap();
    }

    #[test]
    fn test_create_for_missing_visit_rolls_back() {
        let (gateway, _) = setup();
        let result = gateway.intake(IntakeKind::Medical).create("no-such-visit", "{}");
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert!(gateway
            .intake(IntakeKind::Medical)
            .list_unsynced(i64::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_blank_form_is_empty_object() {
        let (gateway, visit_id) = setup();
        let record = gateway.intake(IntakeKind::Medical).create(&visit_id, "  ").unwrap();
        assert_eq!(record.form_data, EMPTY_FORM);

        let result = gateway.intake(IntakeKind::Medical).create(&visit_id, "[1,2]");
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_update_form_bumps_version_until_complete() {
        let (gateway, visit_id) = setup();
        let repo = gateway.intake(IntakeKind::Medical);
        let record = repo.create(&visit_id, "{}").unwrap();

        let updated = repo
            .update_form(&record.record_id, r#"{"allergies":["penicillin"]}"#)
            .unwrap();
        assert_eq!(updated.sync.sync_version, 2);
        assert_eq!(updated.form_json().unwrap()["allergies"][0], "penicillin");
        assert_eq!(updated.created_at, record.created_at);

        gateway
            .visits()
            .advance_status(&visit_id, VisitStatus::Complete)
            .unwrap();
        assert!(matches!(
            repo.update_form(&record.record_id, "{}"),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            repo.update_form("missing", "{}"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_synced_keeps_version() {
        let (gateway, visit_id) = setup();
        let repo = gateway.intake(IntakeKind::Dental);
        let record = repo.create(&visit_id, "{}").unwrap();

        assert!(repo.mark_synced(&record.record_id, 5_000).unwrap());
        assert!(!repo.mark_synced("missing", 5_000).unwrap());

        let stored = repo.get(&record.record_id).unwrap().unwrap();
        assert_eq!(stored.sync.last_synced_at, 5_000);
        assert_eq!(stored.sync.sync_version, 1);
        assert!(repo.list_unsynced(5_000).unwrap().is_empty());
        assert_eq!(repo.list_unsynced(5_001).unwrap().len(), 1);
    }
}
