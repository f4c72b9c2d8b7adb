//! Visit repository.

use rusqlite::types::Value;
use rusqlite::Row;
use tracing::{debug, warn};

use super::{text, StorageGateway, StoreError, StoreResult};
use crate::models::{
    generate_short_code, normalize_short_code, now_millis, NewVisit, ServiceKind, SyncMetadata,
    Visit, VisitServices, VisitStatus,
};

const VISIT_COLUMNS: &str = "visitId, patientId, clinicId, status, services, shortCode, \
     openedAt, updatedAt, originTablet, lastSyncedAt, syncVersion";

/// Typed access to the `visits` table.
pub struct VisitRepository<'g> {
    gateway: &'g StorageGateway,
}

impl<'g> VisitRepository<'g> {
    pub fn new(gateway: &'g StorageGateway) -> Self {
        Self { gateway }
    }

    /// Open a visit for an existing patient with a freshly generated short
    /// code.
    pub fn create(&self, params: &NewVisit) -> StoreResult<Visit> {
        let mut rng = rand::thread_rng();
        self.create_with_code_source(params, || generate_short_code(&mut rng))
    }

    /// Open a visit, drawing short codes from `next_code` until one is
    /// unused or the configured attempt bound is reached.
    ///
    /// Codes are stored in canonical `XXX-XXX` form; codes that do not
    /// normalize count as a failed attempt. Only a UNIQUE violation is
    /// retried, any other write failure is returned as is.
    pub fn create_with_code_source<F>(&self, params: &NewVisit, mut next_code: F) -> StoreResult<Visit>
    where
        F: FnMut() -> String,
    {
        if params.clinic_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument("clinic id is required".into()));
        }
        if self.gateway.patients().get(&params.patient_id)?.is_none() {
            return Err(StoreError::NotFound(format!("patient {}", params.patient_id)));
        }

        let attempts = self.gateway.config().short_code_attempts;
        for attempt in 1..=attempts {
            let raw = next_code();
            let Some(code) = normalize_short_code(&raw) else {
                debug!(attempt, code = %raw, "malformed short code, regenerating");
                continue;
            };
            if self.get_by_short_code(&code)?.is_some() {
                debug!(attempt, code = %code, "short code collision, regenerating");
                continue;
            }

            let visit = Visit::new(params, code, self.gateway.tablet_id());
            match self.insert(&visit) {
                Ok(()) => return Ok(visit),
                Err(e) if e.is_unique_violation() => {
                    debug!(attempt, code = %visit.short_code, "short code rejected on insert, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(attempts, "could not find an unused short code");
        Err(StoreError::CodeGenerationExhausted { attempts })
    }

    /// Insert a fully-formed visit. Duplicate ids or short codes fail with
    /// a write error.
    pub fn insert(&self, visit: &Visit) -> StoreResult<()> {
        let services = serde_json::to_string(&visit.services)?;
        self.gateway.execute(
            r#"
            INSERT INTO visits (
                visitId, patientId, clinicId, status, services, shortCode,
                openedAt, updatedAt, originTablet, lastSyncedAt, syncVersion
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            &[
                text(&visit.visit_id),
                text(&visit.patient_id),
                text(&visit.clinic_id),
                text(visit.status.as_str()),
                Value::Text(services),
                text(&visit.short_code),
                Value::Integer(visit.opened_at),
                Value::Integer(visit.updated_at),
                text(&visit.sync.origin_tablet),
                Value::Integer(visit.sync.last_synced_at),
                Value::Integer(visit.sync.sync_version),
            ],
        )?;
        Ok(())
    }

    /// Get a visit by id.
    pub fn get(&self, visit_id: &str) -> StoreResult<Option<Visit>> {
        self.gateway
            .query_one(
                &format!("SELECT {VISIT_COLUMNS} FROM visits WHERE visitId = ?1"),
                &[text(visit_id)],
                visit_row,
            )?
            .map(Visit::try_from)
            .transpose()
    }

    /// Look a visit up by its short code; accepts lowercase and a missing
    /// dash.
    pub fn get_by_short_code(&self, code: &str) -> StoreResult<Option<Visit>> {
        let Some(code) = normalize_short_code(code) else {
            return Ok(None);
        };
        self.gateway
            .query_one(
                &format!("SELECT {VISIT_COLUMNS} FROM visits WHERE shortCode = ?1"),
                &[Value::Text(code)],
                visit_row,
            )?
            .map(Visit::try_from)
            .transpose()
    }

    /// All visits for a patient, newest first.
    pub fn list_for_patient(&self, patient_id: &str) -> StoreResult<Vec<Visit>> {
        self.list_where("patientId = ?1 ORDER BY openedAt DESC", &[text(patient_id)])
    }

    pub fn list_by_status(&self, status: VisitStatus) -> StoreResult<Vec<Visit>> {
        self.list_where("status = ?1 ORDER BY updatedAt DESC", &[text(status.as_str())])
    }

    /// Visits whose last sync predates `before` (0 = never synced).
    pub fn list_unsynced(&self, before: i64) -> StoreResult<Vec<Visit>> {
        self.list_where("lastSyncedAt < ?1 ORDER BY updatedAt", &[Value::Integer(before)])
    }

    fn list_where(&self, clause: &str, params: &[Value]) -> StoreResult<Vec<Visit>> {
        self.gateway
            .query_all(
                &format!("SELECT {VISIT_COLUMNS} FROM visits WHERE {clause}"),
                params,
                visit_row,
            )?
            .into_iter()
            .map(Visit::try_from)
            .collect()
    }

    /// Move a visit forward in its lifecycle. Moving to the current status
    /// is a no-op; moving backward is rejected.
    pub fn advance_status(&self, visit_id: &str, status: VisitStatus) -> StoreResult<Visit> {
        let visit = self.require(visit_id)?;
        if visit.status == status {
            return Ok(visit);
        }
        if !visit.status.can_advance_to(status) {
            return Err(StoreError::InvalidTransition {
                from: visit.status.to_string(),
                to: status.to_string(),
            });
        }
        self.save_state(&visit.visit_id, status, &visit.services)
    }

    /// Mark a service line as touched, moving an open visit to in-progress.
    pub fn touch_service(&self, visit_id: &str, kind: ServiceKind) -> StoreResult<Visit> {
        self.link_service(visit_id, kind, None)
    }

    /// Mark a service line touched and attach its intake record.
    pub(crate) fn link_service(
        &self,
        visit_id: &str,
        kind: ServiceKind,
        record_id: Option<&str>,
    ) -> StoreResult<Visit> {
        let visit = self.require(visit_id)?;
        let mut services = visit.services.clone();
        let line = services.line_mut(kind);
        line.touched = true;
        if let Some(record_id) = record_id {
            line.record_id = Some(record_id.to_string());
        }
        let status = visit.status.max(VisitStatus::InProgress);
        self.save_state(&visit.visit_id, status, &services)
    }

    /// Stamp a touched service line as completed.
    pub fn complete_service(&self, visit_id: &str, kind: ServiceKind) -> StoreResult<Visit> {
        let visit = self.require(visit_id)?;
        if !visit.services.is_touched(kind) {
            return Err(StoreError::InvalidArgument(format!(
                "{} service was never started for visit {}",
                kind, visit_id
            )));
        }
        let mut services = visit.services.clone();
        services.line_mut(kind).completed_at = Some(now_millis());
        self.save_state(&visit.visit_id, visit.status, &services)
    }

    /// Record a remote acknowledgment. Leaves `syncVersion` unchanged.
    pub fn mark_synced(&self, visit_id: &str, synced_at: i64) -> StoreResult<bool> {
        let rows_affected = self.gateway.execute(
            "UPDATE visits SET lastSyncedAt = ?2 WHERE visitId = ?1",
            &[text(visit_id), Value::Integer(synced_at)],
        )?;
        Ok(rows_affected > 0)
    }

    fn require(&self, visit_id: &str) -> StoreResult<Visit> {
        self.get(visit_id)?
            .ok_or_else(|| StoreError::NotFound(format!("visit {}", visit_id)))
    }

    fn save_state(
        &self,
        visit_id: &str,
        status: VisitStatus,
        services: &VisitServices,
    ) -> StoreResult<Visit> {
        let services_json = serde_json::to_string(services)?;
        self.gateway.execute(
            r#"
            UPDATE visits SET
                status = ?2,
                services = ?3,
                updatedAt = ?4,
                syncVersion = syncVersion + 1
            WHERE visitId = ?1
            "#,
            &[
                text(visit_id),
                text(status.as_str()),
                Value::Text(services_json),
                Value::Integer(now_millis()),
            ],
        )?;
        self.require(visit_id)
    }
}

/// Intermediate row struct for database mapping.
struct VisitRow {
    visit_id: String,
    patient_id: String,
    clinic_id: String,
    status: String,
    services: String,
    short_code: String,
    opened_at: i64,
    updated_at: i64,
    origin_tablet: String,
    last_synced_at: i64,
    sync_version: i64,
}

fn visit_row(row: &Row<'_>) -> rusqlite::Result<VisitRow> {
    Ok(VisitRow {
        visit_id: row.get(0)?,
        patient_id: row.get(1)?,
        clinic_id: row.get(2)?,
        status: row.get(3)?,
        services: row.get(4)?,
        short_code: row.get(5)?,
        opened_at: row.get(6)?,
        updated_at: row.get(7)?,
        origin_tablet: row.get(8)?,
        last_synced_at: row.get(9)?,
        sync_version: row.get(10)?,
    })
}

impl TryFrom<VisitRow> for Visit {
    type Error = StoreError;

    fn try_from(row: VisitRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<VisitStatus>()
            .map_err(StoreError::InvalidArgument)?;
        let services: VisitServices = if row.services.trim().is_empty() {
            VisitServices::default()
        } else {
            serde_json::from_str(&row.services)?
        };

        Ok(Visit {
            visit_id: row.visit_id,
            patient_id: row.patient_id,
            clinic_id: row.clinic_id,
            status,
            services,
            short_code: row.short_code,
            opened_at: row.opened_at,
            updated_at: row.updated_at,
            sync: SyncMetadata {
                origin_tablet: row.origin_tablet,
                last_synced_at: row.last_synced_at,
                sync_version: row.sync_version,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::models::NewPatient;

    fn setup() -> (StorageGateway, String) {
        let gateway =
            StorageGateway::open_in_memory(StoreConfig::new("unused.db", "tablet-B", "B")).unwrap();
        let patient = gateway
            .patients()
            .create(&NewPatient::new("Carlos", "Pérez", "1975-03-14"))
            .unwrap();
        (gateway, patient.patient_id)
    }

    fn fixed_codes(codes: &[&str]) -> impl FnMut() -> String {
        let mut codes: Vec<String> = codes.iter().rev().map(|c| c.to_string()).collect();
        move || codes.pop().unwrap_or_else(|| "ZZZ-ZZZ".to_string())
    }

    #[test]
    fn test_create_visit() {
        let (gateway, patient_id) = setup();
        let visit = gateway
            .visits()
            .create(&NewVisit::new(&patient_id, "clinic-2024-03"))
            .unwrap();

        assert_eq!(visit.status, VisitStatus::Open);
        assert_eq!(visit.sync.sync_version, 1);
        assert_eq!(visit.sync.origin_tablet, "tablet-B");
        assert!(normalize_short_code(&visit.short_code).is_some());

        let fetched = gateway.visits().get(&visit.visit_id).unwrap().unwrap();
        assert_eq!(fetched, visit);
        let by_code = gateway
            .visits()
            .get_by_short_code(&visit.short_code.to_lowercase())
            .unwrap()
            .unwrap();
        assert_eq!(by_code.visit_id, visit.visit_id);
    }

    #[test]
    fn test_unknown_patient_rejected() {
        let (gateway, _) = setup();
        let result = gateway.visits().create(&NewVisit::new("PT-B-999", "clinic"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_collision_regenerates() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let params = NewVisit::new(&patient_id, "clinic");

        let first = repo
            .create_with_code_source(&params, fixed_codes(&["K3F-72B"]))
            .unwrap();
        let second = repo
            .create_with_code_source(&params, fixed_codes(&["K3F-72B", "K3F-72B", "M8Q-4RT"]))
            .unwrap();

        assert_eq!(first.short_code, "K3F-72B");
        assert_eq!(second.short_code, "M8Q-4RT");
    }

    #[test]
    fn test_supplied_codes_are_normalized() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let params = NewVisit::new(&patient_id, "clinic");
        repo.create_with_code_source(&params, fixed_codes(&["K3F-72B"]))
            .unwrap();

        // Lowercase undashed duplicate, then junk, then a fresh code.
        let visit = repo
            .create_with_code_source(&params, fixed_codes(&["k3f72b", "??", "m8q4rt"]))
            .unwrap();
        assert_eq!(visit.short_code, "M8Q-4RT");
        assert_eq!(
            repo.get_by_short_code("M8Q-4RT").unwrap().unwrap().visit_id,
            visit.visit_id
        );
    }

    #[test]
    fn test_collision_exhaustion() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let params = NewVisit::new(&patient_id, "clinic");
        repo.create_with_code_source(&params, fixed_codes(&["AAA-AAA"]))
            .unwrap();

        let result = repo.create_with_code_source(&params, || "AAA-AAA".to_string());
        assert!(matches!(
            result,
            Err(StoreError::CodeGenerationExhausted { attempts: 5 })
        ));
    }

    #[test]
    fn test_duplicate_short_code_insert_is_write_error() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let params = NewVisit::new(&patient_id, "clinic");

        let first = Visit::new(&params, "K3F-72B".into(), "tablet-B");
        repo.insert(&first).unwrap();

        let second = Visit::new(&params, "K3F-72B".into(), "tablet-B");
        let err = repo.insert(&second).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(err.is_constraint_violation());
        assert!(err.is_unique_violation());

        // The original row is untouched.
        let stored = repo.get_by_short_code("K3F-72B").unwrap().unwrap();
        assert_eq!(stored.visit_id, first.visit_id);
        assert!(repo.get(&second.visit_id).unwrap().is_none());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let visit = repo.create(&NewVisit::new(&patient_id, "clinic")).unwrap();

        let visit = repo.advance_status(&visit.visit_id, VisitStatus::Complete).unwrap();
        assert_eq!(visit.status, VisitStatus::Complete);
        assert_eq!(visit.sync.sync_version, 2);

        let same = repo.advance_status(&visit.visit_id, VisitStatus::Complete).unwrap();
        assert_eq!(same.sync.sync_version, 2);

        let result = repo.advance_status(&visit.visit_id, VisitStatus::InProgress);
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_service_lines() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let visit = repo.create(&NewVisit::new(&patient_id, "clinic")).unwrap();

        assert!(matches!(
            repo.complete_service(&visit.visit_id, ServiceKind::Dental),
            Err(StoreError::InvalidArgument(_))
        ));

        let visit = repo.touch_service(&visit.visit_id, ServiceKind::Dental).unwrap();
        assert_eq!(visit.status, VisitStatus::InProgress);
        assert!(visit.services.is_touched(ServiceKind::Dental));
        assert!(!visit.services.is_touched(ServiceKind::Medical));

        let visit = repo.complete_service(&visit.visit_id, ServiceKind::Dental).unwrap();
        assert!(visit.services.line(ServiceKind::Dental).unwrap().is_complete());
        assert_eq!(visit.sync.sync_version, 3);
    }

    #[test]
    fn test_lists_and_sync() {
        let (gateway, patient_id) = setup();
        let repo = gateway.visits();
        let a = repo.create(&NewVisit::new(&patient_id, "clinic")).unwrap();
        let b = repo.create(&NewVisit::new(&patient_id, "clinic")).unwrap();
        repo.advance_status(&b.visit_id, VisitStatus::InProgress).unwrap();

        assert_eq!(repo.list_for_patient(&patient_id).unwrap().len(), 2);
        let open = repo.list_by_status(VisitStatus::Open).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].visit_id, a.visit_id);

        assert!(repo.mark_synced(&a.visit_id, 10_000).unwrap());
        let unsynced = repo.list_unsynced(10_000).unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].visit_id, b.visit_id);
        assert_eq!(repo.get(&a.visit_id).unwrap().unwrap().sync.sync_version, 1);
    }
}
