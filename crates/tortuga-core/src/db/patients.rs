//! Patient repository.

use rusqlite::types::Value;
use rusqlite::Row;

use super::{opt_text, text, StorageGateway, StoreError, StoreResult};
use crate::models::{format_patient_id, normalize_optional, now_millis, NewPatient, Patient, SyncMetadata};

/// Queries shorter than this fall back to a LIKE scan; the trigram index
/// needs at least three characters.
const MIN_INDEXED_QUERY_LEN: usize = 3;

const PATIENT_COLUMNS: &str = "patientId, firstName, lastName, dateOfBirth, phone, notes, \
     createdAt, updatedAt, originTablet, lastSyncedAt, syncVersion";

const PATIENT_COLUMNS_P: &str = "p.patientId, p.firstName, p.lastName, p.dateOfBirth, p.phone, \
     p.notes, p.createdAt, p.updatedAt, p.originTablet, p.lastSyncedAt, p.syncVersion";

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        patient_id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        date_of_birth: row.get(3)?,
        phone: row.get(4)?,
        notes: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        sync: SyncMetadata {
            origin_tablet: row.get(8)?,
            last_synced_at: row.get(9)?,
            sync_version: row.get(10)?,
        },
    })
}

/// Typed access to the `patients` table.
pub struct PatientRepository<'g> {
    gateway: &'g StorageGateway,
}

impl<'g> PatientRepository<'g> {
    pub fn new(gateway: &'g StorageGateway) -> Self {
        Self { gateway }
    }

    /// Register a patient under the next id for this tablet's prefix.
    pub fn create(&self, fields: &NewPatient) -> StoreResult<Patient> {
        validate(fields)?;
        let config = self.gateway.config();

        self.gateway.transaction(|gw| {
            let patient_id = next_patient_id(gw, &config.tablet_prefix)?;
            let patient = Patient::new(patient_id, fields, &config.tablet_id);

            gw.execute(
                r#"
                INSERT INTO patients (
                    patientId, firstName, lastName, dateOfBirth, phone, notes,
                    createdAt, updatedAt, originTablet, lastSyncedAt, syncVersion
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                &[
                    text(&patient.patient_id),
                    text(&patient.first_name),
                    text(&patient.last_name),
                    text(&patient.date_of_birth),
                    opt_text(patient.phone.as_deref()),
                    opt_text(patient.notes.as_deref()),
                    Value::Integer(patient.created_at),
                    Value::Integer(patient.updated_at),
                    text(&patient.sync.origin_tablet),
                    Value::Integer(patient.sync.last_synced_at),
                    Value::Integer(patient.sync.sync_version),
                ],
            )?;
            Ok(patient)
        })
    }

    /// Get a patient by id; `None` when absent.
    pub fn get(&self, patient_id: &str) -> StoreResult<Option<Patient>> {
        self.gateway.query_one(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE patientId = ?1"),
            &[text(patient_id)],
            patient_from_row,
        )
    }

    /// Apply a local edit to the business fields.
    ///
    /// Bumps `syncVersion` and `updatedAt`; origin and last-synced are left
    /// as stored regardless of what `patient` carries.
    pub fn update(&self, patient: &Patient) -> StoreResult<Patient> {
        validate(&NewPatient {
            first_name: patient.first_name.clone(),
            last_name: patient.last_name.clone(),
            date_of_birth: patient.date_of_birth.clone(),
            phone: patient.phone.clone(),
            notes: patient.notes.clone(),
        })?;

        let rows_affected = self.gateway.execute(
            r#"
            UPDATE patients SET
                firstName = ?2,
                lastName = ?3,
                dateOfBirth = ?4,
                phone = ?5,
                notes = ?6,
                updatedAt = ?7,
                syncVersion = syncVersion + 1
            WHERE patientId = ?1
            "#,
            &[
                text(&patient.patient_id),
                text(patient.first_name.trim()),
                text(patient.last_name.trim()),
                text(&patient.date_of_birth),
                opt_text(normalize_optional(patient.phone.as_deref()).as_deref()),
                opt_text(normalize_optional(patient.notes.as_deref()).as_deref()),
                Value::Integer(now_millis()),
            ],
        )?;
        if rows_affected == 0 {
            return Err(StoreError::NotFound(format!("patient {}", patient.patient_id)));
        }

        self.get(&patient.patient_id)?
            .ok_or_else(|| StoreError::NotFound(format!("patient {}", patient.patient_id)))
    }

    /// Case-insensitive substring search over first name, last name and
    /// phone. An empty query lists patients.
    pub fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<Patient>> {
        let query = query.trim();
        if query.is_empty() {
            return self.list_limited(limit);
        }

        if query.chars().count() >= MIN_INDEXED_QUERY_LEN {
            let phrase = format!("\"{}\"", query.replace('"', "\"\""));
            return self.gateway.query_all(
                &format!(
                    r#"
                    SELECT {PATIENT_COLUMNS_P}
                    FROM patients p
                    JOIN patients_search s ON s.rowid = p.rowid
                    WHERE patients_search MATCH ?1
                    ORDER BY p.lastName, p.firstName
                    LIMIT ?2
                    "#
                ),
                &[Value::Text(phrase), Value::Integer(limit as i64)],
                patient_from_row,
            );
        }

        let pattern = format!("%{}%", escape_like(query));
        self.gateway.query_all(
            &format!(
                r#"
                SELECT {PATIENT_COLUMNS}
                FROM patients
                WHERE firstName LIKE ?1 ESCAPE '\'
                   OR lastName LIKE ?1 ESCAPE '\'
                   OR phone LIKE ?1 ESCAPE '\'
                ORDER BY lastName, firstName
                LIMIT ?2
                "#
            ),
            &[Value::Text(pattern), Value::Integer(limit as i64)],
            patient_from_row,
        )
    }

    /// List all patients by name.
    pub fn list(&self) -> StoreResult<Vec<Patient>> {
        self.gateway.query_all(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients ORDER BY lastName, firstName"),
            &[],
            patient_from_row,
        )
    }

    fn list_limited(&self, limit: usize) -> StoreResult<Vec<Patient>> {
        self.gateway.query_all(
            &format!(
                "SELECT {PATIENT_COLUMNS} FROM patients ORDER BY lastName, firstName LIMIT ?1"
            ),
            &[Value::Integer(limit as i64)],
            patient_from_row,
        )
    }

    /// Patients whose last sync predates `before` (0 = never synced).
    pub fn list_unsynced(&self, before: i64) -> StoreResult<Vec<Patient>> {
        self.gateway.query_all(
            &format!(
                "SELECT {PATIENT_COLUMNS} FROM patients WHERE lastSyncedAt < ?1 ORDER BY updatedAt"
            ),
            &[Value::Integer(before)],
            patient_from_row,
        )
    }

    /// Record a remote acknowledgment. Leaves `syncVersion` unchanged.
    pub fn mark_synced(&self, patient_id: &str, synced_at: i64) -> StoreResult<bool> {
        let rows_affected = self.gateway.execute(
            "UPDATE patients SET lastSyncedAt = ?2 WHERE patientId = ?1",
            &[text(patient_id), Value::Integer(synced_at)],
        )?;
        Ok(rows_affected > 0)
    }
}

/// Next `PT-{prefix}-NNN` id. Must run inside the creating transaction.
fn next_patient_id(gateway: &StorageGateway, prefix: &str) -> StoreResult<String> {
    let stem = format!("PT-{}-", prefix);
    let highest: Option<i64> = gateway
        .query_one(
            "SELECT MAX(CAST(substr(patientId, ?2) AS INTEGER)) FROM patients WHERE patientId LIKE ?1",
            &[
                Value::Text(format!("{}%", stem)),
                Value::Integer(stem.len() as i64 + 1),
            ],
            |row| row.get::<_, Option<i64>>(0),
        )?
        .flatten();
    Ok(format_patient_id(prefix, highest.unwrap_or(0) + 1))
}

fn validate(fields: &NewPatient) -> StoreResult<()> {
    if fields.first_name.trim().is_empty() || fields.last_name.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "first and last name are required".into(),
        ));
    }
    chrono::NaiveDate::parse_from_str(&fields.date_of_birth, "%Y-%m-%d").map_err(|_| {
        StoreError::InvalidArgument(format!(
            "date of birth must be YYYY-MM-DD, got {:?}",
            fields.date_of_birth
        ))
    })?;
    Ok(())
}

fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
