//! Tortuga Core Library
//!
//! Offline-first storage and schema-evolution engine for clinical intake
//! tablets. Each tablet keeps a local SQLite datastore of patients, visits
//! and intake forms that is later reconciled with other tablets.
//!
//! # Architecture
//!
//! ```text
//!                      StorageGateway::open()
//!                               │
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//!          connect()      Migrator::run()   repair_intake_payloads()
//!       (WAL, FK on)    (create / rewrite     (NULL / '' formData
//!                        legacy tables)          → '{}')
//!                               │
//!                               ▼
//!                         Ready gateway
//!                               │
//!        ┌──────────────┬───────┴──────┬──────────────┐
//!        ▼              ▼              ▼              ▼
//!    Patients        Visits        Intake         Settings
//!  (FTS search)  (short codes)  (medical/dental)
//! ```
//!
//! # Core Principle
//!
//! **Every replicated row carries its sync metadata.** Local edits bump
//! `syncVersion`; acknowledgments from a peer only move `lastSyncedAt`.
//!
//! # Modules
//!
//! - [`config`]: Store configuration (TOML)
//! - [`db`]: Storage gateway, schema catalog, migrator, repair, repositories
//! - [`models`]: Domain types (Patient, Visit, IntakeRecord, etc.)

pub mod config;
pub mod db;
pub mod models;

// Re-export commonly used types
pub use config::StoreConfig;
pub use db::{
    MigrationReport, Migrator, RepairReport, StartupReport, StorageGateway, StoreError,
    StoreResult, TableState,
};
pub use models::{
    IntakeKind, IntakeRecord, NewPatient, NewVisit, Patient, ServiceKind, Setting, SyncMetadata,
    Visit, VisitStatus,
};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::sync::{Arc, Mutex};

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum TortugaError {
    #[error("Storage not initialized")]
    NotInitialized,

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<StoreError> for TortugaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotInitialized => TortugaError::NotInitialized,
            StoreError::NotFound(what) => TortugaError::NotFound(what),
            StoreError::InvalidArgument(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::Config(_) => TortugaError::InvalidInput(e.to_string()),
            StoreError::MigrationFailed { .. } => TortugaError::MigrationError(e.to_string()),
            StoreError::Json(_) => TortugaError::SerializationError(e.to_string()),
            _ => TortugaError::DatabaseError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TortugaError {
    fn from(e: serde_json::Error) -> Self {
        TortugaError::SerializationError(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TortugaError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        TortugaError::DatabaseError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open (creating and migrating as needed) the datastore at `path`.
#[uniffi::export]
pub fn open_store(
    path: String,
    tablet_id: String,
    tablet_prefix: String,
) -> Result<Arc<TortugaCore>, TortugaError> {
    let gateway = StorageGateway::open_with(StoreConfig::new(path, tablet_id, tablet_prefix))?;
    Ok(TortugaCore::wrap(gateway))
}

/// Open using a TOML config file.
#[uniffi::export]
pub fn open_store_from_config(config_path: String) -> Result<Arc<TortugaCore>, TortugaError> {
    let config = StoreConfig::load(std::path::Path::new(&config_path))?;
    let gateway = StorageGateway::open_with(config)?;
    Ok(TortugaCore::wrap(gateway))
}

/// Create an in-memory datastore (for testing).
#[uniffi::export]
pub fn open_store_in_memory(
    tablet_id: String,
    tablet_prefix: String,
) -> Result<Arc<TortugaCore>, TortugaError> {
    let config = StoreConfig::new(":memory:", tablet_id, tablet_prefix);
    let gateway = StorageGateway::open_in_memory(config)?;
    Ok(TortugaCore::wrap(gateway))
}

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe gateway wrapper for FFI.
#[derive(uniffi::Object)]
pub struct TortugaCore {
    gateway: Arc<Mutex<StorageGateway>>,
}

impl TortugaCore {
    fn wrap(gateway: StorageGateway) -> Arc<Self> {
        Arc::new(Self {
            gateway: Arc::new(Mutex::new(gateway)),
        })
    }
}

#[uniffi::export]
impl TortugaCore {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_ready(&self) -> Result<bool, TortugaError> {
        Ok(self.gateway.lock()?.is_ready())
    }

    /// Release the connection. Later calls fail with `NotInitialized`.
    pub fn close(&self) -> Result<(), TortugaError> {
        self.gateway.lock()?.close();
        Ok(())
    }

    /// Migration outcome of the last open, as JSON.
    pub fn startup_report_json(&self) -> Result<String, TortugaError> {
        let gateway = self.gateway.lock()?;
        let report = gateway.startup_report().ok_or(TortugaError::NotInitialized)?;
        let tables: Vec<serde_json::Value> = report
            .migration
            .tables
            .iter()
            .map(|t| {
                serde_json::json!({
                    "table": t.table,
                    "state": t.final_state().to_string(),
                    "rowsCopied": t.rows_copied,
                    "error": t.error,
                })
            })
            .collect();
        let repaired = report.repair.as_ref().map(|r| r.total_repaired());
        Ok(serde_json::to_string(&serde_json::json!({
            "schemaVersion": report.migration.schema_version,
            "tables": tables,
            "repairedIntakeRecords": repaired,
        }))?)
    }

    /// Run integrity repair now; returns the number of rows fixed.
    pub fn repair(&self) -> Result<u32, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.repair()?.total_repaired() as u32)
    }

    // =========================================================================
    // Patient Operations
    // =========================================================================

    pub fn create_patient(&self, patient: FfiNewPatient) -> Result<FfiPatient, TortugaError> {
        let gateway = self.gateway.lock()?;
        let created = gateway.patients().create(&patient.into())?;
        Ok(created.into())
    }

    pub fn get_patient(&self, patient_id: String) -> Result<Option<FfiPatient>, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.patients().get(&patient_id)?.map(|p| p.into()))
    }

    pub fn update_patient(&self, patient: FfiPatient) -> Result<FfiPatient, TortugaError> {
        let gateway = self.gateway.lock()?;
        let updated = gateway.patients().update(&patient.into())?;
        Ok(updated.into())
    }

    /// Search patients by name or phone.
    pub fn search_patients(
        &self,
        query: String,
        limit: u32,
    ) -> Result<Vec<FfiPatient>, TortugaError> {
        let gateway = self.gateway.lock()?;
        let patients = gateway.patients().search(&query, limit as usize)?;
        Ok(patients.into_iter().map(|p| p.into()).collect())
    }

    // =========================================================================
    // Visit Operations
    // =========================================================================

    pub fn open_visit(
        &self,
        patient_id: String,
        clinic_id: String,
    ) -> Result<FfiVisit, TortugaError> {
        let gateway = self.gateway.lock()?;
        let visit = gateway.visits().create(&NewVisit::new(patient_id, clinic_id))?;
        visit.try_into()
    }

    pub fn get_visit(&self, visit_id: String) -> Result<Option<FfiVisit>, TortugaError> {
        let gateway = self.gateway.lock()?;
        gateway
            .visits()
            .get(&visit_id)?
            .map(FfiVisit::try_from)
            .transpose()
    }

    /// Look up a visit by the code printed on the patient's slip.
    pub fn find_visit_by_code(&self, short_code: String) -> Result<Option<FfiVisit>, TortugaError> {
        let gateway = self.gateway.lock()?;
        gateway
            .visits()
            .get_by_short_code(&short_code)?
            .map(FfiVisit::try_from)
            .transpose()
    }

    pub fn list_visits_for_patient(&self, patient_id: String) -> Result<Vec<FfiVisit>, TortugaError> {
        let gateway = self.gateway.lock()?;
        gateway
            .visits()
            .list_for_patient(&patient_id)?
            .into_iter()
            .map(FfiVisit::try_from)
            .collect()
    }

    pub fn advance_visit(&self, visit_id: String, status: String) -> Result<FfiVisit, TortugaError> {
        let status: VisitStatus = status.parse().map_err(TortugaError::InvalidInput)?;
        let gateway = self.gateway.lock()?;
        gateway.visits().advance_status(&visit_id, status)?.try_into()
    }

    pub fn complete_service(
        &self,
        visit_id: String,
        kind: FfiIntakeKind,
    ) -> Result<FfiVisit, TortugaError> {
        let gateway = self.gateway.lock()?;
        let service = IntakeKind::from(kind).service();
        gateway.visits().complete_service(&visit_id, service)?.try_into()
    }

    // =========================================================================
    // Intake Operations
    // =========================================================================

    pub fn create_intake(
        &self,
        kind: FfiIntakeKind,
        visit_id: String,
        form_data: String,
    ) -> Result<FfiIntakeRecord, TortugaError> {
        let gateway = self.gateway.lock()?;
        let record = gateway.intake(kind.into()).create(&visit_id, &form_data)?;
        Ok(record.into())
    }

    pub fn get_intake(
        &self,
        kind: FfiIntakeKind,
        record_id: String,
    ) -> Result<Option<FfiIntakeRecord>, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.intake(kind.into()).get(&record_id)?.map(|r| r.into()))
    }

    pub fn update_intake_form(
        &self,
        kind: FfiIntakeKind,
        record_id: String,
        form_data: String,
    ) -> Result<FfiIntakeRecord, TortugaError> {
        let gateway = self.gateway.lock()?;
        let record = gateway.intake(kind.into()).update_form(&record_id, &form_data)?;
        Ok(record.into())
    }

    // =========================================================================
    // Sync Operations
    // =========================================================================

    /// Rows of every replicated table not acknowledged since `before`.
    pub fn count_unsynced(&self, before: i64) -> Result<u32, TortugaError> {
        let gateway = self.gateway.lock()?;
        let mut count = gateway.patients().list_unsynced(before)?.len();
        count += gateway.visits().list_unsynced(before)?.len();
        for kind in IntakeKind::ALL {
            count += gateway.intake(kind).list_unsynced(before)?.len();
        }
        Ok(count as u32)
    }

    pub fn mark_patient_synced(&self, patient_id: String, synced_at: i64) -> Result<bool, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.patients().mark_synced(&patient_id, synced_at)?)
    }

    pub fn mark_visit_synced(&self, visit_id: String, synced_at: i64) -> Result<bool, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.visits().mark_synced(&visit_id, synced_at)?)
    }

    pub fn mark_intake_synced(
        &self,
        kind: FfiIntakeKind,
        record_id: String,
        synced_at: i64,
    ) -> Result<bool, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.intake(kind.into()).mark_synced(&record_id, synced_at)?)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: String) -> Result<Option<String>, TortugaError> {
        let gateway = self.gateway.lock()?;
        Ok(gateway.settings().get_value(&key)?)
    }

    pub fn set_setting(&self, key: String, value: String) -> Result<(), TortugaError> {
        let gateway = self.gateway.lock()?;
        gateway.settings().set(&key, &value)?;
        Ok(())
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe sync metadata.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncMetadata {
    pub origin_tablet: String,
    pub last_synced_at: i64,
    pub sync_version: i64,
}

impl From<SyncMetadata> for FfiSyncMetadata {
    fn from(sync: SyncMetadata) -> Self {
        Self {
            origin_tablet: sync.origin_tablet,
            last_synced_at: sync.last_synced_at,
            sync_version: sync.sync_version,
        }
    }
}

impl From<FfiSyncMetadata> for SyncMetadata {
    fn from(sync: FfiSyncMetadata) -> Self {
        SyncMetadata {
            origin_tablet: sync.origin_tablet,
            last_synced_at: sync.last_synced_at,
            sync_version: sync.sync_version,
        }
    }
}

/// FFI-safe patient registration fields.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiNewPatient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl From<FfiNewPatient> for NewPatient {
    fn from(p: FfiNewPatient) -> Self {
        NewPatient {
            first_name: p.first_name,
            last_name: p.last_name,
            date_of_birth: p.date_of_birth,
            phone: p.phone,
            notes: p.notes,
        }
    }
}

/// FFI-safe patient.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatient {
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sync: FfiSyncMetadata,
}

impl From<Patient> for FfiPatient {
    fn from(p: Patient) -> Self {
        Self {
            patient_id: p.patient_id,
            first_name: p.first_name,
            last_name: p.last_name,
            date_of_birth: p.date_of_birth,
            phone: p.phone,
            notes: p.notes,
            created_at: p.created_at,
            updated_at: p.updated_at,
            sync: p.sync.into(),
        }
    }
}

impl From<FfiPatient> for Patient {
    fn from(p: FfiPatient) -> Self {
        Patient {
            patient_id: p.patient_id,
            first_name: p.first_name,
            last_name: p.last_name,
            date_of_birth: p.date_of_birth,
            phone: p.phone,
            notes: p.notes,
            created_at: p.created_at,
            updated_at: p.updated_at,
            sync: p.sync.into(),
        }
    }
}

/// FFI-safe visit. `services` is the stored JSON document.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiVisit {
    pub visit_id: String,
    pub patient_id: String,
    pub clinic_id: String,
    pub status: String,
    pub services: String,
    pub short_code: String,
    pub opened_at: i64,
    pub updated_at: i64,
    pub sync: FfiSyncMetadata,
}

impl TryFrom<Visit> for FfiVisit {
    type Error = TortugaError;

    fn try_from(v: Visit) -> Result<Self, Self::Error> {
        Ok(Self {
            services: serde_json::to_string(&v.services)?,
            visit_id: v.visit_id,
            patient_id: v.patient_id,
            clinic_id: v.clinic_id,
            status: v.status.to_string(),
            short_code: v.short_code,
            opened_at: v.opened_at,
            updated_at: v.updated_at,
            sync: v.sync.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, uniffi::Enum)]
pub enum FfiIntakeKind {
    Medical,
    Dental,
}

impl From<FfiIntakeKind> for IntakeKind {
    fn from(kind: FfiIntakeKind) -> Self {
        match kind {
            FfiIntakeKind::Medical => IntakeKind::Medical,
            FfiIntakeKind::Dental => IntakeKind::Dental,
        }
    }
}

impl From<IntakeKind> for FfiIntakeKind {
    fn from(kind: IntakeKind) -> Self {
        match kind {
            IntakeKind::Medical => FfiIntakeKind::Medical,
            IntakeKind::Dental => FfiIntakeKind::Dental,
        }
    }
}

/// FFI-safe intake record.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiIntakeRecord {
    pub record_id: String,
    pub kind: FfiIntakeKind,
    pub visit_id: String,
    pub form_data: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub sync: FfiSyncMetadata,
}

impl From<IntakeRecord> for FfiIntakeRecord {
    fn from(r: IntakeRecord) -> Self {
        Self {
            record_id: r.record_id,
            kind: r.kind.into(),
            visit_id: r.visit_id,
            form_data: r.form_data,
            created_at: r.created_at,
            updated_at: r.updated_at,
            sync: r.sync.into(),
        }
    }
}
