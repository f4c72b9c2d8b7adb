//! Startup migration and repair against file-backed datastores.

use rusqlite::{params, Connection};
use tempfile::TempDir;
use tortuga_core::db::{
    RepairOutcome, CATALOG, DENTAL_INTAKE_RECORDS, MEDICAL_INTAKE_RECORDS, VISITS,
};
use tortuga_core::{
    IntakeKind, NewPatient, NewVisit, StorageGateway, StoreConfig, StoreError, TableState,
};

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig::new(dir.path().join("la_tortuga.db"), "tablet-A", "A")
}

/// A datastore written by an older build: visits still carry `qrPayload`
/// and nullable sync columns, and dental records have no visit foreign key.
fn seed_legacy_store(config: &StoreConfig) {
    let conn = Connection::open(&config.database_path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE visits (
            visitId TEXT PRIMARY KEY,
            patientId TEXT NOT NULL,
            clinicId TEXT NOT NULL,
            status TEXT NOT NULL,
            services TEXT NOT NULL,
            shortCode TEXT NOT NULL UNIQUE,
            qrPayload TEXT,
            openedAt INTEGER NOT NULL,
            updatedAt INTEGER NOT NULL,
            originTablet TEXT,
            lastSyncedAt INTEGER,
            syncVersion INTEGER
        );
        CREATE TABLE dental_intake_records (
            recordId TEXT PRIMARY KEY,
            visitId TEXT NOT NULL,
            formData TEXT,
            createdAt INTEGER NOT NULL,
            updatedAt INTEGER NOT NULL,
            originTablet TEXT NOT NULL,
            lastSyncedAt INTEGER NOT NULL DEFAULT 0,
            syncVersion INTEGER NOT NULL DEFAULT 1
        );
        "#,
    )
    .unwrap();

    for (i, code) in ["K3F-72B", "M8Q-4RT", "ZX2-9PL"].iter().enumerate() {
        conn.execute(
            "INSERT INTO visits VALUES (?1, 'PT-A-001', 'clinic-1', 'open', '{}', ?2, 'qr', 100, 200, 'tablet-A', NULL, 4)",
            params![format!("visit-{i}"), code],
        )
        .unwrap();
    }
    conn.execute(
        "INSERT INTO dental_intake_records VALUES ('rec-1', 'visit-0', '', 300, 400, 'tablet-A', 0, 7)",
        [],
    )
    .unwrap();
}

#[test]
fn test_fresh_file_store() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let gateway = StorageGateway::open_with(config.clone()).unwrap();
    let report = gateway.startup_report().unwrap();
    assert!(report.migration.is_converged());
    assert_eq!(report.migration.schema_version, tortuga_core::db::SCHEMA_VERSION);
    assert!(config.database_path.exists());

    let journal: String = gateway
        .query_one("PRAGMA journal_mode", &[], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(journal.to_lowercase(), "wal");
}

#[test]
fn test_legacy_store_converges_and_keeps_rows() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    seed_legacy_store(&config);

    let gateway = StorageGateway::open_with(config.clone()).unwrap();
    let report = gateway.startup_report().unwrap();

    assert!(report.migration.is_converged());
    let visits = report.migration.table(VISITS).unwrap();
    assert_eq!(
        visits.path,
        vec![
            TableState::Created,
            TableState::LegacyDetected,
            TableState::Rewritten,
            TableState::Current
        ]
    );
    assert_eq!(visits.rows_copied, Some(3));
    assert_eq!(
        report.migration.table(DENTAL_INTAKE_RECORDS).unwrap().rows_copied,
        Some(1)
    );
    assert_eq!(
        report.migration.table(MEDICAL_INTAKE_RECORDS).unwrap().path,
        vec![TableState::Absent, TableState::Current]
    );

    // Legacy visits are readable through the repository.
    let visit = gateway.visits().get_by_short_code("k3f72b").unwrap().unwrap();
    assert_eq!(visit.visit_id, "visit-0");
    assert_eq!(visit.sync.sync_version, 4);
    assert_eq!(visit.sync.last_synced_at, 0);

    // The empty dental payload was repaired without counting as an edit.
    let repair = report.repair.as_ref().unwrap();
    assert_eq!(
        repair.outcome(DENTAL_INTAKE_RECORDS),
        Some(RepairOutcome::Repaired(1))
    );
    let record = gateway
        .intake(IntakeKind::Dental)
        .get("rec-1")
        .unwrap()
        .unwrap();
    assert_eq!(record.form_data, "{}");
    assert_eq!(record.sync.sync_version, 7);
    assert_eq!(record.updated_at, 400);

    // Every catalog table now has exactly the catalog's columns, in order.
    for spec in CATALOG.iter() {
        let live: Vec<String> = gateway
            .query_all(&format!("PRAGMA table_info(\"{}\")", spec.name), &[], |row| {
                row.get(1)
            })
            .unwrap();
        let expected: Vec<String> = spec.column_names().map(String::from).collect();
        assert_eq!(live, expected, "columns of {}", spec.name);
    }
    let statuses = gateway.inspect().unwrap();
    assert_eq!(statuses.len(), CATALOG.len());
    assert!(statuses.iter().all(|s| s.state == TableState::Current));
}

#[test]
fn test_reopen_is_noop() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    seed_legacy_store(&config);

    let mut gateway = StorageGateway::open_with(config.clone()).unwrap();
    gateway.close();
    gateway.open().unwrap();

    let report = gateway.startup_report().unwrap();
    assert!(report.migration.tables.iter().all(|t| t.is_noop()));
    assert_eq!(report.repair.as_ref().unwrap().total_repaired(), 0);
    assert_eq!(gateway.visits().list_unsynced(1).unwrap().len(), 3);
}

#[test]
fn test_orphaned_legacy_rows_do_not_block_startup() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    seed_legacy_store(&config);
    {
        let conn = Connection::open(&config.database_path).unwrap();
        conn.execute(
            "INSERT INTO dental_intake_records VALUES ('rec-2', 'gone', '{}', 1, 1, 'tablet-B', 0, 1)",
            [],
        )
        .unwrap();
    }

    let gateway = StorageGateway::open_with(config.clone()).unwrap();
    let report = gateway.startup_report().unwrap();

    let dental = report.migration.table(DENTAL_INTAKE_RECORDS).unwrap();
    assert_eq!(dental.final_state(), TableState::LegacyDetected);
    assert!(dental.error.is_some());
    assert!(!report.migration.is_converged());

    // Other tables still converged and the legacy table still serves reads.
    assert_eq!(
        report.migration.table(VISITS).unwrap().final_state(),
        TableState::Current
    );
    assert_eq!(
        gateway
            .intake(IntakeKind::Dental)
            .list_unsynced(1)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn test_not_null_failure_on_legacy_table_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    {
        // Required `qrPayload` the repository never writes, and a NULL
        // clinic id that keeps the rewrite from completing.
        let conn = Connection::open(&config.database_path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE visits (
                visitId TEXT PRIMARY KEY,
                patientId TEXT NOT NULL,
                clinicId TEXT,
                status TEXT NOT NULL,
                services TEXT NOT NULL,
                shortCode TEXT NOT NULL UNIQUE,
                qrPayload TEXT NOT NULL,
                openedAt INTEGER NOT NULL,
                updatedAt INTEGER NOT NULL,
                originTablet TEXT NOT NULL,
                lastSyncedAt INTEGER NOT NULL,
                syncVersion INTEGER NOT NULL
            );
            INSERT INTO visits VALUES
                ('visit-0', 'PT-A-001', NULL, 'open', '{}', 'K3F-72B', 'qr', 1, 1, 'tablet-A', 0, 1);
            "#,
        )
        .unwrap();
    }

    let gateway = StorageGateway::open_with(config).unwrap();
    let report = gateway.startup_report().unwrap();
    assert_eq!(
        report.migration.table(VISITS).unwrap().final_state(),
        TableState::LegacyDetected
    );

    let patient = gateway
        .patients()
        .create(&NewPatient::new("Marta", "Ruiz", "1980-02-02"))
        .unwrap();
    let mut draws = 0;
    let result = gateway
        .visits()
        .create_with_code_source(&NewVisit::new(&patient.patient_id, "clinic"), || {
            draws += 1;
            "M8Q-4RT".to_string()
        });

    match &result {
        Err(err @ StoreError::Write { .. }) => {
            assert!(err.is_constraint_violation());
            assert!(!err.is_unique_violation());
        }
        other => panic!("expected write error, got {other:?}"),
    }
    assert_eq!(draws, 1);
}

#[test]
fn test_patient_ids_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let mut gateway = StorageGateway::open_with(config).unwrap();
    for first in ["Ana", "Luis"] {
        gateway
            .patients()
            .create(&NewPatient::new(first, "Ramírez", "2001-05-05"))
            .unwrap();
    }
    gateway.close();
    gateway.open().unwrap();

    let third = gateway
        .patients()
        .create(&NewPatient::new("Rosa", "Ramírez", "2003-09-09"))
        .unwrap();
    assert_eq!(third.patient_id, "PT-A-003");
    assert_eq!(gateway.patients().search("rosa", 10).unwrap().len(), 1);
}

#[test]
fn test_search_survives_vacuum() {
    let dir = TempDir::new().unwrap();
    let gateway = StorageGateway::open_with(config(&dir)).unwrap();
    for first in ["Adela", "Benito", "Consuelo", "Dolores"] {
        gateway
            .patients()
            .create(&NewPatient::new(first, "Villanueva", "1990-01-01"))
            .unwrap();
    }
    // Leave a rowid gap so compaction renumbers the rows after it.
    gateway
        .execute("DELETE FROM patients WHERE patientId = 'PT-A-001'", &[])
        .unwrap();

    gateway.vacuum().unwrap();

    let hits = gateway.patients().search("consuelo", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].patient_id, "PT-A-003");
    assert_eq!(gateway.patients().search("villanueva", 10).unwrap().len(), 3);
    assert!(gateway.patients().search("adela", 10).unwrap().is_empty());
}

#[test]
fn test_invalid_config_never_opens() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.tablet_id = "  ".into();

    let mut gateway = StorageGateway::new(config.clone());
    assert!(gateway.open().is_err());
    assert!(!gateway.is_ready());
    assert!(!config.database_path.exists());
}
