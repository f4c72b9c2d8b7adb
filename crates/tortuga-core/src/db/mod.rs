//! Storage layer: the gateway that owns the SQLite connection, the schema
//! catalog, the migration engine, integrity repair, and the typed
//! repositories built on top of them.

mod intake;
mod migrate;
mod patients;
mod repair;
mod schema;
mod settings;
mod visits;

pub use intake::*;
pub use migrate::*;
pub use patients::*;
pub use repair::*;
pub use schema::*;
pub use settings::*;
pub use visits::*;

use std::path::PathBuf;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::models::IntakeKind;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage gateway not initialized; call open() first")]
    NotInitialized,

    #[error("Query failed: {statement} (params: {params}): {source}")]
    Query {
        statement: String,
        params: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Write failed: {statement} (params: {params}): {source}")]
    Write {
        statement: String,
        params: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration of {table} failed: {reason}")]
    MigrationFailed { table: String, reason: String },

    #[error("Short code generation exhausted after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True for writes rejected by a UNIQUE / NOT NULL / FOREIGN KEY / CHECK
    /// constraint.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::Write {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => err.code == ErrorCode::ConstraintViolation,
            _ => false,
        }
    }

    /// True only for writes rejected by a UNIQUE (or primary key) constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Write {
                source: rusqlite::Error::SqliteFailure(err, _),
                ..
            } => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Lifecycle of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Uninitialized,
    Ready,
}

/// Migration and repair results from the last successful `open()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub migration: MigrationReport,
    /// `None` when the repair pass itself failed
    pub repair: Option<RepairReport>,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Sole owner of the live SQLite connection.
///
/// Repositories borrow the gateway; nothing else holds a handle. All
/// statements therefore run one at a time against a single connection.
pub struct StorageGateway {
    config: StoreConfig,
    location: Location,
    conn: Option<Connection>,
    startup: Option<StartupReport>,
}

impl StorageGateway {
    /// Gateway for the file named in `config`. Nothing is opened yet.
    pub fn new(config: StoreConfig) -> Self {
        let location = Location::File(config.database_path.clone());
        Self {
            config,
            location,
            conn: None,
            startup: None,
        }
    }

    /// Gateway backed by a private in-memory database. Closing discards it.
    pub fn in_memory(config: StoreConfig) -> Self {
        Self {
            config,
            location: Location::Memory,
            conn: None,
            startup: None,
        }
    }

    /// Create and open a file-backed gateway.
    pub fn open_with(config: StoreConfig) -> StoreResult<Self> {
        let mut gateway = Self::new(config);
        gateway.open()?;
        Ok(gateway)
    }

    /// Create and open an in-memory gateway (for testing).
    pub fn open_in_memory(config: StoreConfig) -> StoreResult<Self> {
        let mut gateway = Self::in_memory(config);
        gateway.open()?;
        Ok(gateway)
    }

    /// Open the datastore, migrate it, repair it, and become ready.
    ///
    /// Idempotent once ready. On failure the gateway stays uninitialized
    /// and the connection is dropped.
    pub fn open(&mut self) -> StoreResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let conn = self.connect().map_err(|e| {
            error!(error = %e, "database initialization failed");
            e
        })?;

        let migration = Migrator::new(&conn).run().map_err(|e| {
            error!(error = %e, "schema migration failed during startup");
            e
        })?;
        for failed in migration.failed() {
            warn!(table = failed.table, "table left in legacy shape; will retry on next startup");
        }

        let repair = match repair_intake_payloads(&conn) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "intake repair skipped");
                None
            }
        };

        info!(
            tablet = %self.config.tablet_id,
            schema_version = migration.schema_version,
            "database initialized"
        );
        self.startup = Some(StartupReport { migration, repair });
        self.conn = Some(conn);
        Ok(())
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            StoreError::Config(format!("{}: {}", parent.display(), e))
                        })?;
                    }
                }
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                conn
            }
            Location::Memory => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    /// The live connection, or `NotInitialized`.
    pub fn current(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::NotInitialized)
    }

    /// Release the connection. No-op when already closed.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error closing database; handle dropped");
            }
            debug!("database closed");
        }
        self.startup = None;
    }

    pub fn state(&self) -> GatewayState {
        if self.conn.is_some() {
            GatewayState::Ready
        } else {
            GatewayState::Uninitialized
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == GatewayState::Ready
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Identity stamped into `originTablet`.
    pub fn tablet_id(&self) -> &str {
        &self.config.tablet_id
    }

    pub fn startup_report(&self) -> Option<&StartupReport> {
        self.startup.as_ref()
    }

    /// Run integrity repair on demand.
    pub fn repair(&self) -> StoreResult<RepairReport> {
        repair_intake_payloads(self.current()?)
    }

    /// Compact the datastore file.
    ///
    /// VACUUM may renumber the implicit rowids the search indexes join on,
    /// so every search index is rebuilt afterwards.
    pub fn vacuum(&self) -> StoreResult<()> {
        let conn = self.current()?;
        conn.execute_batch("VACUUM;")?;
        for spec in CATALOG {
            if let Some(search) = &spec.search {
                conn.execute_batch(&search.rebuild_sql())?;
                debug!(index = search.name, "search index rebuilt");
            }
        }
        info!("datastore vacuumed");
        Ok(())
    }

    /// Inspect schema state without migrating.
    pub fn inspect(&self) -> StoreResult<Vec<TableStatus>> {
        Migrator::new(self.current()?).inspect()
    }

    // =========================================================================
    // Statement execution
    // =========================================================================

    /// Run a read and map every row.
    pub fn query_all<T, F>(&self, sql: &str, params: &[Value], mut map: F) -> StoreResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.current()?;
        let mut stmt = self.prepare(conn, sql, params, Access::Read)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| map(row))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| failure(Access::Read, sql, params, e))?;
        Ok(rows)
    }

    /// Run a read expected to produce at most one row; zero rows is `None`.
    pub fn query_one<T, F>(&self, sql: &str, params: &[Value], map: F) -> StoreResult<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.current()?;
        let mut stmt = self.prepare(conn, sql, params, Access::Read)?;
        stmt.query_row(params_from_iter(params.iter()), map)
            .optional()
            .map_err(|e| failure(Access::Read, sql, params, e))
    }

    /// Run an INSERT / UPDATE / DELETE and return the affected row count.
    pub fn execute(&self, sql: &str, params: &[Value]) -> StoreResult<usize> {
        let conn = self.current()?;
        let mut stmt = self.prepare(conn, sql, params, Access::Write)?;
        stmt.execute(params_from_iter(params.iter()))
            .map_err(|e| failure(Access::Write, sql, params, e))
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    /// Not reentrant.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Self) -> StoreResult<T>,
    {
        let tx = self.current()?.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    fn prepare<'c>(
        &self,
        conn: &'c Connection,
        sql: &str,
        params: &[Value],
        access: Access,
    ) -> StoreResult<rusqlite::CachedStatement<'c>> {
        let stmt = conn
            .prepare_cached(sql)
            .map_err(|e| failure(access, sql, params, e))?;

        let expected = stmt.parameter_count();
        if expected != params.len() {
            return Err(StoreError::InvalidArgument(format!(
                "statement expects {} parameters, got {}: {}",
                expected,
                params.len(),
                sql.trim()
            )));
        }
        if params.iter().any(|p| matches!(p, Value::Null)) {
            warn!(statement = sql.trim(), params = ?params, "statement bound with null parameter");
        }
        Ok(stmt)
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    pub fn patients(&self) -> PatientRepository<'_> {
        PatientRepository::new(self)
    }

    pub fn visits(&self) -> VisitRepository<'_> {
        VisitRepository::new(self)
    }

    pub fn intake(&self, kind: IntakeKind) -> IntakeRepository<'_> {
        IntakeRepository::new(self, kind)
    }

    pub fn settings(&self) -> SettingsRepository<'_> {
        SettingsRepository::new(self)
    }
}

impl Drop for StorageGateway {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn failure(access: Access, sql: &str, params: &[Value], source: rusqlite::Error) -> StoreError {
    let statement = sql.trim().to_string();
    let params = format!("{:?}", params);
    error!(%statement, %params, error = %source, "statement failed");
    match access {
        Access::Read => StoreError::Query {
            statement,
            params,
            source,
        },
        Access::Write => StoreError::Write {
            statement,
            params,
            source,
        },
    }
}

/// Bind helper for text columns.
pub(crate) fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

/// Bind helper for nullable text columns.
pub(crate) fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, text)
}
