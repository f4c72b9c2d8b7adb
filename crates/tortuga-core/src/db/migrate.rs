//! Migration engine: converges the live database onto the schema catalog.
//!
//! Per table: `absent → current` (create), `created → current` (no drift), or
//! `created → legacy-detected → rewritten → current` (three-phase rewrite).
//! A rewrite runs as one transaction with foreign keys suspended, so a
//! failure rolls back to the untouched original table.

use std::fmt;

use rusqlite::{params, Connection};
use tracing::{debug, error, info, warn};

use super::schema::{TableSpec, CATALOG, SCHEMA_VERSION};
use super::{StoreError, StoreResult};

/// Position of a table in the migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Created,
    Current,
    LegacyDetected,
    Rewritten,
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableState::Absent => "absent",
            TableState::Created => "created",
            TableState::Current => "current",
            TableState::LegacyDetected => "legacy-detected",
            TableState::Rewritten => "rewritten",
        })
    }
}

/// Differences between a live table and its catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDrift {
    /// Live columns the catalog no longer defines (e.g. `qrPayload`)
    pub extra_columns: Vec<String>,
    /// Catalog columns the live table lacks
    pub missing_columns: Vec<String>,
    /// Catalog foreign keys the live table does not express, as `column->table`
    pub missing_foreign_keys: Vec<String>,
}

impl SchemaDrift {
    pub fn is_empty(&self) -> bool {
        self.extra_columns.is_empty()
            && self.missing_columns.is_empty()
            && self.missing_foreign_keys.is_empty()
    }
}

/// Read-only view of one table, as reported by [`Migrator::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    pub table: &'static str,
    pub state: TableState,
    pub drift: SchemaDrift,
}

/// What happened to one table during a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMigration {
    pub table: &'static str,
    /// States visited, in order
    pub path: Vec<TableState>,
    /// Rows carried over by a rewrite
    pub rows_copied: Option<usize>,
    /// Set when a rewrite was aborted
    pub error: Option<String>,
}

impl TableMigration {
    fn new(table: &'static str, path: Vec<TableState>) -> Self {
        Self {
            table,
            path,
            rows_copied: None,
            error: None,
        }
    }

    pub fn final_state(&self) -> TableState {
        self.path.last().copied().unwrap_or(TableState::Absent)
    }

    /// True when the run changed nothing for this table.
    pub fn is_noop(&self) -> bool {
        self.path == [TableState::Created, TableState::Current]
    }
}

/// Outcome of a full migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub tables: Vec<TableMigration>,
    /// `PRAGMA user_version` after the run
    pub schema_version: i64,
}

impl MigrationReport {
    /// Every table ended in `current`.
    pub fn is_converged(&self) -> bool {
        self.tables
            .iter()
            .all(|t| t.final_state() == TableState::Current)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TableMigration> {
        self.tables.iter().filter(|t| t.error.is_some())
    }

    pub fn table(&self, name: &str) -> Option<&TableMigration> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Applies the catalog to a connection.
pub struct Migrator<'a> {
    conn: &'a Connection,
    catalog: &'static [TableSpec],
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            catalog: CATALOG,
        }
    }

    /// Report each table's state without changing anything.
    pub fn inspect(&self) -> StoreResult<Vec<TableStatus>> {
        self.catalog
            .iter()
            .map(|spec| {
                if !table_exists(self.conn, spec.name)? {
                    return Ok(TableStatus {
                        table: spec.name,
                        state: TableState::Absent,
                        drift: SchemaDrift::default(),
                    });
                }
                let drift = self.drift(spec)?;
                let state = if drift.is_empty() {
                    TableState::Current
                } else {
                    TableState::LegacyDetected
                };
                Ok(TableStatus {
                    table: spec.name,
                    state,
                    drift,
                })
            })
            .collect()
    }

    /// Converge every catalog table.
    ///
    /// Failing to create an absent table is fatal and returned as an error.
    /// A failed rewrite is recorded in the report, the legacy table is left
    /// intact, and the run continues with the next table.
    pub fn run(&self) -> StoreResult<MigrationReport> {
        let mut tables = Vec::with_capacity(self.catalog.len());

        for spec in self.catalog {
            match self.migrate_table(spec) {
                Ok(migration) => tables.push(migration),
                Err(err @ StoreError::MigrationFailed { .. }) => {
                    error!(table = spec.name, error = %err, "table rewrite aborted; legacy table kept for retry");
                    let mut migration = TableMigration::new(
                        spec.name,
                        vec![TableState::Created, TableState::LegacyDetected],
                    );
                    migration.error = Some(err.to_string());
                    tables.push(migration);
                }
                Err(err) => return Err(err),
            }
        }

        let mut report = MigrationReport {
            tables,
            schema_version: 0,
        };
        if report.is_converged() {
            self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        report.schema_version = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        Ok(report)
    }

    fn migrate_table(&self, spec: &'static TableSpec) -> StoreResult<TableMigration> {
        if !table_exists(self.conn, spec.name)? {
            self.create_table(spec)?;
            info!(table = spec.name, "created table from catalog");
            return Ok(TableMigration::new(
                spec.name,
                vec![TableState::Absent, TableState::Current],
            ));
        }

        let drift = self.drift(spec)?;
        if drift.is_empty() {
            self.conn.execute_batch(&spec.index_sql())?;
            ensure_search_index(self.conn, spec, false)?;
            debug!(table = spec.name, "schema is up to date");
            return Ok(TableMigration::new(
                spec.name,
                vec![TableState::Created, TableState::Current],
            ));
        }

        warn!(
            table = spec.name,
            extra = ?drift.extra_columns,
            missing = ?drift.missing_columns,
            missing_fks = ?drift.missing_foreign_keys,
            "legacy drift detected, rewriting table"
        );
        let rows = self.rewrite_table(spec)?;
        info!(table = spec.name, rows, "table rewrite complete");

        let mut migration = TableMigration::new(
            spec.name,
            vec![
                TableState::Created,
                TableState::LegacyDetected,
                TableState::Rewritten,
                TableState::Current,
            ],
        );
        migration.rows_copied = Some(rows);
        Ok(migration)
    }

    fn create_table(&self, spec: &TableSpec) -> StoreResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&spec.create_table_sql(spec.name))?;
        tx.execute_batch(&spec.index_sql())?;
        ensure_search_index(&tx, spec, true)?;
        tx.commit()?;
        Ok(())
    }

    /// Diff the live table against its catalog entry.
    pub fn drift(&self, spec: &TableSpec) -> StoreResult<SchemaDrift> {
        let live = live_columns(self.conn, spec.name)?;
        let fks = live_foreign_keys(self.conn, spec.name)?;

        let extra_columns = live
            .iter()
            .filter(|name| spec.column(name).is_none())
            .cloned()
            .collect();
        let missing_columns = spec
            .column_names()
            .filter(|name| !live.iter().any(|l| l == name))
            .map(str::to_string)
            .collect();
        let missing_foreign_keys = spec
            .foreign_keys
            .iter()
            .filter(|fk| {
                !fks.iter()
                    .any(|(from, table)| from == fk.column && table == fk.table)
            })
            .map(|fk| format!("{}->{}", fk.column, fk.table))
            .collect();

        Ok(SchemaDrift {
            extra_columns,
            missing_columns,
            missing_foreign_keys,
        })
    }

    /// Three-phase rewrite onto the catalog's exact column set.
    ///
    /// Foreign keys can only be toggled outside a transaction, so they are
    /// switched off around it and always switched back on.
    fn rewrite_table(&self, spec: &TableSpec) -> StoreResult<usize> {
        self.conn.pragma_update(None, "foreign_keys", "OFF")?;
        let result = self.rewrite_in_transaction(spec);
        let restored = self.conn.pragma_update(None, "foreign_keys", "ON");

        let rows = result.map_err(|e| match e {
            StoreError::MigrationFailed { .. } => e,
            other => StoreError::MigrationFailed {
                table: spec.name.to_string(),
                reason: other.to_string(),
            },
        })?;
        restored?;
        Ok(rows)
    }

    fn rewrite_in_transaction(&self, spec: &TableSpec) -> StoreResult<usize> {
        let table = spec.name;
        let shadow = format!("{}_shadow", table);
        let live = live_columns(self.conn, table)?;

        let tx = self.conn.unchecked_transaction()?;
        let before: i64 =
            tx.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;

        // Phase 1: shadow table with the catalog's columns.
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{shadow}\";"))?;
        tx.execute_batch(&spec.create_table_sql(&shadow))?;

        // Phase 2: copy rows, projecting the columns both shapes share.
        // Catalog columns the legacy table lacks, or holds NULL in, take
        // their declared default.
        let retained: Vec<_> = spec
            .columns
            .iter()
            .filter(|col| live.iter().any(|l| l == col.name))
            .collect();
        let targets = retained
            .iter()
            .map(|col| format!("\"{}\"", col.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sources = retained
            .iter()
            .map(|col| match col.default {
                Some(default) => format!("COALESCE(\"{}\", {})", col.name, default),
                None => format!("\"{}\"", col.name),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let copied = tx.execute(
            &format!("INSERT INTO \"{shadow}\" ({targets}) SELECT {sources} FROM \"{table}\""),
            [],
        )?;
        if copied as i64 != before {
            return Err(StoreError::MigrationFailed {
                table: table.to_string(),
                reason: format!("copied {} of {} rows", copied, before),
            });
        }

        // Phase 3: swap the shadow in, then restore indexes and triggers.
        tx.execute_batch(&format!(
            "DROP TABLE \"{table}\";\nALTER TABLE \"{shadow}\" RENAME TO \"{table}\";"
        ))?;
        tx.execute_batch(&spec.index_sql())?;
        ensure_search_index(&tx, spec, true)?;

        let violations = foreign_key_violations(&tx, table)?;
        if violations > 0 {
            return Err(StoreError::MigrationFailed {
                table: table.to_string(),
                reason: format!("{} rows violate foreign keys", violations),
            });
        }

        tx.commit()?;
        Ok(copied)
    }
}

/// Create the table's FTS index if it has one, rebuilding it when it was
/// just created or when `force_rebuild` is set.
fn ensure_search_index(conn: &Connection, spec: &TableSpec, force_rebuild: bool) -> StoreResult<()> {
    let Some(search) = &spec.search else {
        return Ok(());
    };
    let existed = table_exists(conn, search.name)?;
    conn.execute_batch(&search.ddl(spec.name))?;
    if force_rebuild || !existed {
        conn.execute_batch(&search.rebuild_sql())?;
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

/// Column names of a live table, in declaration order.
pub(crate) fn live_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// `(from_column, parent_table)` for each foreign key on a live table.
fn live_foreign_keys(conn: &Connection, table: &str) -> StoreResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{table}\")"))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(3)?, row.get::<_, String>(2)?)))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn foreign_key_violations(conn: &Connection, table: &str) -> StoreResult<usize> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_check(\"{table}\")"))?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}
