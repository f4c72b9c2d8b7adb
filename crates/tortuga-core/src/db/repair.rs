//! Integrity repair for intake payloads.
//!
//! Older builds could persist intake records with a NULL or empty
//! `formData`. This pass normalizes them to an empty JSON object. It is
//! hygiene rather than a business edit: sync metadata and timestamps are
//! left alone.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::migrate::table_exists;
use super::StoreResult;
use crate::models::{IntakeKind, EMPTY_FORM};

/// Result of repairing one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Nothing needed fixing
    Clean,
    /// This many rows were rewritten
    Repaired(usize),
    /// Table not present yet
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepairReport {
    pub tables: Vec<(&'static str, RepairOutcome)>,
}

impl RepairReport {
    /// Rows rewritten across all tables.
    pub fn total_repaired(&self) -> usize {
        self.tables
            .iter()
            .map(|(_, outcome)| match outcome {
                RepairOutcome::Repaired(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, table: &str) -> Option<RepairOutcome> {
        self.tables
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, outcome)| *outcome)
    }
}

/// Replace NULL / empty intake payloads with `{}`. Idempotent.
pub fn repair_intake_payloads(conn: &Connection) -> StoreResult<RepairReport> {
    let mut report = RepairReport::default();

    for kind in IntakeKind::ALL {
        let table = kind.table();
        if !table_exists(conn, table)? {
            report.tables.push((table, RepairOutcome::Skipped));
            continue;
        }

        let affected = conn.execute(
            &format!(
                "UPDATE \"{table}\" SET formData = ?1 WHERE formData IS NULL OR formData = ''"
            ),
            params![EMPTY_FORM],
        )?;

        let outcome = if affected == 0 {
            debug!(table, "no corrupted intake records");
            RepairOutcome::Clean
        } else {
            info!(table, rows = affected, "repaired corrupted intake records");
            RepairOutcome::Repaired(affected)
        };
        report.tables.push((table, outcome));
    }

    Ok(report)
}
