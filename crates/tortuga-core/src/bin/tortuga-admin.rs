//! Tortuga admin CLI - inspect, migrate and repair a tablet datastore

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OpenFlags};
use tortuga_core::db::Migrator;
use tortuga_core::{IntakeKind, StorageGateway, StoreConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tortuga-admin")]
#[command(version = "0.1.0")]
#[command(about = "Operator tool for La Tortuga intake tablet datastores")]
#[command(long_about = r#"
Opens a tablet datastore and reports or fixes its state:
  • Schema status per table (without modifying anything)
  • Schema migration of legacy tables
  • Intake payload repair
  • Records not yet acknowledged by a peer

Example usage:
  tortuga-admin --database la_tortuga.db status
  tortuga-admin --config tablet.toml migrate
  tortuga-admin --database la_tortuga.db unsynced --before 1718000000000
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Tablet id stamped on records (overrides the config file)
    #[arg(short, long, global = true)]
    tablet: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show schema state per table without changing the file
    Status,

    /// Open the datastore, migrating legacy tables
    Migrate,

    /// Run integrity repair on intake payloads
    Repair,

    /// Compact the file and rebuild search indexes
    Vacuum,

    /// Count records not acknowledged since a timestamp
    Unsynced {
        /// ms epoch; 1 lists rows that were never synced
        #[arg(short, long, default_value = "1")]
        before: i64,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(tablet) = &cli.tablet {
        config.tablet_id = tablet.clone();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(&cli)?;
    let path = config.database_path.clone();

    match cli.command {
        Commands::Status => {
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .with_context(|| format!("opening {}", path.display()))?;
            let statuses = Migrator::new(&conn).inspect()?;

            println!("Database: {}", path.display());
            for status in statuses {
                println!("  {:<26} {}", status.table, status.state);
                for column in &status.drift.extra_columns {
                    println!("      extra column:   {}", column);
                }
                for column in &status.drift.missing_columns {
                    println!("      missing column: {}", column);
                }
                for fk in &status.drift.missing_foreign_keys {
                    println!("      missing FK:     {}", fk);
                }
            }
        }

        Commands::Migrate => {
            tracing::info!("Migrating {}", path.display());
            let gateway = StorageGateway::open_with(config)?;
            let report = gateway
                .startup_report()
                .context("gateway opened without a startup report")?;

            println!("Schema version: {}", report.migration.schema_version);
            for table in &report.migration.tables {
                let steps: Vec<String> = table.path.iter().map(|s| s.to_string()).collect();
                print!("  {:<26} {}", table.table, steps.join(" -> "));
                if let Some(rows) = table.rows_copied {
                    print!(" ({} rows copied)", rows);
                }
                println!();
                if let Some(error) = &table.error {
                    println!("      failed: {}", error);
                }
            }
            if !report.migration.is_converged() {
                anyhow::bail!("some tables are still in a legacy shape");
            }
        }

        Commands::Repair => {
            // open() already runs the pass; rerun only if it failed there.
            let gateway = StorageGateway::open_with(config)?;
            let report = match gateway.startup_report().and_then(|r| r.repair.clone()) {
                Some(report) => report,
                None => gateway.repair()?,
            };
            for (table, outcome) in &report.tables {
                println!("  {:<26} {:?}", table, outcome);
            }
            println!("Repaired {} intake records", report.total_repaired());
        }

        Commands::Vacuum => {
            let gateway = StorageGateway::open_with(config)?;
            gateway.vacuum()?;
            println!("Vacuumed {}", gateway.config().database_path.display());
        }

        Commands::Unsynced { before } => {
            let gateway = StorageGateway::open_with(config)?;
            println!(
                "  {:<26} {}",
                "patients",
                gateway.patients().list_unsynced(before)?.len()
            );
            println!(
                "  {:<26} {}",
                "visits",
                gateway.visits().list_unsynced(before)?.len()
            );
            for kind in IntakeKind::ALL {
                println!(
                    "  {:<26} {}",
                    kind.table(),
                    gateway.intake(kind).list_unsynced(before)?.len()
                );
            }
        }
    }

    Ok(())
}
