//! schemasync CLI
//!
//! Plans and applies schema synchronisation between configured connections.
//! Results are printed to stdout as a JSON envelope; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

use schemasync::prelude::*;

/// Cross-dialect schema synchronisation for SQLite and PostgreSQL.
#[derive(Parser)]
#[command(name = "schemasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file describing the available connections.
    #[arg(short, long, env = "SCHEMASYNC_CONNECTIONS", default_value = "connections.json")]
    connections: PathBuf,

    /// Directory holding backups.
    #[arg(short, long, env = "SCHEMASYNC_BACKUP_DIR", default_value = "backups")]
    backups_dir: PathBuf,

    /// PostgreSQL dump utility.
    #[arg(long, env = "SCHEMASYNC_PG_DUMP", default_value = "pg_dump")]
    dump_tool: PathBuf,

    /// PostgreSQL lock timeout for migrations, in milliseconds.
    #[arg(long, env = "SCHEMASYNC_LOCK_TIMEOUT_MS", default_value_t = 5_000)]
    lock_timeout_ms: u64,

    /// PostgreSQL statement timeout for migrations, in milliseconds.
    #[arg(long, env = "SCHEMASYNC_STATEMENT_TIMEOUT_MS", default_value_t = 60_000)]
    statement_timeout_ms: u64,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings::new(&self.backups_dir)
            .dump_tool(&self.dump_tool)
            .timeouts(ApplyTimeouts {
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
                statement_timeout: Duration::from_millis(self.statement_timeout_ms),
            })
    }
}

/// Source, target and tables shared by `plan` and `apply`.
#[derive(Args)]
struct Selection {
    /// Connection to read the desired structure from.
    source: String,

    /// Connection to bring in line.
    target: String,

    /// Tables to compare.
    #[arg(required = true)]
    tables: Vec<String>,

    /// Also drop target tables that do not exist on the source.
    #[arg(long)]
    fully_sync: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the steps needed to bring the target in line.
    Plan(Selection),

    /// Recompute the plan and apply it in one transaction.
    Apply {
        #[command(flatten)]
        selection: Selection,

        /// Back up the target first; a failed backup aborts the apply.
        #[arg(long)]
        backup: bool,
    },

    /// Replace a SQLite target's file with a backup.
    Restore {
        /// Connection to restore.
        target: String,

        /// Backup file, relative to the backups directory.
        backup: PathBuf,
    },

    /// List backups, newest first.
    Backups,

    /// List the tables and views of a connection.
    Tables {
        /// Connection to inspect.
        connection: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = cli.settings();
    debug!(connections = %cli.connections.display(), "Loading connections");
    let store = JsonConnectionStore::new(&cli.connections);
    let service = MigrationService::from_store(&store, &settings).await?;

    let success = match cli.command {
        Commands::Plan(selection) => {
            let request = PlanRequest {
                source_id: selection.source,
                target_id: selection.target,
                tables: selection.tables,
                options: PlanOptions {
                    fully_sync: selection.fully_sync,
                },
            };
            emit(service.plan_migration(&request).await)?
        }

        Commands::Apply { selection, backup } => {
            let request = ApplyRequest {
                source_id: selection.source,
                target_id: selection.target,
                tables: selection.tables,
                options: ApplyOptions {
                    fully_sync: selection.fully_sync,
                    create_backup: backup,
                },
            };
            emit(service.apply_migration(&request).await)?
        }

        Commands::Restore { target, backup } => {
            let request = RestoreRequest {
                target_id: target,
                backup_path: backup,
            };
            emit(service.restore_backup(&request).await)?
        }

        Commands::Backups => emit(service.list_backups().await)?,

        Commands::Tables { connection } => emit(service.list_tables(&connection).await)?,
    };

    for id in service.registry().ids().await {
        if let Ok(driver) = service.registry().get(&id).await {
            driver.close().await;
        }
    }

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints the envelope and reports whether the operation succeeded.
fn emit<T: Serialize>(result: schemasync::error::Result<T>) -> anyhow::Result<bool> {
    let response: Response<T> = result.into();
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(response.success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_flags() {
        let cli = Cli::try_parse_from([
            "schemasync",
            "--lock-timeout-ms",
            "250",
            "--statement-timeout-ms",
            "1500",
            "backups",
        ])
        .unwrap();
        let timeouts = cli.settings().timeouts;
        assert_eq!(timeouts.lock_timeout, Duration::from_millis(250));
        assert_eq!(timeouts.statement_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        let command = Cli::command();
        command.clone().debug_assert();
        for (flag, env) in [
            ("lock_timeout_ms", "SCHEMASYNC_LOCK_TIMEOUT_MS"),
            ("statement_timeout_ms", "SCHEMASYNC_STATEMENT_TIMEOUT_MS"),
        ] {
            let arg = command
                .get_arguments()
                .find(|a| a.get_id() == flag)
                .unwrap();
            assert_eq!(arg.get_env().and_then(|e| e.to_str()), Some(env));
        }
    }
}
