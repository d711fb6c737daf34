use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

use crate::store::StoreConfig;

#[derive(Parser, Debug)]
#[command(name = "shelf-audit")]
#[command(about = "Observation store and HTTP service for shelf-audit devices")]
pub struct Args {
    /// Path to the SQLite database
    #[arg(long, env = "AUDIT_DB_PATH", default_value = "data.db")]
    pub db_path: PathBuf,

    /// Path to the append-only backup log
    #[arg(long, env = "AUDIT_BACKUP_LOG", default_value = "observations.log.jsonl")]
    pub backup_log: PathBuf,

    /// Path to the settings file holding the category table
    #[arg(long, env = "AUDIT_SETTINGS", default_value = "settings.json")]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reconcile from the backup log, then serve HTTP (default)
    Serve {
        #[arg(long, env = "AUDIT_BIND", default_value = "0.0.0.0:5000")]
        bind: SocketAddr,
    },

    /// Replay the backup log into the table and print the report
    Reconcile,

    /// Print table presence, row count and schema version
    Check,

    /// Drop the observation table and restore it from the backup log
    Rebuild {
        /// Required; the table is dropped before the log is replayed
        #[arg(long)]
        yes_drop_table: bool,
    },
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            db_path: self.db_path.clone(),
            backup_log_path: self.backup_log.clone(),
            settings_path: self.settings.clone(),
        }
    }

    /// The subcommand, with `serve` on the default bind address when none
    /// was given.
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or_else(|| Command::Serve {
            bind: default_bind(),
        })
    }
}

fn default_bind() -> SocketAddr {
    std::env::var("AUDIT_BIND")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5000)))
}
