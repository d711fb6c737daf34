pub mod aggregate;
pub mod backup;
pub mod cli;
pub mod codec;
pub mod db;
pub mod error;
pub mod http;
pub mod server;
pub mod settings;
pub mod store;
mod utils;

use anyhow::{bail, Context};
use clap::Parser;

use cli::{Args, Command};
use store::ObservationStore;

pub use error::{StoreError, StoreResult};
pub use store::StoreConfig;

pub fn run() -> anyhow::Result<()> {
    // Info by default; RUST_LOG overrides
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let store = ObservationStore::open(&args.store_config())?;

        let result = match args.resolved_command() {
            Command::Serve { bind } => server::serve(store.clone(), bind).await,
            Command::Reconcile => {
                let report = store.reconcile().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Command::Check => {
                let health = store.check_health().await?;
                println!("{}", serde_json::to_string_pretty(&health)?);
                Ok(())
            }
            Command::Rebuild { yes_drop_table } => {
                if !yes_drop_table {
                    bail!("rebuild drops the observations table; pass --yes-drop-table to confirm");
                }
                let report = store.rebuild().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        };

        store.close();
        result
    })
}
