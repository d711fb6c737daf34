use std::net::SocketAddr;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::{http, log_info, log_warn, store::ObservationStore};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::server";

/// Reconciles, then serves HTTP until Ctrl-C.
pub async fn serve(store: ObservationStore, bind: SocketAddr) -> anyhow::Result<()> {
    // Requests must never see a table that is behind the backup log.
    store
        .reconcile()
        .await
        .context("startup reconcile failed; refusing to serve")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log_warn!("Cannot listen for Ctrl-C: {err}");
                return;
            }
            log_info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let app = http::create_router(store);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log_info!("Listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    log_info!("Server stopped");
    Ok(())
}
