//! Contact tracing for school cohorts.
//!
//! Members report daily health, interactions and vaccination through a small HTTP
//! API. Every write becomes a task on a Postgres-backed queue, and a pool of
//! workers runs them. A health report that scores unhealthy queues a risk
//! notification. The worker walks the school's interaction graph, groups contacts
//! into tiers by distance and mails the school's administrators.
//!
//! # Running
//!
//! ```sh
//! cohort-contact-tracer init-db
//! cohort-contact-tracer seed
//! cohort-contact-tracer serve
//! cohort-contact-tracer worker
//! ```
//!
//! Per-school settings (`symptom_criteria`, `risk_notification`, `daily_digest`)
//! live under `schools/{school}/` in Vault KV v2, or in `SECRETS_DIR` as JSON files
//! when Vault is not configured.

use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod queue;
pub mod report;
pub mod risk;
pub mod secrets;
pub mod state;
pub mod store;
pub mod tasks;
pub mod traversal;
pub mod worker;

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
