//! Stockline reconciliation worker.
//!
//! Connects to Postgres, applies migrations, and keeps canonical inventory in
//! step with the source feeds until Ctrl+C or SIGTERM.

mod config;
mod logging;
mod worker;

use std::sync::Arc;

use stockline_db::{run_migrations, DbPool};
use stockline_reconcile::{PgReconciliationStore, ReconciliationEngine};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::worker::{shutdown_signal, ReconciliationWorker};

#[tokio::main]
async fn main() {
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Configuration error: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.log_filter);

    let pool = match DbPool::connect_with(&config.database_url, config.max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Failed to connect to database");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_migrations(&pool).await {
        error!(error = %e, "Failed to run migrations");
        std::process::exit(1);
    }

    let store = Arc::new(PgReconciliationStore::from_db_pool(&pool));
    let engine = match ReconciliationEngine::with_config(store, config.reconciliation.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Invalid reconciliation configuration");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let worker = ReconciliationWorker::new(engine, &config);
    worker.run(shutdown).await;

    info!("Shutdown complete");
}
