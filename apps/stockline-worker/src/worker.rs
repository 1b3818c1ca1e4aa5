//! Reconciliation worker
//!
//! Drains the reconcile queue: each poll takes the oldest queued identifiers,
//! runs the engine once per scope, and dequeues what that run covered. A scope
//! that fails or is cancelled stays queued and is picked up by a later poll;
//! re-running committed chunks is a no-op. Stops between polls and between
//! chunks on shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use stockline_core::{InventoryScope, ScopeAware};
use stockline_db::PendingIdentifier;
use stockline_reconcile::{ReconciliationEngine, RunSummary};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;

/// Queue entries grouped by scope, each group sorted by identifier.
pub fn group_by_scope(
    pending: Vec<PendingIdentifier>,
) -> BTreeMap<InventoryScope, Vec<PendingIdentifier>> {
    let mut grouped: BTreeMap<InventoryScope, Vec<PendingIdentifier>> = BTreeMap::new();
    for entry in pending {
        grouped.entry(entry.scope()).or_default().push(entry);
    }
    for entries in grouped.values_mut() {
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    }
    grouped
}

/// What one poll did.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Queue entries taken by the poll.
    pub claimed: usize,
    /// Entries removed from the queue after a clean run.
    pub completed: u64,
    /// Scopes left queued because their run failed or was cancelled.
    pub scopes_left: usize,
    pub summary: RunSummary,
}

/// Background worker driving periodic reconciliation runs.
pub struct ReconciliationWorker {
    engine: ReconciliationEngine,
    poll_interval: Duration,
    poll_limit: i64,
}

impl ReconciliationWorker {
    /// Create a new worker.
    pub fn new(engine: ReconciliationEngine, config: &WorkerConfig) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_limit: config.poll_limit,
        }
    }

    /// Start the worker. Returns once `shutdown` is cancelled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            poll_limit = self.poll_limit,
            batch_size = self.engine.config().batch_size,
            conflict_close_policy = %self.engine.config().conflict_close_policy,
            "Starting reconciliation worker"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Worker shutdown requested, stopping poll loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once(&shutdown).await;
                }
            }
        }

        info!("Worker stopped");
    }

    /// Reconcile one page of the queue.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> PollReport {
        let store = self.engine.store();
        let mut report = PollReport::default();

        let pending = match store.pending_identifiers(self.poll_limit).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to read reconcile queue");
                return report;
            }
        };
        if pending.is_empty() {
            debug!("Nothing to reconcile");
            return report;
        }
        report.claimed = pending.len();

        let grouped = group_by_scope(pending);
        let scopes = grouped.len();

        for (done, (scope, entries)) in grouped.into_iter().enumerate() {
            if shutdown.is_cancelled() {
                report.scopes_left += scopes - done;
                break;
            }

            let identifiers: Vec<String> = entries.iter().map(|e| e.identifier.clone()).collect();
            match self
                .engine
                .run_with_cancellation(&scope, &identifiers, shutdown)
                .await
            {
                Ok(summary) if summary.cancelled => {
                    report.summary.merge(&summary);
                    report.scopes_left += 1;
                }
                Ok(summary) => {
                    report.summary.merge(&summary);
                    match store.complete_pending(&scope, &entries).await {
                        Ok(removed) => report.completed += removed,
                        Err(e) => {
                            warn!(scope = %scope, error = %e, "Failed to dequeue reconciled identifiers");
                        }
                    }
                }
                Err(e) => {
                    report.scopes_left += 1;
                    if let Some(progress) = e.progress() {
                        report.summary.merge(progress);
                    }
                    error!(
                        scope = %scope,
                        identifiers = identifiers.len(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "Reconciliation run failed"
                    );
                }
            }
        }

        info!(
            claimed = report.claimed,
            completed = report.completed,
            scopes_left = report.scopes_left,
            identifiers_processed = report.summary.identifiers_processed,
            events_logged = report.summary.events_logged,
            conflicts_open = report.summary.conflicts_open,
            audit_failures = report.summary.audit_failures,
            "Poll complete"
        );

        report
    }
}

/// Resolves once Ctrl+C or SIGTERM is received, then cancels `shutdown`.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    shutdown.cancel();
}
