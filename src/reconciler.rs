//! Background reconciliation: periodically enumerate every mailbox and
//! enqueue the ones whose last successful sync is older than the staleness
//! threshold. This floor guarantees each user replicates eventually even if
//! the event pipeline drops or never emits a change for them.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cursor::CursorStore;
use crate::doveadm::{DoveadmError, UserDirectory};
use crate::metrics;
use crate::queue::ReplicationQueue;

const RECONCILE_FACTOR: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("reconciler still running after {0:?}")]
    StopTimeout(Duration),
}

/// Outcome counts of a single reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub listed: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct Reconciler {
    directory: Arc<dyn UserDirectory>,
    queue: Arc<ReplicationQueue>,
    cursors: Arc<CursorStore>,
    interval: Duration,
    threshold: Duration,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        queue: Arc<ReplicationQueue>,
        cursors: Arc<CursorStore>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            directory,
            queue,
            cursors,
            interval,
            threshold,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Runs one pass immediately, then one per interval until stopped.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            warn!("reconciler already started");
            return;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "starting background reconciliation"
        );

        let this = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        info!("background reconciliation stopping");
                        return;
                    }
                    // The first tick completes immediately, giving the
                    // startup pass.
                    _ = ticker.tick() => {
                        if let Err(err) = this.run_pass().await {
                            error!(error = %err, "reconciliation pass failed");
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop(&self, grace: Duration) -> Result<(), ReconcilerError> {
        let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };
        let _ = self.stop_tx.send(true);
        tokio::time::timeout(grace, handle)
            .await
            .map(|_| ())
            .map_err(|_| ReconcilerError::StopTimeout(grace))
    }

    /// A single reconciliation sweep. A listing failure aborts the pass;
    /// per-user failures are counted and skipped over.
    pub async fn run_pass(&self) -> Result<PassStats, DoveadmError> {
        let started = Instant::now();
        let users = self.directory.list_users().await?;
        debug!(count = users.len(), "listed users for reconciliation");

        let mut stats = PassStats {
            listed: users.len(),
            ..PassStats::default()
        };
        let now = SystemTime::now();

        for user in &users {
            let last_sync = match self.cursors.last_sync(&user.username).await {
                Ok(last_sync) => last_sync,
                Err(err) => {
                    warn!(
                        username = %user.username,
                        error = %err,
                        "failed to read last sync time, enqueueing anyway"
                    );
                    stats.errors += 1;
                    None
                }
            };

            if let Some(last_sync) = last_sync {
                // A timestamp in the future reads as age zero, so clock
                // skew costs at most one skipped cycle.
                let age = now.duration_since(last_sync).unwrap_or_default();
                if age < self.threshold {
                    stats.skipped += 1;
                    continue;
                }
            }

            match self.queue.enqueue(&user.username, RECONCILE_FACTOR).await {
                Ok(()) => stats.enqueued += 1,
                Err(err) => {
                    error!(username = %user.username, error = %err, "failed to enqueue stale user");
                    stats.errors += 1;
                }
            }
        }

        metrics::RECONCILER_PASSES.inc();
        metrics::RECONCILER_ENQUEUED.inc_by(stats.enqueued as u64);
        info!(
            listed = stats.listed,
            enqueued = stats.enqueued,
            skipped = stats.skipped,
            errors = stats.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciliation pass complete"
        );
        Ok(stats)
    }
}
