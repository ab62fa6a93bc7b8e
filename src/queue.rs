//! Coalescing priority queue for pending replications.
//!
//! Members of a single sorted set represent users awaiting a sync. The score
//! is `unix_seconds / priority_factor`, so lower scores come due sooner: a
//! factor above 1 pulls a user forward, a factor below 1 pushes them back.
//! Because inserts keep the lowest score seen for a member, any burst of
//! change events for one user collapses into a single pending entry, and a
//! later low-priority event can never push an already-urgent user backward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::store::{Store, StoreError};

const SYNC_TASKS: &str = "sync_tasks";

/// Totals of successful operations since process start. Empty dequeues are
/// not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounters {
    pub enqueues: u64,
    pub dequeues: u64,
}

pub struct ReplicationQueue {
    store: Arc<Store>,
    tasks_key: String,
    enqueues: AtomicU64,
    dequeues: AtomicU64,
}

impl ReplicationQueue {
    pub fn new(store: Arc<Store>, namespace: &str) -> Self {
        Self {
            store,
            tasks_key: format!("{namespace}:{SYNC_TASKS}"),
            enqueues: AtomicU64::new(0),
            dequeues: AtomicU64::new(0),
        }
    }

    /// Schedules `username` for replication. Non-positive and non-finite
    /// factors are treated as 1.0. Re-enqueueing a pending user only ever
    /// moves them earlier, never later.
    pub async fn enqueue(&self, username: &str, priority_factor: f64) -> Result<(), StoreError> {
        let factor = if priority_factor.is_finite() && priority_factor > 0.0 {
            priority_factor
        } else {
            1.0
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let score = now / factor;

        self.store
            .zadd_if_lower(&self.tasks_key, username, score)
            .await?;
        self.enqueues.fetch_add(1, Ordering::Relaxed);
        debug!(username, score, "enqueued user for replication");
        Ok(())
    }

    /// Removes and returns the most urgent user, or `None` when nothing is
    /// pending. Atomic across concurrent callers: a single entry is handed
    /// to exactly one of them.
    pub async fn dequeue(&self) -> Result<Option<String>, StoreError> {
        let popped = self.store.zpop_min(&self.tasks_key).await?;
        if popped.is_some() {
            self.dequeues.fetch_add(1, Ordering::Relaxed);
        }
        Ok(popped)
    }

    pub async fn size(&self) -> Result<u64, StoreError> {
        self.store.zcard(&self.tasks_key).await
    }

    /// All pending users ordered by urgency. Used by tests and the queue
    /// depth gauge; regular consumption goes through `dequeue`.
    pub async fn order(&self) -> Result<Vec<String>, StoreError> {
        self.store.zrange(&self.tasks_key).await
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            dequeues: self.dequeues.load(Ordering::Relaxed),
        }
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
