//! Sync handler: turns a dequeued username into an admin API sync call.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cursor::CursorStore;
use crate::doveadm::DoveadmClient;
use crate::metrics;
use crate::worker::EventHandler;

pub struct SyncEventHandler {
    client: Arc<DoveadmClient>,
    cursors: Arc<CursorStore>,
    destination: String,
}

impl SyncEventHandler {
    pub fn new(client: Arc<DoveadmClient>, cursors: Arc<CursorStore>, destination: &str) -> Self {
        Self {
            client,
            cursors,
            destination: destination.to_string(),
        }
    }
}

#[async_trait]
impl EventHandler for SyncEventHandler {
    async fn handle(&self, username: &str) -> anyhow::Result<()> {
        // A cursor read failure downgrades to a full sync rather than
        // blocking replication; the admin API is the source of truth.
        let cursor = match self.cursors.cursor(username).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(username, error = %err, "failed to read sync cursor, running full sync");
                None
            }
        };

        info!(
            username,
            destination = %self.destination,
            incremental = cursor.is_some(),
            "syncing user"
        );

        let outcome = match self
            .client
            .sync(username, &self.destination, cursor.as_deref())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                metrics::SYNC_FAILURES.inc();
                return Err(err.into());
            }
        };

        // State writes are best effort: losing the cursor means a slower
        // next sync, not data loss.
        if let Some(state) = outcome.state {
            if let Err(err) = self.cursors.set_cursor(username, &state).await {
                warn!(username, error = %err, "failed to store sync cursor");
            } else {
                debug!(username, "stored sync cursor");
            }
        }
        if let Err(err) = self.cursors.set_last_sync(username, SystemTime::now()).await {
            warn!(username, error = %err, "failed to store last sync time");
        }

        metrics::SYNCS_COMPLETED.inc();
        info!(username, "sync complete");
        Ok(())
    }
}
