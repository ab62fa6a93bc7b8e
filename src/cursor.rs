//! Per-user replication state: the opaque incremental-sync cursor returned
//! by the admin API and the time of the last successful sync. Both carry a
//! TTL so abandoned mailboxes do not accumulate in the backend forever; a
//! missing cursor simply means the next sync runs full instead of
//! incremental.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::store::{Store, StoreError};

pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct CursorStore {
    store: Arc<Store>,
    namespace: String,
    ttl: Duration,
}

impl CursorStore {
    pub fn new(store: Arc<Store>, namespace: &str, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            ttl,
        }
    }

    fn state_key(&self, username: &str) -> String {
        format!("{}:state:{}", self.namespace, username)
    }

    fn last_sync_key(&self, username: &str) -> String {
        format!("{}:last_replication:{}", self.namespace, username)
    }

    /// The cursor from the user's last successful sync, or `None` if the
    /// user has never synced (or the cursor expired).
    pub async fn cursor(&self, username: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&self.state_key(username)).await
    }

    pub async fn set_cursor(&self, username: &str, cursor: &str) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(&self.state_key(username), cursor, self.ttl)
            .await
    }

    /// When the user last synced successfully. Stored as integer unix
    /// seconds; sub-second precision is dropped on purpose to keep the
    /// value compact and comparable across processes.
    pub async fn last_sync(&self, username: &str) -> Result<Option<SystemTime>, StoreError> {
        let key = self.last_sync_key(username);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let seconds: u64 = raw
            .parse()
            .map_err(|_| StoreError::Malformed { key, value: raw })?;
        Ok(Some(UNIX_EPOCH + Duration::from_secs(seconds)))
    }

    pub async fn set_last_sync(&self, username: &str, at: SystemTime) -> Result<(), StoreError> {
        let seconds = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.store
            .set_with_ttl(&self.last_sync_key(username), &seconds.to_string(), self.ttl)
            .await
    }
}
