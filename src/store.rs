//! Key-value backend for queue and replication state.
//!
//! Every mutation the controller performs goes through the small capability
//! set exposed here: conditional sorted-set insert, atomic pop-min, plain
//! get/set with TTL, and a reachability ping. The `Embedded` variant keeps
//! everything in process memory and is the default for development and
//! tests; the `Remote` variant talks to a shared redis instance so several
//! controller replicas can coordinate on the same pending set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed value at {key}: {value:?}")]
    Malformed { key: String, value: String },
}

pub enum Store {
    Embedded(MemoryStore),
    Remote(RedisStore),
}

impl Store {
    pub fn embedded() -> Self {
        Store::Embedded(MemoryStore::new())
    }

    pub async fn remote(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Store::Remote(RedisStore { conn }))
    }

    /// Adds `(member, score)` to the sorted set at `key`, keeping the lower
    /// of the existing and new score when the member is already present.
    pub async fn zadd_if_lower(
        &self,
        key: &str,
        member: &str,
        score: f64,
    ) -> Result<(), StoreError> {
        match self {
            Store::Embedded(s) => s.zadd_if_lower(key, member, score),
            Store::Remote(s) => s.zadd_if_lower(key, member, score).await,
        }
    }

    /// Atomically removes and returns the member with the lowest score.
    /// Ties resolve lexicographically on the member.
    pub async fn zpop_min(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Store::Embedded(s) => s.zpop_min(key),
            Store::Remote(s) => s.zpop_min(key).await,
        }
    }

    pub async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Store::Embedded(s) => s.zrange(key),
            Store::Remote(s) => s.zrange(key).await,
        }
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        match self {
            Store::Embedded(s) => s.zcard(key),
            Store::Remote(s) => s.zcard(key).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Store::Embedded(s) => s.get(key),
            Store::Remote(s) => s.get(key).await,
        }
    }

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        match self {
            Store::Embedded(s) => s.set_with_ttl(key, value, ttl),
            Store::Remote(s) => s.set_with_ttl(key, value, ttl).await,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Store::Embedded(_) => Ok(()),
            Store::Remote(s) => s.ping().await,
        }
    }

    /// Releases backend resources. Embedded state is discarded; the remote
    /// connection closes when the manager is dropped.
    pub async fn close(&self) {
        match self {
            Store::Embedded(s) => s.clear(),
            Store::Remote(_) => debug!("releasing redis connection"),
        }
    }
}

/// In-process rendition of the redis subset the controller uses. TTLs are
/// enforced lazily: expired entries are dropped on the read that finds them.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    zsets: HashMap<String, HashMap<String, f64>>,
    values: HashMap<String, TtlValue>,
}

struct TtlValue {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Lock poisoning only happens if another holder panicked; the data
        // is a plain map, so recover rather than propagate the panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn zadd_if_lower(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        let stored = set.entry(member.to_string()).or_insert(score);
        if score < *stored {
            *stored = score;
        }
        Ok(())
    }

    fn zpop_min(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let mut lowest: Option<(String, f64)> = None;
        for (member, score) in set.iter() {
            let replace = match &lowest {
                None => true,
                Some((best_member, best_score)) => {
                    *score < *best_score
                        || (*score == *best_score && member.as_str() < best_member.as_str())
                }
            };
            if replace {
                lowest = Some((member.clone(), *score));
            }
        }
        match lowest {
            Some((member, _)) => {
                set.remove(&member);
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        let expired = match inner.values.get(key) {
            Some(entry) => entry
                .expires_at
                .is_some_and(|deadline| deadline <= Instant::now()),
            None => return Ok(None),
        };
        if expired {
            inner.values.remove(key);
            return Ok(None);
        }
        Ok(inner.values.get(key).map(|entry| entry.value.clone()))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.values.insert(
            key.to_string(),
            TtlValue {
                value: value.to_string(),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    fn clear(&self) {
        let mut inner = self.lock();
        inner.zsets.clear();
        inner.values.clear();
    }
}

// Bounds every remote round-trip so a dead backend surfaces as an error
// instead of wedging a worker.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(OP_TIMEOUT))?
            .map_err(StoreError::Redis)
    }

    async fn zadd_if_lower(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.run(redis::cmd("ZADD").arg(key).arg("LT").arg(score).arg(member))
            .await
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<String>, StoreError> {
        // Reply is a flat [member, score] pair, or empty when the set is.
        let popped: Vec<String> = self.run(redis::cmd("ZPOPMIN").arg(key)).await?;
        Ok(popped.into_iter().next())
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.run(redis::cmd("ZRANGE").arg(key).arg(0).arg(-1)).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.run(redis::cmd("ZCARD").arg(key)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.run(
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .arg(value),
        )
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }
}
