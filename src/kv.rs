use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::time::{Duration, Instant};

use crate::error::Result;

/// Contract of the distributed key/value store backing remote thresholds.
/// The store itself is an external collaborator; the engine only consumes
/// this interface.
#[async_trait]
pub trait RemoteKv: Send + Sync {
    /// Create `key` with `value` and a TTL unless it already exists.
    /// Returns true when the key was created.
    async fn set_if_absent(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<bool>;

    /// Atomically add `delta` to `key` and return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn set(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<()>;
}

/// Redis adapter over a shared connection manager.
pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisKv { conn })
    }
}

#[async_trait]
impl RemoteKv for RedisKv {
    async fn set_if_absent(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;
        Ok(created)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process stand-in for tests and single-node deployments. TTLs use the
/// tokio clock, so tests can drive expiry with paused time.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }

    fn prune(entries: &mut HashMap<String, MemoryEntry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
    }

    fn ttl(ttl_seconds: u64) -> Option<Instant> {
        if ttl_seconds == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(ttl_seconds))
        }
    }
}

#[async_trait]
impl RemoteKv for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Self::ttl(ttl_seconds),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries);
        let entry = entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += delta;
        Ok(entry.value)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, value: i64, ttl_seconds: u64) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Self::ttl(ttl_seconds),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_existing_keys() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", 0, 60).await.unwrap());
        assert!(!kv.set_if_absent("k", 9, 60).await.unwrap());
        assert_eq!(kv.incr_by("k", 2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn prefix_scan_and_delete() {
        let kv = MemoryKv::new();
        kv.set("FC_1_a", 1, 60).await.unwrap();
        kv.set("FC_1_b", 1, 60).await.unwrap();
        kv.set("FC_2_a", 1, 60).await.unwrap();
        let mut keys = kv.keys("FC_1_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["FC_1_a", "FC_1_b"]);

        kv.delete("FC_1_a").await.unwrap();
        assert_eq!(kv.keys("FC_1_").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_the_clock() {
        let kv = MemoryKv::new();
        kv.set_if_absent("k", 0, 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(kv.set_if_absent("k", 0, 10).await.unwrap());
    }
}
