pub mod factor_cache;
pub mod redis;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Byte-oriented remote KV store (Redis in production, in-memory in tests).
/// All operations are atomic from the caller's perspective.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;
    async fn mget(&self, keys: &[String]) -> anyhow::Result<Vec<Option<Vec<u8>>>>;
    /// MSET followed by batched EXPIRE.
    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> anyhow::Result<()>;
    async fn del_prefix(&self, prefix: &str) -> anyhow::Result<u64>;
}

/// In-process KV store with real TTL semantics. Used by tests and as the
/// remote stand-in when no `REDIS_URL` is configured.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<FxHashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) => {
                if expires.is_some_and(|at| Instant::now() >= at) {
                    entries.remove(key);
                    None
                } else {
                    Some(value.clone())
                }
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> anyhow::Result<Vec<Option<Vec<u8>>>> {
        Ok(keys.iter().map(|k| self.live(k)).collect())
    }

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> anyhow::Result<()> {
        let expires = Some(Instant::now() + ttl);
        let mut entries = self.entries.lock();
        for (key, value) in pairs {
            entries.insert(key, (value, expires));
        }
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
