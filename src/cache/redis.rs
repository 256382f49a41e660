use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::KvStore;

/// Redis-backed remote tier. One thread-safe connection manager shared by
/// every backtest; reconnects are handled internally by the manager.
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!(%url, "connected remote factor cache");
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> anyhow::Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.manager.clone();
        // redis-rs collapses a single-key MGET response; go through the
        // generic command to keep the Vec shape.
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> anyhow::Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();

        let mut cmd = redis::cmd("MSET");
        for (key, value) in &pairs {
            cmd.arg(key).arg(value.as_slice());
        }
        cmd.query_async::<()>(&mut conn).await?;

        // Batched EXPIRE to amortise round-trips.
        let mut pipe = redis::pipe();
        for (key, _) in &pairs {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.keys(format!("{prefix}*")).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }
}
