//! KV store adapter (Redis).
//!
//! Thin wrapper over a shared `ConnectionManager` exposing only the
//! operations the pipeline needs: TTL strings, atomic set-if-absent,
//! counters, and pub/sub publish. Callers on fail-open paths downgrade
//! errors to warnings; this layer just reports them.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    /// Atomic `SET NX EX`. Returns `true` when the key was newly set.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Remaining TTL in seconds; `None` when the key does not exist or
    /// carries no expiry.
    pub async fn ttl_secs(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(if ttl >= 0 { Some(ttl) } else { None })
    }

    /// Float counter with a sliding expiry (burn-rate buckets).
    pub async fn incr_by_float(&self, key: &str, amount: f64, ttl_seconds: i64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let value: f64 = conn.incr(key, amount).await?;
        let _: () = conn.expire(key, ttl_seconds).await?;
        Ok(value)
    }

    /// Integer counter with a sliding expiry (rate/request buckets).
    pub async fn incr_window(&self, key: &str, ttl_seconds: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        let _: () = conn.expire(key, ttl_seconds).await?;
        Ok(value)
    }

    /// Best-effort announcement channel for sibling proxies.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}
