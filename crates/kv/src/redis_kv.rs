//! Redis-backed KV store.

use async_trait::async_trait;
use pixel_core::config::RedisConfig;
use pixel_core::{PixelError, PixelResult};
use redis::AsyncCommands;
use tracing::info;

use crate::{KvPage, KvStore};

pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    /// Connect and verify with a PING.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self { client })
    }

    async fn conn(&self) -> PixelResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> PixelResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> PixelResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))
    }

    async fn delete(&self, key: &str) -> PixelResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))
    }

    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> PixelResult<i64> {
        let mut conn = self.conn().await?;
        // EXPIRE NX keeps the TTL set by whichever request created the key.
        let (count, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))?;
        Ok(count)
    }

    async fn list_prefix(&self, prefix: &str, cursor: u64, count: usize) -> PixelResult<KvPage> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| PixelError::Kv(e.to_string()))?;
        Ok(KvPage {
            keys,
            cursor: next_cursor,
        })
    }
}
