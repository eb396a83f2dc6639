//! Key/value store behind the deferred-job queue, idempotency markers, and
//! rate counters. Redis in production, an in-process DashMap backend for
//! tests and single-node development.

mod memory;
mod redis_kv;

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

use async_trait::async_trait;
use pixel_core::PixelResult;

/// One page of a prefix listing. `cursor == 0` means the scan is complete.
#[derive(Debug, Clone, Default)]
pub struct KvPage {
    pub keys: Vec<String>,
    pub cursor: u64,
}

/// Minimal KV surface the core needs: TTL'd strings, atomic counters, and
/// prefix-listable keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> PixelResult<Option<String>>;

    /// Set `key` to `value` with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> PixelResult<()>;

    async fn delete(&self, key: &str) -> PixelResult<()>;

    /// Atomically increment the integer at `key`, creating it with the given
    /// TTL when absent. Returns the post-increment value. Increments within
    /// one key are linearizable.
    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> PixelResult<i64>;

    /// List keys matching `prefix`, one page per call.
    async fn list_prefix(&self, prefix: &str, cursor: u64, count: usize) -> PixelResult<KvPage>;
}
