//! In-process KV backend: DashMap with per-entry expiry. Used by tests and
//! single-node development deployments.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use pixel_core::PixelResult;

use crate::{KvPage, KvStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryKv {
    store: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. The Redis backend expires server-side; here a
    /// periodic sweep keeps the map bounded.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| entry.live());
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> PixelResult<Option<String>> {
        // Drop the shard guard before removing the expired entry.
        let value = {
            match self.store.get(key) {
                Some(entry) if entry.live() => Some(Some(entry.value.clone())),
                Some(_) => Some(None),
                None => None,
            }
        };
        match value {
            Some(Some(live)) => Ok(Some(live)),
            Some(None) => {
                self.store.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> PixelResult<()> {
        self.store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> PixelResult<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl_secs: u64) -> PixelResult<i64> {
        // The entry API holds the shard lock, making the read-modify-write
        // linearizable within a key.
        let mut entry = self.store.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        });
        if !entry.live() {
            entry.value = "0".to_string();
            entry.expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        }
        let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = count.to_string();
        Ok(count)
    }

    async fn list_prefix(&self, prefix: &str, cursor: u64, count: usize) -> PixelResult<KvPage> {
        let mut keys: Vec<String> = self
            .store
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().live())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        let start = cursor as usize;
        let end = (start + count).min(keys.len());
        let page: Vec<String> = keys[start.min(keys.len())..end].to_vec();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok(KvPage {
            keys: page,
            cursor: next,
        })
    }
}
