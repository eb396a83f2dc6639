//! Fixed-window IP-based throttling, sharded by IP prefix so one bad subnet
//! saturates its own counter and nothing else.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pixel_core::clock::SharedClock;
use pixel_core::PixelResult;
use pixel_kv::KvStore;

const MAX_LIMIT: u32 = 10_000;
const MAX_WINDOW_SECS: u64 = 86_400;

/// Route classes with their default budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Tracking,
    Admin,
    PublicRead,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Tracking => "tracking",
            RouteClass::Admin => "admin",
            RouteClass::PublicRead => "public_read",
        }
    }

    /// `(limit, window_secs)` defaults.
    pub fn default_budget(&self) -> (u32, u64) {
        match self {
            RouteClass::Tracking => (100, 60),
            RouteClass::Admin => (100, 3_600),
            RouteClass::PublicRead => (1_000, 3_600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(0) as u64
    }
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: SharedClock) -> Self {
        Self { kv, clock }
    }

    /// Count this request against the caller's shard and decide. Counter
    /// increments are atomic in the backing store, so two requests crossing
    /// the limit together produce exactly `limit` allows.
    pub async fn allow(
        &self,
        route: RouteClass,
        ip: &str,
        limit: u32,
        window_secs: u64,
    ) -> PixelResult<RateLimitDecision> {
        let limit = limit.clamp(1, MAX_LIMIT);
        let window_secs = window_secs.clamp(1, MAX_WINDOW_SECS);

        let now = self.clock.now();
        let window_start = (now.timestamp() as u64 / window_secs) * window_secs;
        let shard = shard_key(ip);
        let key = format!("ratelimit:{}:{}:{}", route.as_str(), shard, window_start);

        let count = self.kv.incr_ex(&key, window_secs).await?;
        let allowed = count <= limit as i64;
        if !allowed {
            metrics::counter!("rate_limit.denied", "route" => route.as_str()).increment(1);
        }

        let reset_at = Utc
            .timestamp_opt((window_start + window_secs) as i64, 0)
            .single()
            .unwrap_or(now);
        Ok(RateLimitDecision {
            allowed,
            remaining: (limit as i64 - count).max(0) as u32,
            reset_at,
        })
    }
}

/// /16 for IPv4 (first two octets), first 32 bits (two hextets) for IPv6.
/// Unparseable inputs fall back to the raw string, still a stable key.
fn shard_key(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            format!("{}.{}", octets[0], octets[1])
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!("{:x}:{:x}", segments[0], segments[1])
        }
        Err(_) => ip.to_string(),
    }
}
