//! Clock and identifier service. Injectable so tests can pin time and
//! replay the session-window and scheduler-delay logic deterministically.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use uuid::Uuid;

pub const VISITOR_COOKIE_PREFIX: &str = "pv_";
pub const SESSION_COOKIE_PREFIX: &str = "ps_";
const COOKIE_HEX_LEN: usize = 32;

/// Monotonic-enough UTC time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Fresh opaque identifier (UUID v4).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_visitor_cookie() -> String {
    generate_cookie(VISITOR_COOKIE_PREFIX)
}

pub fn generate_session_cookie() -> String {
    generate_cookie(SESSION_COOKIE_PREFIX)
}

fn generate_cookie(prefix: &str) -> String {
    let mut bytes = [0u8; COOKIE_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut cookie = String::with_capacity(prefix.len() + COOKIE_HEX_LEN);
    cookie.push_str(prefix);
    for b in bytes {
        cookie.push_str(&format!("{b:02x}"));
    }
    cookie
}

/// Format check only: expected prefix followed by a 32-char hex body.
pub fn is_valid_visitor_cookie(cookie: &str) -> bool {
    is_valid_cookie(cookie, VISITOR_COOKIE_PREFIX)
}

pub fn is_valid_session_cookie(cookie: &str) -> bool {
    is_valid_cookie(cookie, SESSION_COOKIE_PREFIX)
}

fn is_valid_cookie(cookie: &str, prefix: &str) -> bool {
    match cookie.strip_prefix(prefix) {
        Some(body) => {
            body.len() == COOKIE_HEX_LEN && body.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_cookie_round_trips_validation() {
        let visitor = generate_visitor_cookie();
        assert!(is_valid_visitor_cookie(&visitor));
        assert!(!is_valid_session_cookie(&visitor));

        let session = generate_session_cookie();
        assert!(is_valid_session_cookie(&session));
    }

    #[test]
    fn test_malformed_cookies_rejected() {
        assert!(!is_valid_visitor_cookie(""));
        assert!(!is_valid_visitor_cookie("pv_short"));
        assert!(!is_valid_visitor_cookie("pv_zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"));
        assert!(!is_valid_visitor_cookie(
            "px_0123456789abcdef0123456789abcdef"
        ));
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(31));
        assert_eq!(clock.now() - start, Duration::minutes(31));
    }
}
