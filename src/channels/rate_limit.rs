use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-address "do not send before" timestamps for one destination kind.
#[derive(Debug, Default)]
pub struct RateLimiter {
    until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `now + ceil(retry_after)` for `address` and returns it.
    pub fn record(&self, address: &str, retry_after_seconds: f64, now: DateTime<Utc>) -> DateTime<Utc> {
        let wait = if retry_after_seconds.is_finite() && retry_after_seconds >= 0.0 {
            retry_after_seconds.ceil() as i64
        } else {
            1
        };
        let expiry = now + Duration::seconds(wait);
        let mut map = self.until.lock().unwrap_or_else(|p| p.into_inner());
        let entry = map.entry(address.to_string()).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        *entry
    }

    /// Expiry for `address` if it is still in the future; expired entries are cleared.
    pub fn limited_until(&self, address: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut map = self.until.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(address).copied() {
            Some(expiry) if expiry > now => Some(expiry),
            Some(_) => {
                map.remove(address);
                None
            }
            None => None,
        }
    }

    pub fn is_rate_limited(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.limited_until(address, now).is_some()
    }

    pub fn clear(&self, address: &str) {
        let mut map = self.until.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(address);
    }
}
