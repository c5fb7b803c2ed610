use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

/// Time source. Injected everywhere a timestamp or TTL decision is made so
/// tests can drive time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Shared TTL key-value store. The service only ever needs these seven
/// operations; a Redis-compatible backend implements the same trait for
/// cross-process deployments.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns `true` when the key was absent and has been written. The
    /// distributed-lock primitive.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Writes `value` only when the current value equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomic increment; missing or expired keys start at zero and take the
    /// given TTL. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process store over a concurrent map with lazy expiry. Per-key
/// operations are atomic because they run under the map's entry lock.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn live_value(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        if value.is_none() {
            // The read guard above is released; removing here cannot contend
            // with it on the same shard.
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        value
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key, self.clock.now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().expires_at > now {
                    Ok(false)
                } else {
                    occ.insert(Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    });
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(Entry {
                    value: value.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let current = if occ.get().expires_at > now {
                    Some(occ.get().value.as_str())
                } else {
                    None
                };
                if current == expected {
                    occ.insert(Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                if expected.is_none() {
                    vac.insert(Entry {
                        value: value.to_string(),
                        expires_at: now + ttl,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().expires_at > now {
                    let current: i64 = occ.get().value.parse().map_err(|_| {
                        StoreError::Unavailable(format!("non-numeric counter at {key}"))
                    })?;
                    let next = current + 1;
                    occ.get_mut().value = next.to_string();
                    Ok(next)
                } else {
                    occ.insert(Entry {
                        value: "1".to_string(),
                        expires_at: now + ttl,
                    });
                    Ok(1)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(Entry {
                    value: "1".to_string(),
                    expires_at: now + ttl,
                });
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().expires_at > now)
            .map(|e| e.key().clone())
            .collect())
    }
}
