use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::models::PlanTier;
use crate::store::{Clock, SharedStore};

/// Counter keys live for slightly longer than the longest month so a counter
/// never leaks into the next period.
const USAGE_TTL_DAYS: i64 = 31;
const FALLBACK_WINDOW_SECS: i64 = 300;
pub const BREAKER_THRESHOLD: u32 = 5;
pub const BREAKER_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub plan: PlanTier,
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    /// Epoch seconds of the first instant of the next calendar month.
    pub reset_epoch: i64,
    /// True when the shared store was unreachable and the local fallback
    /// counters answered instead.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub snapshot: UsageSnapshot,
}

struct FallbackWindow {
    window_start: DateTime<Utc>,
    count: u64,
}

/// Monthly per-tenant quota backed by the shared store, failing open to
/// short-window in-process counters when the store is unhealthy.
pub struct QuotaEnforcer {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    fallback: DashMap<String, FallbackWindow>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        let breaker = CircuitBreaker::new(
            BREAKER_THRESHOLD,
            Duration::seconds(BREAKER_COOLDOWN_SECS),
            clock.clone(),
        );
        Self {
            store,
            clock,
            breaker,
            fallback: DashMap::new(),
        }
    }

    fn usage_key(tenant_id: &str, now: DateTime<Utc>) -> String {
        format!("webhook_usage:{tenant_id}:{}", now.format("%Y-%m"))
    }

    fn reset_epoch(now: DateTime<Utc>) -> i64 {
        let first_of_month = now
            .date_naive()
            .with_day(1)
            .unwrap_or_else(|| now.date_naive());
        (first_of_month + Months::new(1))
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp()
    }

    fn snapshot(plan: PlanTier, used: u64, now: DateTime<Utc>, degraded: bool) -> UsageSnapshot {
        let limit = plan.monthly_limit();
        UsageSnapshot {
            plan,
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_epoch: Self::reset_epoch(now),
            degraded,
        }
    }

    fn fallback_count(&self, tenant_id: &str, now: DateTime<Utc>, bump: bool) -> u64 {
        let mut entry = self
            .fallback
            .entry(tenant_id.to_string())
            .or_insert_with(|| FallbackWindow {
                window_start: now,
                count: 0,
            });
        if now - entry.window_start >= Duration::seconds(FALLBACK_WINDOW_SECS) {
            entry.window_start = now;
            entry.count = 0;
        }
        if bump {
            entry.count += 1;
        }
        entry.count
    }

    /// Admission check. Does not consume quota.
    pub async fn check(&self, tenant_id: &str, plan: PlanTier) -> QuotaDecision {
        let now = self.clock.now();
        let limit = plan.monthly_limit();

        if self.breaker.allow() {
            match self.store.get(&Self::usage_key(tenant_id, now)).await {
                Ok(value) => {
                    self.breaker.record_success();
                    let used: u64 = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                    return QuotaDecision {
                        allowed: used < limit,
                        snapshot: Self::snapshot(plan, used, now, false),
                    };
                }
                Err(e) => {
                    self.breaker.record_failure();
                    tracing::warn!(tenant_id, error = %e, "quota store unavailable, failing open");
                }
            }
        }

        let used = self.fallback_count(tenant_id, now, false);
        QuotaDecision {
            allowed: used < limit,
            snapshot: Self::snapshot(plan, used, now, true),
        }
    }

    /// Consumes one unit of quota and returns the usage after the increment.
    pub async fn increment(&self, tenant_id: &str, plan: PlanTier) -> UsageSnapshot {
        let now = self.clock.now();

        if self.breaker.allow() {
            let key = Self::usage_key(tenant_id, now);
            match self
                .store
                .incr(&key, Duration::days(USAGE_TTL_DAYS))
                .await
            {
                Ok(used) => {
                    self.breaker.record_success();
                    return Self::snapshot(plan, used.max(0) as u64, now, false);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    tracing::warn!(tenant_id, error = %e, "quota increment failed, failing open");
                }
            }
        }

        let used = self.fallback_count(tenant_id, now, true);
        Self::snapshot(plan, used, now, true)
    }
}
