use chrono::Duration;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::consolidation::{ConsolidationFilter, Verdict};
use crate::destinations::Dispatcher;
use crate::error::StoreError;
use crate::metrics::Metrics;
use crate::models::{CustomerContext, NormalizedEvent};
use crate::notify::Composer;
use crate::store::{Clock, SharedStore};
use crate::tenants::TenantDirectory;

pub const AGGREGATION_DELAY_SECS: u64 = 30;
pub const BUFFER_TTL_SECS: i64 = 300;
pub const PROCESSING_LOCK_TTL_SECS: i64 = 60;
pub const ORPHAN_MIN_AGE_SECS: i64 = 35;
pub const MAX_APPEND_RETRIES: u32 = 3;
const BUCKET_SECS: i64 = 60;
const KEY_PREFIX: &str = "pending_webhook:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub event: NormalizedEvent,
    pub customer: CustomerContext,
    /// Epoch seconds at enqueue time; drives orphan-age decisions.
    pub queued_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Suppressed,
    NoDestination,
    TenantGone,
    Retry,
}

/// Buffers correlated events for a short delay so a burst becomes one
/// notification. Buffers live in the shared store; a per-key in-process
/// timer fires the flush, and a store-level lock keeps concurrent instances
/// from double-delivering.
pub struct Aggregator {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    tenants: Arc<dyn TenantDirectory>,
    filter: Arc<ConsolidationFilter>,
    composer: Composer,
    dispatcher: Dispatcher,
    metrics: Metrics,
    timers: DashMap<String, ()>,
    delay: std::time::Duration,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        tenants: Arc<dyn TenantDirectory>,
        filter: Arc<ConsolidationFilter>,
        composer: Composer,
        dispatcher: Dispatcher,
        metrics: Metrics,
        delay: std::time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            tenants,
            filter,
            composer,
            dispatcher,
            metrics,
            timers: DashMap::new(),
            delay,
        }
    }

    /// Correlation storage key. Provider idempotency keys correlate exactly;
    /// otherwise events for the same customer are grouped into 60-second
    /// buckets, joining the previous bucket when it is still open so a burst
    /// straddling the boundary stays together.
    async fn resolve_key(&self, event: &NormalizedEvent) -> Result<Option<String>, StoreError> {
        if let Some(key) = &event.idempotency_key {
            return Ok(Some(format!("{KEY_PREFIX}{}:{key}", event.tenant_id)));
        }
        let Some(customer_id) = &event.customer_id else {
            return Ok(None);
        };
        let bucket = self.clock.now().timestamp() / BUCKET_SECS;
        let previous = format!(
            "{KEY_PREFIX}{}:customer:{customer_id}:t{}",
            event.tenant_id,
            bucket - 1
        );
        if self.store.get(&previous).await?.is_some() {
            return Ok(Some(previous));
        }
        Ok(Some(format!(
            "{KEY_PREFIX}{}:customer:{customer_id}:t{bucket}",
            event.tenant_id
        )))
    }

    /// Buffers an admitted event and arms the flush timer for its key.
    /// Events with no possible correlation key are delivered immediately.
    pub async fn enqueue(
        self: &Arc<Self>,
        event: NormalizedEvent,
        customer: CustomerContext,
    ) -> Result<(), StoreError> {
        let Some(key) = self.resolve_key(&event).await? else {
            tracing::debug!(event_id = %event.id, "no correlation key, delivering directly");
            self.flush_single(event, customer).await;
            return Ok(());
        };

        let item = BufferedEvent {
            event,
            customer,
            queued_at: self.clock.now().timestamp(),
        };
        self.append(&key, &item).await?;

        if self.timers.insert(key.clone(), ()).is_none() {
            let this = Arc::clone(self);
            let timer_key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.delay).await;
                this.timers.remove(&timer_key);
                this.process_key(&timer_key).await;
            });
        }
        Ok(())
    }

    /// Optimistic append with a bounded retry budget, falling back to a
    /// plain read-modify-write when contention exhausts the retries.
    async fn append(&self, key: &str, item: &BufferedEvent) -> Result<(), StoreError> {
        for _ in 0..MAX_APPEND_RETRIES {
            let current = self.store.get(key).await?;
            let mut items: Vec<BufferedEvent> = match &current {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            };
            items.push(item.clone());
            let encoded = serde_json::to_string(&items)?;
            if self
                .store
                .compare_and_swap(
                    key,
                    current.as_deref(),
                    &encoded,
                    Duration::seconds(BUFFER_TTL_SECS),
                )
                .await?
            {
                return Ok(());
            }
        }

        tracing::warn!(key, "append contention exceeded retries, using last-writer append");
        let current = self.store.get(key).await?;
        let mut items: Vec<BufferedEvent> = match &current {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        items.push(item.clone());
        self.store
            .set(
                key,
                &serde_json::to_string(&items)?,
                Duration::seconds(BUFFER_TTL_SECS),
            )
            .await
    }

    /// Flushes one buffer: lock, merge, re-check, deliver. The buffer is
    /// deleted on every terminal outcome and kept only when delivery failed
    /// retryably.
    pub async fn process_key(&self, key: &str) {
        let lock_key = format!("processing:{key}");
        match self
            .store
            .set_if_absent(&lock_key, "1", Duration::seconds(PROCESSING_LOCK_TTL_SECS))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key, "another instance holds the processing lock");
                return;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "could not take processing lock");
                return;
            }
        }

        let outcome = self.process_locked(key).await;

        if let Err(e) = self.store.delete(&lock_key).await {
            tracing::warn!(key, error = %e, "failed to release processing lock");
        }

        tracing::debug!(key, ?outcome, "buffer processed");
    }

    async fn process_locked(&self, key: &str) -> Outcome {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                // TTL won the race against the timer.
                self.metrics.buffer_expired_total.inc();
                tracing::warn!(key, "aggregation buffer missing or expired at flush time");
                return Outcome::Suppressed;
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "could not read aggregation buffer");
                return Outcome::Retry;
            }
        };

        let items: Vec<BufferedEvent> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(key, error = %e, "corrupt aggregation buffer, dropping");
                let _ = self.store.delete(key).await;
                return Outcome::Suppressed;
            }
        };
        if items.is_empty() {
            let _ = self.store.delete(key).await;
            return Outcome::Suppressed;
        }

        let count = items.len();
        let (event, customer) = merge(items);
        tracing::info!(
            key,
            events = count,
            event_type = event.event_type.as_str(),
            "flushing aggregation buffer"
        );

        let outcome = self.deliver(&event, &customer).await;
        match outcome {
            Outcome::Retry => {
                tracing::warn!(key, "delivery failed, keeping buffer for retry");
            }
            _ => {
                if let Err(e) = self.store.delete(key).await {
                    tracing::warn!(key, error = %e, "failed to delete flushed buffer");
                }
            }
        }
        outcome
    }

    async fn flush_single(&self, event: NormalizedEvent, customer: CustomerContext) {
        let outcome = self.deliver(&event, &customer).await;
        tracing::debug!(event_id = %event.id, ?outcome, "direct delivery finished");
    }

    async fn deliver(&self, event: &NormalizedEvent, customer: &CustomerContext) -> Outcome {
        let Some(tenant) = self.tenants.tenant(&event.tenant_id) else {
            tracing::info!(tenant_id = %event.tenant_id, "tenant vanished before delivery");
            return Outcome::TenantGone;
        };
        if !tenant.active {
            tracing::info!(tenant_id = %event.tenant_id, "tenant inactive, dropping notification");
            return Outcome::TenantGone;
        }
        if tenant.destinations.is_empty() {
            tracing::info!(tenant_id = %event.tenant_id, "no destinations configured");
            return Outcome::NoDestination;
        }

        // Late-arriving primaries may have registered suppression since
        // admission; the composite gets one more look.
        match self.filter.recheck(event).await {
            Ok(Verdict::Deliver) => {}
            Ok(Verdict::Suppressed(reason)) => {
                self.metrics
                    .events_suppressed_total
                    .with_label_values(&[reason.as_str()])
                    .inc();
                tracing::info!(
                    event_type = event.event_type.as_str(),
                    reason = reason.as_str(),
                    "composite suppressed before delivery"
                );
                return Outcome::Suppressed;
            }
            Err(e) => {
                tracing::warn!(error = %e, "suppression re-check failed, delivering anyway");
            }
        }

        let notification = self.composer.compose(event, customer);
        match self
            .dispatcher
            .deliver_all(&tenant.destinations, &notification, &self.metrics)
            .await
        {
            Ok(delivered) => {
                tracing::info!(
                    event_type = event.event_type.as_str(),
                    destinations = delivered,
                    "notification delivered"
                );
                Outcome::Delivered
            }
            Err(e) => {
                tracing::warn!(error = %e, "notification delivery failed");
                Outcome::Retry
            }
        }
    }

    /// Startup sweep over leftover buffers from a previous run. Buffers
    /// younger than the minimum age are left for their (possibly racing)
    /// owner; buffers for vanished tenants are discarded.
    pub async fn recover_orphans(&self) -> usize {
        let keys = match self.store.scan_prefix(KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "orphan scan failed");
                return 0;
            }
        };

        let now = self.clock.now().timestamp();
        let mut recovered = 0;
        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            let items: Vec<BufferedEvent> = match serde_json::from_str(&raw) {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(key, error = %e, "corrupt orphan buffer, deleting");
                    let _ = self.store.delete(&key).await;
                    continue;
                }
            };
            // Age by the earliest event: a buffer whose first item has sat
            // past the minimum age has missed its timer, even if later
            // events kept arriving right up to the crash.
            let earliest = items.iter().map(|i| i.queued_at).min().unwrap_or(0);
            if now - earliest < ORPHAN_MIN_AGE_SECS {
                continue;
            }

            let tenant_id = key
                .strip_prefix(KEY_PREFIX)
                .and_then(|rest| rest.split(':').next())
                .unwrap_or_default();
            if !self.tenants.exists(tenant_id) {
                tracing::info!(key, tenant_id, "orphan buffer for unknown tenant, deleting");
                let _ = self.store.delete(&key).await;
                continue;
            }

            self.process_key(&key).await;
            self.metrics.orphans_recovered_total.inc();
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(recovered, "orphaned aggregation buffers processed");
        }
        recovered
    }
}

/// Collapses a buffered burst into one composite. The highest-priority
/// event (first wins on ties) supplies the body; the customer record takes
/// the first non-empty email in arrival order and back-fills the rest.
pub fn merge(items: Vec<BufferedEvent>) -> (NormalizedEvent, CustomerContext) {
    let mut primary_index = 0;
    for (i, item) in items.iter().enumerate() {
        if item.event.event_type.merge_priority()
            > items[primary_index].event.event_type.merge_priority()
        {
            primary_index = i;
        }
    }

    let mut event = items[primary_index].event.clone();
    let mut customer = items[primary_index].customer.clone();

    for (i, item) in items.iter().enumerate() {
        if i != primary_index {
            event.metadata.fill_missing_from(&item.event.metadata);
            customer.fill_missing_from(&item.customer);
        }
    }

    customer.email = items
        .iter()
        .find_map(|i| i.customer.email.clone().filter(|e| !e.is_empty()));

    (event, customer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{meta, EventType};
    use chrono::{TimeZone, Utc};

    fn item(
        event_type: EventType,
        email: Option<&str>,
        queued_at: i64,
    ) -> BufferedEvent {
        let mut event = NormalizedEvent::new(
            "acme",
            "stripe",
            event_type,
            format!("evt_{}", event_type.as_str()),
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        );
        event.customer_id = Some("cus_1".into());
        event.amount = Some(299.0);
        BufferedEvent {
            event,
            customer: CustomerContext {
                email: email.map(str::to_string),
                ..Default::default()
            },
            queued_at,
        }
    }

    #[test]
    fn merge_picks_highest_priority() {
        let (event, _) = merge(vec![
            item(EventType::PaymentSuccess, None, 1),
            item(EventType::SubscriptionCreated, None, 2),
            item(EventType::InvoicePaid, None, 3),
        ]);
        assert_eq!(event.event_type, EventType::SubscriptionCreated);
    }

    #[test]
    fn merge_first_nonempty_email_wins() {
        let mut second = item(EventType::SubscriptionCreated, Some("late@acme.io"), 2);
        second.customer.company_name = Some("Acme".into());
        let (event, customer) = merge(vec![
            item(EventType::PaymentSuccess, Some("first@acme.io"), 1),
            second,
            item(EventType::InvoicePaid, Some("third@acme.io"), 3),
        ]);
        // Body from the subscription event, email from the first arrival.
        assert_eq!(event.event_type, EventType::SubscriptionCreated);
        assert_eq!(customer.email.as_deref(), Some("first@acme.io"));
        assert_eq!(customer.company_name.as_deref(), Some("Acme"));
    }

    #[test]
    fn merge_backfills_metadata_from_secondaries() {
        let mut primary = item(EventType::SubscriptionCreated, None, 1);
        primary.event.metadata.insert(meta::PLAN_NAME, "Pro");
        let mut secondary = item(EventType::PaymentSuccess, None, 2);
        secondary.event.metadata.insert(meta::PLAN_NAME, "Wrong");
        secondary
            .event
            .metadata
            .insert(meta::PAYMENT_METHOD, "card");

        let (event, _) = merge(vec![primary, secondary]);
        assert_eq!(event.metadata.get(meta::PLAN_NAME), Some("Pro"));
        assert_eq!(event.metadata.get(meta::PAYMENT_METHOD), Some("card"));
    }

    #[test]
    fn merge_tie_keeps_first_arrival() {
        let (event, _) = merge(vec![
            item(EventType::SubscriptionUpdated, None, 1),
            item(EventType::SubscriptionDeleted, None, 2),
        ]);
        assert_eq!(event.event_type, EventType::SubscriptionUpdated);
    }
}
