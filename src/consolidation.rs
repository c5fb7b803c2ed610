use chrono::Duration;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{EventType, NormalizedEvent};
use crate::store::SharedStore;

pub const CONSOLIDATION_WINDOW_SECS: i64 = 300;
pub const DEDUP_WINDOW_MULTIPLIER: i64 = 6;

/// Events that announce a larger fact and suppress the listed follow-on
/// events for the same customer inside the consolidation window.
fn secondary_events(primary: EventType) -> &'static [EventType] {
    match primary {
        EventType::SubscriptionCreated => {
            &[EventType::PaymentSuccess, EventType::InvoicePaid]
        }
        EventType::SubscriptionDeleted => &[EventType::InvoicePaid],
        EventType::CheckoutCompleted => {
            &[EventType::PaymentSuccess, EventType::InvoicePaid]
        }
        EventType::OrderCreated => &[EventType::PaymentSuccess],
        _ => &[],
    }
}

/// Events that must always reach a human, whatever else arrived.
fn never_suppress(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::PaymentFailure | EventType::PaymentActionRequired | EventType::TrialEnding
    )
}

/// Money events that carry no information when the amount is zero or absent
/// (e.g. the $0 invoice a trial signup generates).
fn zero_amount_filtered(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::PaymentSuccess | EventType::InvoicePaid
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    ExactDuplicate,
    Consolidated,
    ZeroAmount,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::ExactDuplicate => "exact_duplicate",
            SuppressReason::Consolidated => "consolidated",
            SuppressReason::ZeroAmount => "zero_amount",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Suppressed(SuppressReason),
}

/// Decides whether an event deserves its own notification. Duplicate
/// markers and per-customer suppression sets live in the shared store so
/// every instance sees the same decisions.
pub struct ConsolidationFilter {
    store: Arc<dyn SharedStore>,
}

impl ConsolidationFilter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn dedup_key(event: &NormalizedEvent) -> String {
        format!("event_dedup:{}:{}", event.tenant_id, event.external_id)
    }

    fn suppress_key(tenant_id: &str, customer_id: &str) -> String {
        format!("event_suppress:{tenant_id}:{customer_id}")
    }

    /// Admission-time check: marks the delivery as seen, registers any
    /// suppression a primary event implies, and returns the verdict.
    pub async fn admit(&self, event: &NormalizedEvent) -> Result<Verdict, StoreError> {
        let fresh = self
            .store
            .set_if_absent(
                &Self::dedup_key(event),
                event.event_type.as_str(),
                Duration::seconds(CONSOLIDATION_WINDOW_SECS * DEDUP_WINDOW_MULTIPLIER),
            )
            .await?;
        if !fresh {
            return Ok(Verdict::Suppressed(SuppressReason::ExactDuplicate));
        }

        self.register_primary(event).await?;
        self.evaluate(event).await
    }

    /// Delivery-time re-check for a merged composite. No duplicate marking;
    /// the composite inherits an external id that was already admitted.
    pub async fn recheck(&self, event: &NormalizedEvent) -> Result<Verdict, StoreError> {
        self.evaluate(event).await
    }

    async fn evaluate(&self, event: &NormalizedEvent) -> Result<Verdict, StoreError> {
        if never_suppress(event.event_type) {
            return Ok(Verdict::Deliver);
        }

        if zero_amount_filtered(event.event_type)
            && event.amount.map_or(true, |a| a <= 0.0)
        {
            return Ok(Verdict::Suppressed(SuppressReason::ZeroAmount));
        }

        if let Some(customer_id) = &event.customer_id {
            let key = Self::suppress_key(&event.tenant_id, customer_id);
            if let Some(raw) = self.store.get(&key).await? {
                let suppressed: Vec<String> = serde_json::from_str(&raw)?;
                if suppressed.iter().any(|s| s == event.event_type.as_str()) {
                    return Ok(Verdict::Suppressed(SuppressReason::Consolidated));
                }
            }
        }

        Ok(Verdict::Deliver)
    }

    /// When a primary arrives, record which follow-on events to swallow for
    /// this customer. Read-modify-write; concurrent primaries for the same
    /// customer are last-writer-wins, which the window sizes tolerate.
    async fn register_primary(&self, event: &NormalizedEvent) -> Result<(), StoreError> {
        let secondaries = secondary_events(event.event_type);
        if secondaries.is_empty() {
            return Ok(());
        }
        let Some(customer_id) = &event.customer_id else {
            return Ok(());
        };

        let key = Self::suppress_key(&event.tenant_id, customer_id);
        let mut set: Vec<String> = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        for s in secondaries {
            if !set.iter().any(|e| e == s.as_str()) {
                set.push(s.as_str().to_string());
            }
        }
        self.store
            .set(
                &key,
                &serde_json::to_string(&set)?,
                Duration::seconds(CONSOLIDATION_WINDOW_SECS),
            )
            .await
    }
}
