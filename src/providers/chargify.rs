use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use md5::Md5;
use sha2::Digest;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::{constant_time_eq, header_str, hmac_sha256, ProviderAdapter, TIMESTAMP_TOLERANCE_SECS};
use crate::error::WebhookError;
use crate::models::{meta, CustomerContext, EventType, NormalizedEvent};
use crate::store::Clock;

pub const SIGNATURE_HEADER: &str = "X-Chargify-Webhook-Signature-Hmac-Sha-256";
pub const LEGACY_SIGNATURE_HEADER: &str = "X-Chargify-Webhook-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-Chargify-Webhook-Id";
pub const TIMESTAMP_HEADER: &str = "X-Chargify-Webhook-Timestamp";

const REPLAY_CAPACITY: usize = 1000;
const REPLAY_WINDOW_SECS: i64 = 300;

/// Bounded in-process cache of recently seen delivery ids. Chargify retries
/// aggressively and re-sends on slow responses; the id header lets us drop
/// re-deliveries before they reach the pipeline.
struct ReplayCache {
    inner: Mutex<ReplayInner>,
}

struct ReplayInner {
    order: VecDeque<(String, DateTime<Utc>)>,
    seen: HashSet<String>,
}

impl ReplayCache {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ReplayInner {
                order: VecDeque::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Returns `false` when the id was seen inside the window.
    fn check_and_record(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now - Duration::seconds(REPLAY_WINDOW_SECS);
        while let Some((old_id, seen_at)) = inner.order.front().cloned() {
            if seen_at < cutoff || inner.order.len() > REPLAY_CAPACITY {
                inner.order.pop_front();
                inner.seen.remove(&old_id);
            } else {
                break;
            }
        }
        if inner.seen.contains(id) {
            return false;
        }
        inner.seen.insert(id.to_string());
        inner.order.push_back((id.to_string(), now));
        true
    }
}

/// Chargify-style subscription webhooks: URL-form-encoded bodies with
/// bracketed `payload[...]` keys, HMAC-SHA-256 signature with a legacy MD5
/// fallback, and a delivery-id header for replay protection.
pub struct ChargifyAdapter {
    clock: Arc<dyn Clock>,
    replays: ReplayCache,
}

impl ChargifyAdapter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            replays: ReplayCache::new(),
        }
    }

    fn map_event_type(name: &str) -> Option<EventType> {
        match name {
            "payment_success" | "renewal_success" => Some(EventType::PaymentSuccess),
            "payment_failure" | "renewal_failure" => Some(EventType::PaymentFailure),
            "signup_success" => Some(EventType::SubscriptionCreated),
            "subscription_state_change" => Some(EventType::SubscriptionUpdated),
            _ => None,
        }
    }

    fn check_timestamp(&self, headers: &HeaderMap) -> Result<(), WebhookError> {
        let Some(raw) = header_str(headers, TIMESTAMP_HEADER) else {
            return Ok(());
        };
        let ts = raw
            .parse::<i64>()
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|t| t.timestamp())
            })
            .ok_or(WebhookError::InvalidSignature)?;
        if (self.clock.now().timestamp() - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(WebhookError::InvalidSignature);
        }
        Ok(())
    }
}

fn form_fields(body: &[u8]) -> Result<HashMap<String, String>, WebhookError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    Ok(pairs.into_iter().collect())
}

fn payload_key(path: &[&str]) -> String {
    let mut key = String::from("payload");
    for part in path {
        key.push('[');
        key.push_str(part);
        key.push(']');
    }
    key
}

fn non_empty(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Pulls a Shopify order number out of a free-text transaction memo, e.g.
/// "Renewal for Shopify Order #1234".
fn order_reference_from_memo(memo: &str) -> Option<String> {
    let marker = "Shopify Order #";
    let start = memo.find(marker)? + marker.len();
    let digits: String = memo[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

impl ProviderAdapter for ChargifyAdapter {
    fn name(&self) -> &'static str {
        "chargify"
    }

    fn display_name(&self) -> &'static str {
        "Chargify"
    }

    fn validate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        self.check_timestamp(headers)?;

        if let Some(signature) = header_str(headers, SIGNATURE_HEADER) {
            let expected = hmac_sha256(secret.as_bytes(), body);
            let provided =
                hex::decode(signature).map_err(|_| WebhookError::InvalidSignature)?;
            if constant_time_eq(&expected, &provided) {
                return Ok(());
            }
            return Err(WebhookError::InvalidSignature);
        }

        // Legacy deliveries sign with MD5(secret || body).
        if let Some(signature) = header_str(headers, LEGACY_SIGNATURE_HEADER) {
            let mut hasher = Md5::new();
            hasher.update(secret.as_bytes());
            hasher.update(body);
            let expected = hasher.finalize();
            let provided =
                hex::decode(signature).map_err(|_| WebhookError::InvalidSignature)?;
            if constant_time_eq(&expected, &provided) {
                return Ok(());
            }
            return Err(WebhookError::InvalidSignature);
        }

        Err(WebhookError::InvalidSignature)
    }

    fn parse(
        &self,
        tenant_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<(NormalizedEvent, CustomerContext)>, WebhookError> {
        let webhook_id = header_str(headers, WEBHOOK_ID_HEADER)
            .ok_or_else(|| WebhookError::InvalidPayload("missing webhook id header".into()))?
            .to_string();
        if !self.replays.check_and_record(&webhook_id, self.clock.now()) {
            return Err(WebhookError::DuplicateDelivery);
        }

        let fields = form_fields(body)?;
        let event_name = fields
            .get("event")
            .ok_or_else(|| WebhookError::InvalidPayload("missing event field".into()))?;
        if event_name == "test" {
            return Ok(None);
        }
        let event_type = Self::map_event_type(event_name)
            .ok_or_else(|| WebhookError::UnsupportedEventType(event_name.clone()))?;

        let mut event = NormalizedEvent::new(
            tenant_id,
            self.name(),
            event_type,
            webhook_id,
            self.clock.now(),
        );

        event.customer_id = non_empty(&fields, &payload_key(&["subscription", "customer", "id"]));

        let cents = non_empty(&fields, &payload_key(&["transaction", "amount_in_cents"]))
            .or_else(|| {
                non_empty(
                    &fields,
                    &payload_key(&["subscription", "product", "price_in_cents"]),
                )
            })
            .and_then(|v| v.parse::<i64>().ok());
        event.amount = cents.map(|c| c as f64 / 100.0);
        // The form payload never carries a currency field.
        event.currency = Some("USD".to_string());

        if let Some(id) = non_empty(&fields, &payload_key(&["subscription", "id"])) {
            event.metadata.insert(meta::SUBSCRIPTION_ID, id);
        }
        if let Some(name) = non_empty(&fields, &payload_key(&["subscription", "product", "name"]))
        {
            event.metadata.insert(meta::PLAN_NAME, name);
        }
        if let Some(unit) = non_empty(
            &fields,
            &payload_key(&["subscription", "product", "interval_unit"]),
        ) {
            let period = match unit.as_str() {
                "year" => "annual",
                "week" => "weekly",
                "day" => "daily",
                _ => "monthly",
            };
            event.metadata.insert(meta::BILLING_PERIOD, period);
        }
        if let Some(reason) = non_empty(&fields, &payload_key(&["transaction", "failure_message"]))
        {
            event.metadata.insert(meta::FAILURE_REASON, reason);
        }
        if let Some(previous) = non_empty(&fields, &payload_key(&["subscription", "previous_state"]))
        {
            event.metadata.insert(meta::PREVIOUS_STATE, previous);
        }
        if let Some(kind) = non_empty(&fields, &payload_key(&["transaction", "payment_method"])) {
            event.metadata.insert(meta::PAYMENT_METHOD, kind);
        }
        if let Some(reference) = non_empty(&fields, &payload_key(&["transaction", "memo"]))
            .as_deref()
            .and_then(order_reference_from_memo)
        {
            event.metadata.insert(meta::ORDER_REFERENCE, reference);
        }

        let customer = CustomerContext {
            email: non_empty(&fields, &payload_key(&["subscription", "customer", "email"])),
            first_name: non_empty(
                &fields,
                &payload_key(&["subscription", "customer", "first_name"]),
            ),
            last_name: non_empty(
                &fields,
                &payload_key(&["subscription", "customer", "last_name"]),
            ),
            company_name: non_empty(
                &fields,
                &payload_key(&["subscription", "customer", "organization"]),
            ),
            created_at: None,
            orders_count: None,
            total_spent: None,
            payment_history: Vec::new(),
        };

        Ok(Some((event, customer)))
    }
}
