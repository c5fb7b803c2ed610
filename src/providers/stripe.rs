use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::{constant_time_eq, header_str, hmac_sha256, ProviderAdapter, TIMESTAMP_TOLERANCE_SECS};
use crate::error::WebhookError;
use crate::models::{meta, CustomerContext, EventType, NormalizedEvent};
use crate::store::Clock;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Stripe-style billing webhooks: JSON envelope, `t=...,v1=...` signature
/// over `"{timestamp}.{body}"`.
pub struct StripeAdapter {
    clock: Arc<dyn Clock>,
}

impl StripeAdapter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn map_event_type(name: &str) -> Option<EventType> {
        match name {
            "customer.subscription.created" => Some(EventType::SubscriptionCreated),
            "customer.subscription.updated" => Some(EventType::SubscriptionUpdated),
            "customer.subscription.deleted" => Some(EventType::SubscriptionDeleted),
            "customer.subscription.trial_will_end" => Some(EventType::TrialEnding),
            "invoice.payment_succeeded" => Some(EventType::PaymentSuccess),
            "invoice.payment_failed" => Some(EventType::PaymentFailure),
            "invoice.paid" => Some(EventType::InvoicePaid),
            "invoice.payment_action_required" => Some(EventType::PaymentActionRequired),
            "checkout.session.completed" => Some(EventType::CheckoutCompleted),
            _ => None,
        }
    }
}

fn str_at<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for k in keys {
        cur = cur.get(k)?;
    }
    cur.as_str()
}

fn i64_at(v: &Value, keys: &[&str]) -> Option<i64> {
    let mut cur = v;
    for k in keys {
        cur = cur.get(k)?;
    }
    cur.as_i64()
}

fn cents_to_major(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn billing_period(interval: &str, count: i64) -> &'static str {
    match (interval, count) {
        ("month", 3) => "quarterly",
        ("month", _) => "monthly",
        ("year", _) => "annual",
        ("week", _) => "weekly",
        ("day", _) => "daily",
        _ => "monthly",
    }
}

impl ProviderAdapter for StripeAdapter {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn display_name(&self) -> &'static str {
        "Stripe"
    }

    fn validate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let header = header_str(headers, SIGNATURE_HEADER)
            .ok_or(WebhookError::InvalidSignature)?;

        let mut timestamp: Option<i64> = None;
        let mut signature: Option<&str> = None;
        for element in header.split(',') {
            match element.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(WebhookError::InvalidSignature)?;
        let signature = signature.ok_or(WebhookError::InvalidSignature)?;

        let now = self.clock.now().timestamp();
        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(WebhookError::InvalidSignature);
        }

        let mut signed = Vec::with_capacity(body.len() + 16);
        signed.extend_from_slice(timestamp.to_string().as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(body);
        let expected = hmac_sha256(secret.as_bytes(), &signed);
        let provided = hex::decode(signature).map_err(|_| WebhookError::InvalidSignature)?;

        if constant_time_eq(&expected, &provided) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }

    fn parse(
        &self,
        tenant_id: &str,
        _headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<(NormalizedEvent, CustomerContext)>, WebhookError> {
        let envelope: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let type_name = str_at(&envelope, &["type"])
            .ok_or_else(|| WebhookError::InvalidPayload("missing event type".into()))?;
        let event_type = Self::map_event_type(type_name)
            .ok_or_else(|| WebhookError::UnsupportedEventType(type_name.to_string()))?;

        let object = envelope
            .get("data")
            .and_then(|d| d.get("object"))
            .ok_or_else(|| WebhookError::InvalidPayload("missing data.object".into()))?;

        let external_id = str_at(&envelope, &["id"])
            .or_else(|| str_at(object, &["id"]))
            .ok_or_else(|| WebhookError::InvalidPayload("missing event id".into()))?
            .to_string();

        let occurred_at = i64_at(&envelope, &["created"])
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(|| self.clock.now());

        let mut event =
            NormalizedEvent::new(tenant_id, self.name(), event_type, external_id, occurred_at);

        event.customer_id = str_at(object, &["customer"])
            .map(str::to_string)
            .or_else(|| {
                // Subscription objects nest the customer as an expanded object.
                str_at(object, &["customer", "id"]).map(str::to_string)
            });
        event.idempotency_key =
            str_at(&envelope, &["request", "idempotency_key"]).map(str::to_string);
        event.currency = str_at(object, &["currency"]).map(|c| c.to_uppercase());

        match event_type.category() {
            crate::models::EventCategory::Payment => {
                let cents = i64_at(object, &["amount_paid"])
                    .or_else(|| i64_at(object, &["amount_due"]));
                event.amount = cents.map(cents_to_major);
                if let Some(sub) = str_at(object, &["subscription"]) {
                    event.metadata.insert(meta::SUBSCRIPTION_ID, sub);
                }
                if let Some(reason) = str_at(object, &["last_finalization_error", "message"]) {
                    event.metadata.insert(meta::FAILURE_REASON, reason);
                }
                if let Some(method) = str_at(object, &["payment_method_details", "type"]) {
                    event.metadata.insert(meta::PAYMENT_METHOD, method);
                }
            }
            crate::models::EventCategory::Order => {
                // checkout.session.completed
                event.amount = i64_at(object, &["amount_total"]).map(cents_to_major);
                if let Some(method) = object
                    .get("payment_method_types")
                    .and_then(|v| v.get(0))
                    .and_then(|v| v.as_str())
                {
                    event.metadata.insert(meta::PAYMENT_METHOD, method);
                }
            }
            _ => {}
        }

        if matches!(
            event_type,
            EventType::SubscriptionCreated
                | EventType::SubscriptionUpdated
                | EventType::SubscriptionDeleted
                | EventType::TrialEnding
        ) {
            if let Some(id) = str_at(object, &["id"]) {
                event.metadata.insert(meta::SUBSCRIPTION_ID, id);
            }
            let plan = object
                .get("plan")
                .filter(|p| !p.is_null())
                .or_else(|| {
                    object
                        .get("items")
                        .and_then(|i| i.get("data"))
                        .and_then(|d| d.get(0))
                        .and_then(|item| item.get("price"))
                });
            let plan_cents = plan.and_then(|p| {
                p.get("amount")
                    .or_else(|| p.get("unit_amount"))
                    .and_then(|a| a.as_i64())
            });
            if let Some(p) = plan {
                if let Some(nickname) = str_at(p, &["nickname"]) {
                    event.metadata.insert(meta::PLAN_NAME, nickname);
                }
                let interval = str_at(p, &["interval"])
                    .or_else(|| str_at(p, &["recurring", "interval"]))
                    .unwrap_or("month");
                let count = i64_at(p, &["interval_count"])
                    .or_else(|| i64_at(p, &["recurring", "interval_count"]))
                    .unwrap_or(1);
                event
                    .metadata
                    .insert(meta::BILLING_PERIOD, billing_period(interval, count));
            }
            event.amount = plan_cents.map(cents_to_major);

            if event_type == EventType::SubscriptionUpdated {
                let previous = envelope.get("data").and_then(|d| d.get("previous_attributes"));
                if let Some(prev_cents) =
                    previous.and_then(|p| i64_at(p, &["plan", "amount"]))
                {
                    event.metadata.insert(
                        meta::PREVIOUS_AMOUNT,
                        format!("{:.2}", cents_to_major(prev_cents)),
                    );
                }
                if let Some(cancel) = object.get("cancel_at_period_end").and_then(|v| v.as_bool())
                {
                    event
                        .metadata
                        .insert(meta::CANCEL_AT_PERIOD_END, cancel.to_string());
                }
            }

            // A subscription born trialing announces a trial, not revenue.
            if event_type == EventType::SubscriptionCreated
                && str_at(object, &["status"]) == Some("trialing")
            {
                event.event_type = EventType::TrialStarted;
                if let Some(cents) = plan_cents {
                    event
                        .metadata
                        .insert(meta::PLAN_AMOUNT, format!("{:.2}", cents_to_major(cents)));
                }
                event.amount = Some(0.0);
                event.metadata.insert(meta::IS_TRIAL, "true");
                if let (Some(start), Some(end)) = (
                    i64_at(object, &["trial_start"]),
                    i64_at(object, &["trial_end"]),
                ) {
                    event
                        .metadata
                        .insert(meta::TRIAL_DAYS, ((end - start) / 86_400).to_string());
                    if let Some(end_ts) = Utc.timestamp_opt(end, 0).single() {
                        event.metadata.insert(meta::TRIAL_END, end_ts.to_rfc3339());
                    }
                }
            }
        }

        let customer = CustomerContext {
            email: str_at(object, &["customer_email"])
                .or_else(|| str_at(object, &["customer_details", "email"]))
                .map(str::to_string),
            first_name: None,
            last_name: str_at(object, &["customer_name"])
                .or_else(|| str_at(object, &["customer_details", "name"]))
                .map(str::to_string),
            company_name: None,
            created_at: customer_created_at(object),
            orders_count: None,
            total_spent: None,
            payment_history: Vec::new(),
        };

        Ok(Some((event, customer)))
    }
}

fn customer_created_at(object: &Value) -> Option<DateTime<Utc>> {
    i64_at(object, &["customer", "created"])
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn adapter() -> StripeAdapter {
        StripeAdapter::new(Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        )))
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(body);
        format!(
            "t={timestamp},v1={}",
            hex::encode(hmac_sha256(secret.as_bytes(), &signed))
        )
    }

    fn headers_with_signature(secret: &str, timestamp: i64, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign(secret, timestamp, body).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_valid_signature_and_rejects_mutations() {
        let adapter = adapter();
        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let ts = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap().timestamp();

        let headers = headers_with_signature("whsec_abc", ts, body);
        assert!(adapter.validate(&headers, body, "whsec_abc").is_ok());

        // Any single byte changed in the body invalidates the signature.
        let mut mutated = body.to_vec();
        mutated[10] ^= 0x01;
        assert!(matches!(
            adapter.validate(&headers, &mutated, "whsec_abc"),
            Err(WebhookError::InvalidSignature)
        ));

        // Wrong secret fails too.
        assert!(adapter.validate(&headers, body, "whsec_other").is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let adapter = adapter();
        let body = b"{}";
        let stale = Utc.with_ymd_and_hms(2026, 3, 10, 11, 54, 0).unwrap().timestamp();
        let headers = headers_with_signature("whsec_abc", stale, body);
        assert!(adapter.validate(&headers, body, "whsec_abc").is_err());
    }

    #[test]
    fn parses_invoice_payment() {
        let adapter = adapter();
        let body = json!({
            "id": "evt_42",
            "type": "invoice.payment_succeeded",
            "created": 1_773_500_000_i64,
            "request": {"idempotency_key": "idem_9"},
            "data": {"object": {
                "id": "in_1",
                "customer": "cus_7",
                "customer_email": "billing@notion.so",
                "amount_paid": 29_900,
                "currency": "usd",
                "subscription": "sub_3"
            }}
        })
        .to_string();

        let (event, customer) = adapter
            .parse("acme", &HeaderMap::new(), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::PaymentSuccess);
        assert_eq!(event.external_id, "evt_42");
        assert_eq!(event.customer_id.as_deref(), Some("cus_7"));
        assert_eq!(event.amount, Some(299.0));
        assert_eq!(event.currency.as_deref(), Some("USD"));
        assert_eq!(event.idempotency_key.as_deref(), Some("idem_9"));
        assert_eq!(event.metadata.get(meta::SUBSCRIPTION_ID), Some("sub_3"));
        assert_eq!(customer.email.as_deref(), Some("billing@notion.so"));
    }

    #[test]
    fn trialing_subscription_becomes_trial_started() {
        let adapter = adapter();
        let body = json!({
            "id": "evt_t",
            "type": "customer.subscription.created",
            "data": {"object": {
                "id": "sub_9",
                "customer": "cus_7",
                "status": "trialing",
                "trial_start": 1_773_500_000_i64,
                "trial_end": 1_774_709_600_i64,
                "plan": {"amount": 29_900, "interval": "month", "nickname": "Pro"}
            }}
        })
        .to_string();

        let (event, _) = adapter
            .parse("acme", &HeaderMap::new(), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::TrialStarted);
        assert_eq!(event.amount, Some(0.0));
        assert_eq!(event.metadata.get(meta::IS_TRIAL), Some("true"));
        assert_eq!(event.metadata.get(meta::TRIAL_DAYS), Some("14"));
        assert_eq!(event.metadata.get(meta::BILLING_PERIOD), Some("monthly"));
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let adapter = adapter();
        let body = json!({"id": "evt_x", "type": "payout.created", "data": {"object": {}}})
            .to_string();
        assert!(matches!(
            adapter.parse("acme", &HeaderMap::new(), body.as_bytes()),
            Err(WebhookError::UnsupportedEventType(_))
        ));
    }

    #[test]
    fn subscription_update_carries_previous_amount() {
        let adapter = adapter();
        let body = json!({
            "id": "evt_u",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_9",
                    "customer": "cus_7",
                    "cancel_at_period_end": true,
                    "plan": {"amount": 49_900, "interval": "month"}
                },
                "previous_attributes": {"plan": {"amount": 29_900}}
            }
        })
        .to_string();

        let (event, _) = adapter
            .parse("acme", &HeaderMap::new(), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::SubscriptionUpdated);
        assert_eq!(event.amount, Some(499.0));
        assert_eq!(event.metadata.get(meta::PREVIOUS_AMOUNT), Some("299.00"));
        assert_eq!(event.metadata.get(meta::CANCEL_AT_PERIOD_END), Some("true"));
    }
}
