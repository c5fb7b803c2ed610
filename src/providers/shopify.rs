use axum::http::HeaderMap;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::{constant_time_eq, header_str, hmac_sha256, ProviderAdapter};
use crate::error::WebhookError;
use crate::models::{meta, CustomerContext, EventType, NormalizedEvent};
use crate::store::Clock;

pub const SIGNATURE_HEADER: &str = "X-Shopify-Hmac-SHA256";
pub const TOPIC_HEADER: &str = "X-Shopify-Topic";
pub const TEST_HEADER: &str = "X-Shopify-Test";
pub const SHOP_DOMAIN_HEADER: &str = "X-Shopify-Shop-Domain";

/// Shopify-style commerce webhooks: JSON body, base64 HMAC-SHA-256 of the
/// raw body, topic routing via header.
pub struct ShopifyAdapter {
    clock: Arc<dyn Clock>,
}

impl ShopifyAdapter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn map_topic(topic: &str) -> Option<EventType> {
        match topic {
            "orders/paid" => Some(EventType::PaymentSuccess),
            "orders/create" => Some(EventType::OrderCreated),
            "orders/cancelled" => Some(EventType::PaymentCancelled),
            "customers/update" => Some(EventType::CustomerUpdated),
            _ => None,
        }
    }
}

fn str_of<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn f64_of(v: &Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

impl ProviderAdapter for ShopifyAdapter {
    fn name(&self) -> &'static str {
        "shopify"
    }

    fn display_name(&self) -> &'static str {
        "Shopify"
    }

    fn validate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = header_str(headers, SIGNATURE_HEADER)
            .ok_or(WebhookError::InvalidSignature)?;
        let provided = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| WebhookError::InvalidSignature)?;
        let expected = hmac_sha256(secret.as_bytes(), body);
        if constant_time_eq(&expected, &provided) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }

    fn parse(
        &self,
        tenant_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<(NormalizedEvent, CustomerContext)>, WebhookError> {
        let topic = header_str(headers, TOPIC_HEADER)
            .ok_or_else(|| WebhookError::InvalidPayload("missing topic header".into()))?;

        let is_test = topic == "test"
            || header_str(headers, TEST_HEADER)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
        if is_test {
            return Ok(None);
        }

        let event_type = Self::map_topic(topic)
            .ok_or_else(|| WebhookError::UnsupportedEventType(topic.to_string()))?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let external_id = payload
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| WebhookError::InvalidPayload("missing object id".into()))?;

        let occurred_at = str_of(&payload, "created_at")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| self.clock.now());

        let mut event =
            NormalizedEvent::new(tenant_id, self.name(), event_type, external_id, occurred_at);

        if event_type != EventType::CustomerUpdated {
            event.amount = f64_of(&payload, "total_price");
            event.currency = str_of(&payload, "currency").map(|c| c.to_uppercase());
            if let Some(number) = payload.get("order_number").and_then(|n| n.as_i64()) {
                event.metadata.insert(meta::ORDER_NUMBER, number.to_string());
            }
            if let Some(items) = payload.get("line_items").and_then(|v| v.as_array()) {
                let summary: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        let title = str_of(item, "title")?;
                        let qty = item.get("quantity").and_then(|q| q.as_i64()).unwrap_or(1);
                        Some(format!("{qty}x {title}"))
                    })
                    .collect();
                if !summary.is_empty() {
                    event.metadata.insert(meta::LINE_ITEMS, summary.join("\n"));
                }
            }
            if let Some(gateway) = str_of(&payload, "gateway") {
                event.metadata.insert(meta::PAYMENT_METHOD, gateway);
            }
        }

        if let Some(domain) = header_str(headers, SHOP_DOMAIN_HEADER) {
            event.metadata.insert(meta::SHOP_DOMAIN, domain);
        }

        let customer_obj = if event_type == EventType::CustomerUpdated {
            Some(&payload)
        } else {
            payload.get("customer")
        };

        let mut customer = CustomerContext::default();
        if let Some(c) = customer_obj {
            event.customer_id = c.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            customer.email = str_of(c, "email")
                .map(str::to_string)
                .or_else(|| str_of(&payload, "email").map(str::to_string));
            customer.first_name = str_of(c, "first_name").map(str::to_string);
            customer.last_name = str_of(c, "last_name").map(str::to_string);
            customer.company_name = c
                .get("default_address")
                .and_then(|a| str_of(a, "company"))
                .map(str::to_string);
            customer.orders_count = c
                .get("orders_count")
                .and_then(|n| n.as_u64())
                .map(|n| n as u32);
            customer.total_spent = f64_of(c, "total_spent");
            customer.created_at = str_of(c, "created_at")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
        }

        Ok(Some((event, customer)))
    }
}
