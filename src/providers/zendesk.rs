use axum::http::HeaderMap;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::{constant_time_eq, header_str, hmac_sha256, ProviderAdapter};
use crate::error::WebhookError;
use crate::models::{meta, CustomerContext, EventType, NormalizedEvent};
use crate::store::Clock;

pub const SIGNATURE_HEADER: &str = "X-Zendesk-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Zendesk-Webhook-Signature-Timestamp";

const EVENT_PREFIX: &str = "zen:event-type:";

/// Zendesk-style support webhooks: JSON body, base64 HMAC-SHA-256 over
/// timestamp + body.
pub struct ZendeskAdapter {
    clock: Arc<dyn Clock>,
}

impl ZendeskAdapter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn map_event_type(name: &str) -> Option<EventType> {
        let name = name.strip_prefix(EVENT_PREFIX).unwrap_or(name);
        match name {
            "ticket.created" => Some(EventType::SupportTicketCreated),
            "ticket.updated" => Some(EventType::SupportTicketUpdated),
            "ticket.status_changed" => Some(EventType::SupportTicketStatusChanged),
            "ticket.comment_added" => Some(EventType::SupportTicketComment),
            "ticket.resolved" | "ticket.solved" => Some(EventType::SupportTicketResolved),
            "ticket.assigned" | "ticket.agent_assignment_changed" => {
                Some(EventType::SupportTicketAssigned)
            }
            "ticket.reopened" => Some(EventType::SupportTicketReopened),
            "ticket.priority_changed" => Some(EventType::SupportTicketPriorityChanged),
            _ => None,
        }
    }
}

fn normalize_status(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "new" => "new",
        "open" => "open",
        "pending" => "pending",
        "hold" | "on-hold" => "on_hold",
        "solved" | "resolved" => "solved",
        "closed" => "closed",
        _ => "open",
    }
}

fn normalize_priority(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "urgent" => "urgent",
        "high" => "high",
        "low" => "low",
        _ => "normal",
    }
}

fn str_of<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

impl ProviderAdapter for ZendeskAdapter {
    fn name(&self) -> &'static str {
        "zendesk"
    }

    fn display_name(&self) -> &'static str {
        "Zendesk"
    }

    fn validate(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        secret: &str,
    ) -> Result<(), WebhookError> {
        let signature = header_str(headers, SIGNATURE_HEADER)
            .ok_or(WebhookError::InvalidSignature)?;
        let timestamp = header_str(headers, TIMESTAMP_HEADER)
            .ok_or(WebhookError::InvalidSignature)?;

        let mut signed = timestamp.as_bytes().to_vec();
        signed.extend_from_slice(body);
        let expected = hmac_sha256(secret.as_bytes(), &signed);
        let provided = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| WebhookError::InvalidSignature)?;

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
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let type_name = str_of(&payload, "type")
            .or_else(|| str_of(&payload, "event_type"))
            .ok_or_else(|| WebhookError::InvalidPayload("missing event type".into()))?;
        let event_type = Self::map_event_type(type_name)
            .ok_or_else(|| WebhookError::UnsupportedEventType(type_name.to_string()))?;

        let detail = payload
            .get("detail")
            .or_else(|| payload.get("ticket"))
            .ok_or_else(|| WebhookError::InvalidPayload("missing ticket detail".into()))?;

        let ticket_id = detail
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| WebhookError::InvalidPayload("missing ticket id".into()))?;

        let external_id = str_of(&payload, "id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("ticket:{ticket_id}:{}", event_type.as_str()));

        let occurred_at = str_of(&payload, "time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| self.clock.now());

        let mut event =
            NormalizedEvent::new(tenant_id, self.name(), event_type, external_id, occurred_at);

        event.metadata.insert(meta::TICKET_ID, ticket_id.clone());
        if let Some(subject) = str_of(detail, "subject") {
            event.metadata.insert(meta::TICKET_SUBJECT, subject);
        }
        if let Some(status) = str_of(detail, "status") {
            event
                .metadata
                .insert(meta::TICKET_STATUS, normalize_status(status));
        }
        if let Some(priority) = str_of(detail, "priority") {
            event
                .metadata
                .insert(meta::TICKET_PRIORITY, normalize_priority(priority));
        }
        if let Some(assignee) = detail
            .get("assignee")
            .and_then(|a| str_of(a, "name"))
            .or_else(|| str_of(detail, "assignee_name"))
        {
            event.metadata.insert(meta::TICKET_ASSIGNEE, assignee);
        }
        if let Some(subdomain) = str_of(&payload, "subdomain")
            .or_else(|| str_of(detail, "subdomain"))
        {
            event.metadata.insert(
                meta::TICKET_URL,
                format!("https://{subdomain}.zendesk.com/agent/tickets/{ticket_id}"),
            );
        }

        let requester = detail.get("requester");
        let mut customer = CustomerContext::default();
        if let Some(r) = requester {
            event.customer_id = r.get("id").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            customer.email = str_of(r, "email").map(str::to_string);
            if let Some(name) = str_of(r, "name") {
                let mut parts = name.splitn(2, ' ');
                customer.first_name = parts.next().map(str::to_string);
                customer.last_name = parts.next().map(str::to_string);
            }
            customer.company_name = str_of(r, "organization").map(str::to_string);
        }

        Ok(Some((event, customer)))
    }
}
