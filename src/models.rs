use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Canonical event vocabulary. Every provider event name is mapped into this
/// enum at parse time; names outside the vocabulary are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PaymentSuccess,
    PaymentFailure,
    PaymentActionRequired,
    PaymentCancelled,
    InvoicePaid,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialStarted,
    TrialEnding,
    CheckoutCompleted,
    OrderCreated,
    CustomerUpdated,
    SupportTicketCreated,
    SupportTicketUpdated,
    SupportTicketStatusChanged,
    SupportTicketComment,
    SupportTicketResolved,
    SupportTicketAssigned,
    SupportTicketReopened,
    SupportTicketPriorityChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentSuccess => "payment_success",
            EventType::PaymentFailure => "payment_failure",
            EventType::PaymentActionRequired => "payment_action_required",
            EventType::PaymentCancelled => "payment_cancelled",
            EventType::InvoicePaid => "invoice_paid",
            EventType::SubscriptionCreated => "subscription_created",
            EventType::SubscriptionUpdated => "subscription_updated",
            EventType::SubscriptionDeleted => "subscription_deleted",
            EventType::TrialStarted => "trial_started",
            EventType::TrialEnding => "trial_ending",
            EventType::CheckoutCompleted => "checkout_completed",
            EventType::OrderCreated => "order_created",
            EventType::CustomerUpdated => "customer_updated",
            EventType::SupportTicketCreated => "support_ticket_created",
            EventType::SupportTicketUpdated => "support_ticket_updated",
            EventType::SupportTicketStatusChanged => "support_ticket_status_changed",
            EventType::SupportTicketComment => "support_ticket_comment",
            EventType::SupportTicketResolved => "support_ticket_resolved",
            EventType::SupportTicketAssigned => "support_ticket_assigned",
            EventType::SupportTicketReopened => "support_ticket_reopened",
            EventType::SupportTicketPriorityChanged => "support_ticket_priority_changed",
        }
    }

    /// Rank used when collapsing a buffered burst into one notification.
    /// Higher wins; the winner supplies the headline and metadata.
    pub fn merge_priority(&self) -> u8 {
        match self {
            EventType::TrialStarted => 100,
            EventType::SubscriptionCreated => 90,
            EventType::SubscriptionUpdated | EventType::SubscriptionDeleted => 80,
            EventType::CheckoutCompleted => 70,
            EventType::PaymentFailure => 60,
            EventType::PaymentSuccess => 50,
            EventType::InvoicePaid => 40,
            _ => 0,
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventType::PaymentSuccess
            | EventType::PaymentFailure
            | EventType::PaymentActionRequired
            | EventType::InvoicePaid => EventCategory::Payment,
            EventType::SubscriptionCreated
            | EventType::SubscriptionUpdated
            | EventType::SubscriptionDeleted => EventCategory::Subscription,
            EventType::TrialStarted | EventType::TrialEnding => EventCategory::Trial,
            EventType::CheckoutCompleted
            | EventType::OrderCreated
            | EventType::PaymentCancelled => EventCategory::Order,
            EventType::CustomerUpdated => EventCategory::Customer,
            EventType::SupportTicketCreated
            | EventType::SupportTicketUpdated
            | EventType::SupportTicketStatusChanged
            | EventType::SupportTicketComment
            | EventType::SupportTicketResolved
            | EventType::SupportTicketAssigned
            | EventType::SupportTicketReopened
            | EventType::SupportTicketPriorityChanged => EventCategory::Support,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Payment,
    Subscription,
    Trial,
    Order,
    Customer,
    Support,
}

/// Named keys for the event metadata bag. Adapters and the composer agree on
/// these instead of passing ad-hoc strings around.
pub mod meta {
    pub const PLAN_NAME: &str = "plan_name";
    pub const PLAN_AMOUNT: &str = "plan_amount";
    pub const SUBSCRIPTION_ID: &str = "subscription_id";
    pub const BILLING_PERIOD: &str = "billing_period";
    pub const PREVIOUS_AMOUNT: &str = "previous_amount";
    pub const PREVIOUS_STATE: &str = "previous_state";
    pub const CANCEL_AT_PERIOD_END: &str = "cancel_at_period_end";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const PAYMENT_METHOD: &str = "payment_method";
    pub const IS_TRIAL: &str = "is_trial";
    pub const TRIAL_DAYS: &str = "trial_days";
    pub const TRIAL_END: &str = "trial_end";
    pub const ORDER_NUMBER: &str = "order_number";
    pub const ORDER_REFERENCE: &str = "order_reference";
    pub const LINE_ITEMS: &str = "line_items";
    pub const SHOP_DOMAIN: &str = "shop_domain";
    pub const TICKET_ID: &str = "ticket_id";
    pub const TICKET_SUBJECT: &str = "ticket_subject";
    pub const TICKET_STATUS: &str = "ticket_status";
    pub const TICKET_PRIORITY: &str = "ticket_priority";
    pub const TICKET_URL: &str = "ticket_url";
    pub const TICKET_ASSIGNEE: &str = "ticket_assignee";
    pub const WEBSITE: &str = "website";
}

/// String-keyed metadata with a fixed key vocabulary (see [`meta`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies entries from `other` that are not already present.
    pub fn fill_missing_from(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Provider-agnostic event produced by the adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub provider: String,
    pub event_type: EventType,
    /// Provider-side identifier of the delivery (e.g. `evt_...`). Used for
    /// exact-duplicate detection.
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Major currency units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// Provider idempotency key, when the provider supplies one. Preferred
    /// correlation key for aggregation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl NormalizedEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        provider: impl Into<String>,
        event_type: EventType,
        external_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            provider: provider.into(),
            event_type,
            external_id: external_id.into(),
            customer_id: None,
            amount: None,
            currency: None,
            occurred_at,
            idempotency_key: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub success: bool,
    pub amount: f64,
}

/// Customer enrichment attached to an event by the adapter that parsed it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders_count: Option<u32>,
    /// Lifetime value in major units, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_spent: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payment_history: Vec<PaymentRecord>,
}

impl CustomerContext {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => self
                .email
                .clone()
                .unwrap_or_else(|| "Unknown customer".to_string()),
        }
    }

    /// Back-fills identity fields that are empty here but present in `other`.
    pub fn fill_missing_from(&mut self, other: &CustomerContext) {
        if self.first_name.is_none() {
            self.first_name = other.first_name.clone();
        }
        if self.last_name.is_none() {
            self.last_name = other.last_name.clone();
        }
        if self.company_name.is_none() {
            self.company_name = other.company_name.clone();
        }
        if self.created_at.is_none() {
            self.created_at = other.created_at;
        }
        if self.orders_count.is_none() {
            self.orders_count = other.orders_count;
        }
        if self.total_spent.is_none() {
            self.total_spent = other.total_spent;
        }
        if self.payment_history.is_empty() {
            self.payment_history = other.payment_history.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Trial,
    Basic,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn monthly_limit(&self) -> u64 {
        match self {
            PlanTier::Trial => 1_000,
            PlanTier::Basic => 10_000,
            PlanTier::Pro => 100_000,
            PlanTier::Enterprise => 1_000_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Trial => "trial",
            PlanTier::Basic => "basic",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}
