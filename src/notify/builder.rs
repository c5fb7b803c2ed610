use super::{
    compact_ltv, format_amount, tenure_display, ActionButton, BillingInterval, CustomerBlock,
    DetailField, DetailSection, InsightDetector, PaymentBlock, RichNotification, Severity,
    TicketBlock,
};
use crate::models::{meta, CustomerContext, EventCategory, EventType, NormalizedEvent};

/// Builds a `RichNotification` from a normalized event and its customer
/// context. All copy decisions live here; renderers only lay things out.
pub struct Composer {
    insights: InsightDetector,
}

impl Composer {
    pub fn new(insights: InsightDetector) -> Self {
        Self { insights }
    }

    pub fn compose(&self, event: &NormalizedEvent, customer: &CustomerContext) -> RichNotification {
        let severity = severity_for(event.event_type);
        let insight = self.insights.detect(event, customer);
        let flags = self.insights.risk_flags(event, customer);

        let payment = payment_block(event);
        let ticket = ticket_block(event);
        let detail_sections = detail_sections(event, payment.is_some() || ticket.is_some());

        RichNotification {
            event_type: event.event_type,
            category: event.event_type.category(),
            severity,
            headline: headline(event),
            headline_icon: icon_for(event.event_type),
            provider: event.provider.clone(),
            provider_display: provider_display(&event.provider).to_string(),
            customer: CustomerBlock {
                display_name: customer.display_name(),
                email: customer.email.clone(),
                company_name: customer.company_name.clone(),
                tenure_display: customer.created_at.map(tenure_display),
                ltv_display: customer.total_spent.map(compact_ltv),
                flags,
            },
            insight,
            payment,
            ticket,
            detail_sections,
            actions: actions(event, customer),
        }
    }
}

pub fn provider_display(provider: &str) -> &'static str {
    match provider {
        "stripe" => "Stripe",
        "chargify" => "Chargify",
        "shopify" => "Shopify",
        "zendesk" => "Zendesk",
        _ => "Webhook",
    }
}

fn severity_for(event_type: EventType) -> Severity {
    match event_type {
        EventType::PaymentSuccess
        | EventType::InvoicePaid
        | EventType::CheckoutCompleted
        | EventType::OrderCreated
        | EventType::SupportTicketResolved => Severity::Success,
        EventType::PaymentFailure => Severity::Error,
        EventType::PaymentActionRequired
        | EventType::PaymentCancelled
        | EventType::SubscriptionDeleted
        | EventType::TrialEnding
        | EventType::SupportTicketReopened
        | EventType::SupportTicketPriorityChanged => Severity::Warning,
        _ => Severity::Info,
    }
}

fn icon_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::PaymentSuccess | EventType::InvoicePaid => "money",
        EventType::PaymentFailure | EventType::PaymentActionRequired => "warning",
        EventType::PaymentCancelled => "warning",
        EventType::SubscriptionCreated => "rocket",
        EventType::SubscriptionUpdated => "chart",
        EventType::SubscriptionDeleted => "warning",
        EventType::TrialStarted => "new",
        EventType::TrialEnding => "hourglass",
        EventType::CheckoutCompleted | EventType::OrderCreated => "cart",
        EventType::CustomerUpdated => "person",
        _ => "ticket",
    }
}

/// Event-focused headline. Deliberately contains no customer or company
/// identity; that belongs in the customer footer.
fn headline(event: &NormalizedEvent) -> String {
    let amount = event
        .amount
        .map(|a| format_amount(a, event.currency.as_deref().unwrap_or("USD")));
    let order = event
        .metadata
        .get(meta::ORDER_NUMBER)
        .map(|n| format!("#{n}"));

    match event.event_type {
        EventType::PaymentSuccess => match (amount, is_trial_conversion(event)) {
            (Some(a), true) => format!("Payment received - {a} (trial converted)"),
            (Some(a), false) => format!("Payment received - {a}"),
            (None, _) => "Payment received".to_string(),
        },
        EventType::PaymentFailure => match amount {
            Some(a) => format!("Payment failed - {a}"),
            None => "Payment failed".to_string(),
        },
        EventType::PaymentActionRequired => "Payment needs customer action".to_string(),
        EventType::PaymentCancelled => match order {
            Some(o) => format!("Order {o} cancelled"),
            None => "Order cancelled".to_string(),
        },
        EventType::InvoicePaid => match amount {
            Some(a) => format!("Invoice paid - {a}"),
            None => "Invoice paid".to_string(),
        },
        EventType::SubscriptionCreated => match amount {
            Some(a) => format!("New subscription - {a}"),
            None => "New subscription".to_string(),
        },
        EventType::SubscriptionUpdated => {
            if event.metadata.get(meta::CANCEL_AT_PERIOD_END) == Some("true") {
                "Subscription set to cancel at period end".to_string()
            } else if let Some(prev) = event.metadata.get(meta::PREVIOUS_AMOUNT) {
                match amount {
                    Some(a) => format!("Subscription changed - ${prev} to {a}"),
                    None => "Subscription updated".to_string(),
                }
            } else {
                "Subscription updated".to_string()
            }
        }
        EventType::SubscriptionDeleted => "Subscription canceled".to_string(),
        EventType::TrialStarted => "New trial started".to_string(),
        EventType::TrialEnding => match event.metadata.get(meta::TRIAL_DAYS) {
            Some(days) => format!("Trial ends in {days} days"),
            None => "Trial ending soon".to_string(),
        },
        EventType::CheckoutCompleted => match amount {
            Some(a) => format!("Checkout completed - {a}"),
            None => "Checkout completed".to_string(),
        },
        EventType::OrderCreated => match (order, amount) {
            (Some(o), Some(a)) => format!("Order {o} placed - {a}"),
            (Some(o), None) => format!("Order {o} placed"),
            (None, Some(a)) => format!("Order placed - {a}"),
            (None, None) => "Order placed".to_string(),
        },
        EventType::CustomerUpdated => "Customer profile updated".to_string(),
        EventType::SupportTicketCreated => ticket_headline(event, "opened"),
        EventType::SupportTicketUpdated => ticket_headline(event, "updated"),
        EventType::SupportTicketStatusChanged => ticket_headline(event, "status changed"),
        EventType::SupportTicketComment => ticket_headline(event, "new comment"),
        EventType::SupportTicketResolved => ticket_headline(event, "resolved"),
        EventType::SupportTicketAssigned => ticket_headline(event, "assigned"),
        EventType::SupportTicketReopened => ticket_headline(event, "reopened"),
        EventType::SupportTicketPriorityChanged => ticket_headline(event, "priority changed"),
    }
}

fn ticket_headline(event: &NormalizedEvent, verb: &str) -> String {
    match event.metadata.get(meta::TICKET_ID) {
        Some(id) => format!("Support ticket #{id} {verb}"),
        None => format!("Support ticket {verb}"),
    }
}

fn is_trial_conversion(event: &NormalizedEvent) -> bool {
    event.metadata.get(meta::PREVIOUS_STATE) == Some("trialing")
}

fn is_recurring(event: &NormalizedEvent) -> bool {
    event.metadata.contains(meta::SUBSCRIPTION_ID)
        || event.metadata.contains(meta::BILLING_PERIOD)
}

fn payment_block(event: &NormalizedEvent) -> Option<PaymentBlock> {
    // A trial start carries a $0 amount by construction; showing a payment
    // section for it would be noise.
    if event.event_type == EventType::TrialStarted {
        return None;
    }
    match event.event_type.category() {
        EventCategory::Payment | EventCategory::Subscription | EventCategory::Order => {
            let amount = event.amount?;
            Some(PaymentBlock {
                amount,
                currency: event.currency.clone().unwrap_or_else(|| "USD".to_string()),
                method: event
                    .metadata
                    .get(meta::PAYMENT_METHOD)
                    .map(str::to_string),
                is_recurring: is_recurring(event),
                billing_interval: event
                    .metadata
                    .get(meta::BILLING_PERIOD)
                    .and_then(BillingInterval::from_str),
            })
        }
        _ => None,
    }
}

fn ticket_block(event: &NormalizedEvent) -> Option<TicketBlock> {
    if event.event_type.category() != EventCategory::Support {
        return None;
    }
    Some(TicketBlock {
        id: event.metadata.get(meta::TICKET_ID)?.to_string(),
        subject: event.metadata.get(meta::TICKET_SUBJECT).map(str::to_string),
        status: event.metadata.get(meta::TICKET_STATUS).map(str::to_string),
        priority: event
            .metadata
            .get(meta::TICKET_PRIORITY)
            .map(str::to_string),
        assignee: event
            .metadata
            .get(meta::TICKET_ASSIGNEE)
            .map(str::to_string),
        url: event.metadata.get(meta::TICKET_URL).map(str::to_string),
    })
}

fn detail_sections(event: &NormalizedEvent, has_primary_block: bool) -> Vec<DetailSection> {
    let mut sections = Vec::new();

    if let Some(items) = event.metadata.get(meta::LINE_ITEMS) {
        sections.push(DetailSection {
            title: "Items".to_string(),
            fields: Vec::new(),
            text: Some(items.to_string()),
        });
    }

    if let Some(reason) = event.metadata.get(meta::FAILURE_REASON) {
        sections.push(DetailSection {
            title: "Failure".to_string(),
            fields: vec![DetailField {
                label: "Reason".to_string(),
                value: reason.to_string(),
            }],
            text: None,
        });
    }

    let mut plan_fields = Vec::new();
    if let Some(plan) = event.metadata.get(meta::PLAN_NAME) {
        plan_fields.push(DetailField {
            label: "Plan".to_string(),
            value: plan.to_string(),
        });
    }
    if let Some(previous) = event.metadata.get(meta::PREVIOUS_STATE) {
        plan_fields.push(DetailField {
            label: "Previous state".to_string(),
            value: previous.to_string(),
        });
    }
    if let Some(days) = event.metadata.get(meta::TRIAL_DAYS) {
        plan_fields.push(DetailField {
            label: "Trial length".to_string(),
            value: format!("{days} days"),
        });
    }
    if let Some(reference) = event.metadata.get(meta::ORDER_REFERENCE) {
        plan_fields.push(DetailField {
            label: "Order reference".to_string(),
            value: format!("#{reference}"),
        });
    }
    if !plan_fields.is_empty() {
        sections.push(DetailSection {
            title: "Subscription".to_string(),
            fields: plan_fields,
            text: None,
        });
    }

    // Events that carry neither a payment nor a ticket block still deserve
    // something below the headline.
    if sections.is_empty() && !has_primary_block && !event.metadata.is_empty() {
        let fields: Vec<DetailField> = event
            .metadata
            .iter()
            .filter(|(k, _)| *k != meta::SHOP_DOMAIN)
            .map(|(k, v)| DetailField {
                label: k.replace('_', " "),
                value: v.to_string(),
            })
            .collect();
        if !fields.is_empty() {
            sections.push(DetailSection {
                title: "Details".to_string(),
                fields,
                text: None,
            });
        }
    }

    sections
}

/// Shopify deep links are only emitted for first-party shop domains; a
/// spoofed header must not become a clickable link in chat.
pub fn shop_domain_allowed(domain: &str) -> bool {
    let Some(label) = domain.strip_suffix(".myshopify.com") else {
        return false;
    };
    !label.is_empty()
        && !label.contains('.')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !label.starts_with('-')
}

fn actions(event: &NormalizedEvent, customer: &CustomerContext) -> Vec<ActionButton> {
    let mut actions = Vec::new();

    match event.provider.as_str() {
        "stripe" => {
            if let Some(customer_id) = &event.customer_id {
                actions.push(ActionButton {
                    text: "View in Stripe".to_string(),
                    url: format!("https://dashboard.stripe.com/customers/{customer_id}"),
                    style: Some("primary"),
                });
            }
        }
        "chargify" => {
            if let Some(subscription_id) = event.metadata.get(meta::SUBSCRIPTION_ID) {
                actions.push(ActionButton {
                    text: "View subscription".to_string(),
                    url: format!("https://app.chargify.com/subscriptions/{subscription_id}"),
                    style: Some("primary"),
                });
            }
        }
        "shopify" => {
            if let Some(domain) = event.metadata.get(meta::SHOP_DOMAIN) {
                if shop_domain_allowed(domain)
                    && event.event_type.category() == EventCategory::Order
                {
                    actions.push(ActionButton {
                        text: "View order".to_string(),
                        url: format!("https://{domain}/admin/orders/{}", event.external_id),
                        style: Some("primary"),
                    });
                }
            }
        }
        "zendesk" => {
            if let Some(url) = event.metadata.get(meta::TICKET_URL) {
                actions.push(ActionButton {
                    text: "Open ticket".to_string(),
                    url: url.to_string(),
                    style: Some("primary"),
                });
            }
        }
        _ => {}
    }

    if event.event_type == EventType::PaymentFailure {
        if let Some(email) = &customer.email {
            actions.push(ActionButton {
                text: "Contact customer".to_string(),
                url: format!("mailto:{email}"),
                style: Some("danger"),
            });
        }
    }

    if let Some(site) = event.metadata.get(meta::WEBSITE) {
        if site.starts_with("https://") || site.starts_with("http://") {
            actions.push(ActionButton {
                text: "Website".to_string(),
                url: site.to_string(),
                style: None,
            });
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MilestoneConfig;
    use chrono::{TimeZone, Utc};

    fn composer() -> Composer {
        Composer::new(InsightDetector::new(MilestoneConfig::default()))
    }

    fn event(event_type: EventType, amount: Option<f64>) -> NormalizedEvent {
        let mut e = NormalizedEvent::new(
            "acme",
            "stripe",
            event_type,
            "evt_1",
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
        );
        e.customer_id = Some("cus_1".into());
        e.amount = amount;
        e.currency = Some("USD".into());
        e
    }

    fn customer() -> CustomerContext {
        CustomerContext {
            email: Some("jo@vance.example".into()),
            first_name: Some("Jo".into()),
            last_name: Some("Vance".into()),
            company_name: Some("Vance Roastery".into()),
            created_at: Some(Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap()),
            orders_count: Some(7),
            total_spent: Some(7_120.0),
            payment_history: Vec::new(),
        }
    }

    #[test]
    fn headline_never_contains_identity() {
        let c = composer();
        let note = c.compose(&event(EventType::PaymentSuccess, Some(299.0)), &customer());
        assert_eq!(note.headline, "Payment received - $299.00");
        assert!(!note.headline.contains("Jo"));
        assert!(!note.headline.contains("Vance"));
        assert_eq!(note.customer.display_name, "Jo Vance");
        assert_eq!(note.customer.ltv_display.as_deref(), Some("$7.1k"));
        assert_eq!(note.customer.tenure_display.as_deref(), Some("Since Mar 2024"));
    }

    #[test]
    fn trial_start_has_no_payment_block() {
        let c = composer();
        let mut e = event(EventType::TrialStarted, Some(0.0));
        e.metadata.insert(meta::IS_TRIAL, "true");
        e.metadata.insert(meta::TRIAL_DAYS, "14");
        let note = c.compose(&e, &customer());
        assert_eq!(note.headline, "New trial started");
        assert!(note.payment.is_none());
        assert_eq!(note.severity, Severity::Info);
        assert_eq!(
            note.insight.as_ref().map(|i| i.kind),
            Some(crate::notify::InsightKind::TrialStarted)
        );
    }

    #[test]
    fn recurring_payment_gets_arr() {
        let c = composer();
        let mut e = event(EventType::PaymentSuccess, Some(299.0));
        e.metadata.insert(meta::SUBSCRIPTION_ID, "sub_1");
        e.metadata.insert(meta::BILLING_PERIOD, "monthly");
        let note = c.compose(&e, &customer());
        let payment = note.payment.unwrap();
        assert!(payment.is_recurring);
        assert_eq!(payment.amount_display(), "$299.00/mo = $3,588 ARR");
    }

    #[test]
    fn failure_gets_contact_action_and_reason() {
        let c = composer();
        let mut e = event(EventType::PaymentFailure, Some(49.0));
        e.metadata.insert(meta::FAILURE_REASON, "card_declined");
        let note = c.compose(&e, &customer());
        assert_eq!(note.severity, Severity::Error);
        assert!(note
            .actions
            .iter()
            .any(|a| a.url == "mailto:jo@vance.example"));
        assert!(note
            .detail_sections
            .iter()
            .any(|s| s.fields.iter().any(|f| f.value == "card_declined")));
    }

    #[test]
    fn shopify_order_link_requires_allowed_domain() {
        let c = composer();
        let mut e = event(EventType::OrderCreated, Some(149.95));
        e.provider = "shopify".into();
        e.external_id = "820982911".into();
        e.metadata.insert(meta::ORDER_NUMBER, "1234");
        e.metadata.insert(meta::SHOP_DOMAIN, "vance-roastery.myshopify.com");
        let note = c.compose(&e, &customer());
        assert_eq!(note.headline, "Order #1234 placed - $149.95");
        assert!(note
            .actions
            .iter()
            .any(|a| a.url == "https://vance-roastery.myshopify.com/admin/orders/820982911"));

        let mut spoofed = event(EventType::OrderCreated, Some(149.95));
        spoofed.provider = "shopify".into();
        spoofed
            .metadata
            .insert(meta::SHOP_DOMAIN, "evil.example.com");
        let note = c.compose(&spoofed, &customer());
        assert!(note.actions.iter().all(|a| !a.url.contains("evil")));
    }

    #[test]
    fn domain_allowlist() {
        assert!(shop_domain_allowed("vance-roastery.myshopify.com"));
        assert!(shop_domain_allowed("shop42.myshopify.com"));
        assert!(!shop_domain_allowed("evil.example.com"));
        assert!(!shop_domain_allowed(".myshopify.com"));
        assert!(!shop_domain_allowed("a.b.myshopify.com"));
        assert!(!shop_domain_allowed("evil.com/.myshopify.com"));
    }

    #[test]
    fn support_ticket_composes_ticket_block() {
        let c = composer();
        let mut e = event(EventType::SupportTicketCreated, None);
        e.provider = "zendesk".into();
        e.metadata.insert(meta::TICKET_ID, "3125");
        e.metadata.insert(meta::TICKET_SUBJECT, "Cannot export invoices");
        e.metadata.insert(meta::TICKET_PRIORITY, "urgent");
        e.metadata
            .insert(meta::TICKET_URL, "https://acme.zendesk.com/agent/tickets/3125");
        let note = c.compose(&e, &customer());
        assert_eq!(note.headline, "Support ticket #3125 opened");
        let ticket = note.ticket.unwrap();
        assert_eq!(ticket.priority.as_deref(), Some("urgent"));
        assert!(note.payment.is_none());
        assert!(note.actions.iter().any(|a| a.text == "Open ticket"));
    }

    #[test]
    fn trial_conversion_is_called_out() {
        let c = composer();
        let mut e = event(EventType::PaymentSuccess, Some(49.0));
        e.provider = "chargify".into();
        e.metadata.insert(meta::PREVIOUS_STATE, "trialing");
        let note = c.compose(&e, &customer());
        assert_eq!(note.headline, "Payment received - $49.00 (trial converted)");
    }
}
