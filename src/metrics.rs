use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub webhooks_received_total: IntCounterVec,
    pub events_suppressed_total: IntCounterVec,
    pub quota_denied_total: IntCounterVec,
    pub quota_degraded_total: IntCounter,
    pub notifications_delivered_total: IntCounterVec,
    pub buffer_expired_total: IntCounter,
    pub orphans_recovered_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhooks_received_total = IntCounterVec::new(
            Opts::new("relay_webhooks_received_total", "Webhook deliveries by outcome"),
            &["provider", "outcome"], // accepted|suppressed|duplicate|test|invalid|unauthorized|quota_denied|error
        )
        .expect("metric");

        let events_suppressed_total = IntCounterVec::new(
            Opts::new("relay_events_suppressed_total", "Events suppressed by reason"),
            &["reason"], // exact_duplicate|consolidated|zero_amount
        )
        .expect("metric");

        let quota_denied_total = IntCounterVec::new(
            Opts::new("relay_quota_denied_total", "Deliveries denied by quota"),
            &["plan"],
        )
        .expect("metric");

        let quota_degraded_total = IntCounter::new(
            "relay_quota_degraded_total",
            "Quota decisions taken from the local fallback counters",
        )
        .expect("metric");

        let notifications_delivered_total = IntCounterVec::new(
            Opts::new(
                "relay_notifications_delivered_total",
                "Notification deliveries by destination and result",
            ),
            &["destination", "result"], // ok|retryable|terminal
        )
        .expect("metric");

        let buffer_expired_total = IntCounter::new(
            "relay_buffer_expired_total",
            "Aggregation buffers already expired when the timer fired",
        )
        .expect("metric");

        let orphans_recovered_total = IntCounter::new(
            "relay_orphans_recovered_total",
            "Orphaned aggregation buffers processed at startup",
        )
        .expect("metric");

        registry
            .register(Box::new(webhooks_received_total.clone()))
            .expect("register");
        registry
            .register(Box::new(events_suppressed_total.clone()))
            .expect("register");
        registry
            .register(Box::new(quota_denied_total.clone()))
            .expect("register");
        registry
            .register(Box::new(quota_degraded_total.clone()))
            .expect("register");
        registry
            .register(Box::new(notifications_delivered_total.clone()))
            .expect("register");
        registry
            .register(Box::new(buffer_expired_total.clone()))
            .expect("register");
        registry
            .register(Box::new(orphans_recovered_total.clone()))
            .expect("register");

        Self {
            registry,
            webhooks_received_total,
            events_suppressed_total,
            quota_denied_total,
            quota_degraded_total,
            notifications_delivered_total,
            buffer_expired_total,
            orphans_recovered_total,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
