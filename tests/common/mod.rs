#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::Router;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::{Arc, Mutex};

use notify_relay::aggregator::Aggregator;
use notify_relay::consolidation::ConsolidationFilter;
use notify_relay::destinations::{Destination, DestinationConfig, Dispatcher};
use notify_relay::error::DeliveryError;
use notify_relay::metrics::Metrics;
use notify_relay::notify::{Composer, InsightDetector, MilestoneConfig, RichNotification};
use notify_relay::providers::ProviderRegistry;
use notify_relay::quota::QuotaEnforcer;
use notify_relay::routes::{router, AppState};
use notify_relay::store::{Clock, ManualClock, MemoryStore, SharedStore};
use notify_relay::tenants::{StaticDirectory, TenantConfig, TenantDirectory};

pub const STRIPE_SECRET: &str = "whsec_test";
pub const SHOPIFY_SECRET: &str = "shpss_test";
pub const CHARGIFY_SECRET: &str = "ch_test";
pub const ZENDESK_SECRET: &str = "zd_test";

/// Captures every notification instead of calling out over HTTP.
pub struct RecordingDestination {
    pub sent: Mutex<Vec<RichNotification>>,
    pub fail_retryable: Mutex<bool>,
}

impl RecordingDestination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_retryable: Mutex::new(false),
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn headlines(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.headline.clone())
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail_retryable.lock().unwrap() = failing;
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn accepts(&self, _config: &DestinationConfig) -> bool {
        true
    }

    async fn deliver(
        &self,
        _config: &DestinationConfig,
        notification: &RichNotification,
    ) -> Result<(), DeliveryError> {
        if *self.fail_retryable.lock().unwrap() {
            return Err(DeliveryError::Retryable("injected failure".into()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<StaticDirectory>,
    pub recorder: Arc<RecordingDestination>,
    pub filter: Arc<ConsolidationFilter>,
    pub aggregator: Arc<Aggregator>,
    pub metrics: Metrics,
    pub app: Router,
}

pub fn tenant_config(plan: &str) -> TenantConfig {
    let toml = format!(
        r#"
plan = "{plan}"

[providers.stripe]
secret = "{STRIPE_SECRET}"

[providers.chargify]
secret = "{CHARGIFY_SECRET}"

[providers.shopify]
secret = "{SHOPIFY_SECRET}"

[providers.zendesk]
secret = "{ZENDESK_SECRET}"

[[destinations]]
kind = "slack"
webhook_url = "https://hooks.slack.example/T1/B1/x"
"#
    );
    toml::from_str(&toml).expect("tenant config")
}

pub fn harness(delay: std::time::Duration) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let directory = Arc::new(StaticDirectory::new());
    directory.insert("acme", tenant_config("trial"));

    let recorder = RecordingDestination::new();
    let metrics = Metrics::new();

    let store_dyn: Arc<dyn SharedStore> = store.clone();
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let tenants_dyn: Arc<dyn TenantDirectory> = directory.clone();

    let filter = Arc::new(ConsolidationFilter::new(store_dyn.clone()));
    let quota = Arc::new(QuotaEnforcer::new(store_dyn.clone(), clock_dyn.clone()));
    let aggregator = Arc::new(Aggregator::new(
        store_dyn.clone(),
        clock_dyn.clone(),
        tenants_dyn.clone(),
        filter.clone(),
        Composer::new(InsightDetector::new(MilestoneConfig::default())),
        Dispatcher::new(vec![recorder.clone()]),
        metrics.clone(),
        delay,
    ));

    let state = Arc::new(AppState {
        registry: ProviderRegistry::new(clock_dyn),
        tenants: tenants_dyn,
        quota,
        filter: filter.clone(),
        aggregator: aggregator.clone(),
        metrics: metrics.clone(),
        allow_unsigned: false,
    });

    Harness {
        clock,
        store,
        directory,
        recorder,
        filter,
        aggregator,
        metrics,
        app: router(state),
    }
}

pub fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Stripe-style signature header for a body signed at `timestamp`.
pub fn stripe_signature(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(body);
    format!(
        "t={timestamp},v1={}",
        hex::encode(hmac_sha256(secret.as_bytes(), &signed))
    )
}

pub fn stripe_invoice_body(event_id: &str, amount_cents: i64) -> String {
    serde_json::json!({
        "id": event_id,
        "type": "invoice.payment_succeeded",
        "created": Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap().timestamp(),
        "data": {"object": {
            "id": "in_1",
            "customer": "cus_1",
            "customer_email": "billing@notion.so",
            "amount_paid": amount_cents,
            "currency": "usd"
        }}
    })
    .to_string()
}

pub fn stripe_headers(secret: &str, timestamp: i64, body: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Stripe-Signature",
        stripe_signature(secret, timestamp, body.as_bytes())
            .parse()
            .unwrap(),
    );
    headers.insert("content-type", "application/json".parse().unwrap());
    headers
}

/// Sends one request through the router and returns status, headers, and the
/// decoded JSON body.
pub async fn post_webhook(
    app: &Router,
    tenant: &str,
    provider: &str,
    headers: HeaderMap,
    body: String,
) -> (
    axum::http::StatusCode,
    HeaderMap,
    serde_json::Value,
) {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let mut request = axum::http::Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{tenant}/{provider}"));
    for (name, value) in headers.iter() {
        request = request.header(name, value);
    }
    let response = app
        .clone()
        .oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}
