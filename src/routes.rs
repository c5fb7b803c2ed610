use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::consolidation::{ConsolidationFilter, Verdict};
use crate::error::{ErrorResponse, WebhookError};
use crate::metrics::Metrics;
use crate::providers::ProviderRegistry;
use crate::quota::{QuotaEnforcer, UsageSnapshot};
use crate::tenants::TenantDirectory;

pub struct AppState {
    pub registry: ProviderRegistry,
    pub tenants: Arc<dyn TenantDirectory>,
    pub quota: Arc<QuotaEnforcer>,
    pub filter: Arc<ConsolidationFilter>,
    pub aggregator: Arc<Aggregator>,
    pub metrics: Metrics,
    /// Accept deliveries for integrations without a configured secret.
    pub allow_unsigned: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/{tenant_id}/{provider}", post(handle_webhook))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(render_metrics))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_live() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health_ready() -> impl IntoResponse {
    // The store is in-process and the tenant registry loads before bind, so
    // readiness equals liveness here.
    Json(json!({"status": "ready"}))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("metrics_error", e)),
        )
            .into_response(),
    }
}

fn rate_limit_headers(response: &mut Response, snapshot: &UsageSnapshot) {
    let headers = response.headers_mut();
    let pairs = [
        ("X-RateLimit-Limit", snapshot.limit.to_string()),
        ("X-RateLimit-Remaining", snapshot.remaining.to_string()),
        ("X-RateLimit-Used", snapshot.used.to_string()),
        ("X-RateLimit-Reset", snapshot.reset_epoch.to_string()),
        ("X-RateLimit-Plan", snapshot.plan.as_str().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, provider)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received = |outcome: &str| {
        state
            .metrics
            .webhooks_received_total
            .with_label_values(&[provider.as_str(), outcome])
            .inc();
    };

    let Some(adapter) = state.registry.get(&provider) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "unknown_provider",
                format!("no adapter for provider {provider}"),
            )),
        )
            .into_response();
    };

    let Some(tenant) = state.tenants.tenant(&tenant_id) else {
        received("invalid");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("unknown_tenant", "tenant not configured")),
        )
            .into_response();
    };
    if !tenant.active {
        received("invalid");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("unknown_tenant", "tenant not active")),
        )
            .into_response();
    }
    let Some(settings) = tenant.providers.get(&provider) else {
        received("invalid");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "integration_not_configured",
                format!("tenant has no {provider} integration"),
            )),
        )
            .into_response();
    };

    match &settings.secret {
        Some(secret) => {
            if let Err(e) = adapter.validate(&headers, &body, secret) {
                received("unauthorized");
                tracing::warn!(tenant_id, provider, error = %e, "signature rejected");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse::new("invalid_signature", e.to_string())),
                )
                    .into_response();
            }
        }
        None => {
            if !state.allow_unsigned {
                received("unauthorized");
                tracing::warn!(tenant_id, provider, "unsigned delivery rejected");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse::new(
                        "invalid_signature",
                        "no signing secret configured",
                    )),
                )
                    .into_response();
            }
            tracing::debug!(tenant_id, provider, "signature validation bypassed");
        }
    }

    let decision = state.quota.check(&tenant_id, tenant.plan).await;
    if decision.snapshot.degraded {
        state.metrics.quota_degraded_total.inc();
    }
    if !decision.allowed {
        received("quota_denied");
        state
            .metrics
            .quota_denied_total
            .with_label_values(&[tenant.plan.as_str()])
            .inc();
        tracing::warn!(
            tenant_id,
            plan = tenant.plan.as_str(),
            used = decision.snapshot.used,
            "monthly quota exceeded"
        );
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new(
                "quota_exceeded",
                "monthly webhook quota exceeded",
            )),
        )
            .into_response();
        rate_limit_headers(&mut response, &decision.snapshot);
        return response;
    }

    let parsed = match adapter.parse(&tenant_id, &headers, &body) {
        Ok(parsed) => parsed,
        Err(WebhookError::DuplicateDelivery) => {
            received("duplicate");
            return (
                StatusCode::OK,
                Json(json!({"status": "duplicate"})),
            )
                .into_response();
        }
        Err(e) => {
            received("invalid");
            tracing::warn!(tenant_id, provider, error = %e, "payload rejected");
            let error_kind = match &e {
                WebhookError::UnsupportedEventType(_) => "unsupported_event_type",
                _ => "invalid_payload",
            };
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(error_kind, e.to_string())),
            )
                .into_response();
        }
    };

    let Some((event, customer)) = parsed else {
        received("test");
        return (StatusCode::OK, Json(json!({"status": "ignored"}))).into_response();
    };

    let snapshot = state.quota.increment(&tenant_id, tenant.plan).await;

    match state.filter.admit(&event).await {
        Ok(Verdict::Deliver) => {}
        Ok(Verdict::Suppressed(reason)) => {
            received("suppressed");
            state
                .metrics
                .events_suppressed_total
                .with_label_values(&[reason.as_str()])
                .inc();
            tracing::info!(
                tenant_id,
                provider,
                event_type = event.event_type.as_str(),
                reason = reason.as_str(),
                "event suppressed at admission"
            );
            let mut response = (
                StatusCode::OK,
                Json(json!({"status": "suppressed", "reason": reason.as_str()})),
            )
                .into_response();
            rate_limit_headers(&mut response, &snapshot);
            return response;
        }
        Err(e) => {
            tracing::warn!(tenant_id, error = %e, "suppression check failed, continuing");
        }
    }

    if let Err(e) = state.aggregator.enqueue(event.clone(), customer).await {
        received("error");
        tracing::error!(tenant_id, provider, error = %e, "failed to buffer event");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("store_error", e.to_string())),
        )
            .into_response();
    }

    received("accepted");
    tracing::info!(
        tenant_id,
        provider,
        event_type = event.event_type.as_str(),
        event_id = %event.id,
        "webhook accepted"
    );
    let mut response = (
        StatusCode::OK,
        Json(json!({"status": "accepted", "event_id": event.id})),
    )
        .into_response();
    rate_limit_headers(&mut response, &snapshot);
    response
}
