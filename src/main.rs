use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notify_relay::aggregator::Aggregator;
use notify_relay::config::Config;
use notify_relay::consolidation::ConsolidationFilter;
use notify_relay::destinations::Dispatcher;
use notify_relay::metrics::Metrics;
use notify_relay::notify::{Composer, InsightDetector, MilestoneConfig};
use notify_relay::providers::ProviderRegistry;
use notify_relay::quota::QuotaEnforcer;
use notify_relay::routes::{router, AppState};
use notify_relay::store::{Clock, MemoryStore, SharedStore, SystemClock};
use notify_relay::tenants::{StaticDirectory, TenantDirectory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,notify_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!("config loaded");

    let directory = StaticDirectory::from_file(Path::new(&cfg.tenants_file))?;
    tracing::info!(tenants = directory.len(), file = %cfg.tenants_file, "tenant registry loaded");
    let tenants: Arc<dyn TenantDirectory> = Arc::new(directory);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new(clock.clone()));
    let metrics = Metrics::new();

    let quota = Arc::new(QuotaEnforcer::new(store.clone(), clock.clone()));
    let filter = Arc::new(ConsolidationFilter::new(store.clone()));
    let composer = Composer::new(InsightDetector::new(MilestoneConfig::default()));
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        clock.clone(),
        tenants.clone(),
        filter.clone(),
        composer,
        Dispatcher::standard(),
        metrics.clone(),
        std::time::Duration::from_secs(cfg.aggregation_delay_secs),
    ));

    let recovered = aggregator.recover_orphans().await;
    tracing::info!(recovered, "orphan recovery complete");

    let state = Arc::new(AppState {
        registry: ProviderRegistry::new(clock),
        tenants,
        quota,
        filter,
        aggregator,
        metrics,
        allow_unsigned: cfg.allow_unsigned_webhooks,
    });

    let app = router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
