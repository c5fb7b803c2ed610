pub mod aggregator;
pub mod breaker;
pub mod config;
pub mod consolidation;
pub mod destinations;
pub mod error;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod providers;
pub mod quota;
pub mod routes;
pub mod store;
pub mod tenants;
