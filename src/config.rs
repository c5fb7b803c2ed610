use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// TOML file holding tenant plans, secrets, and destinations.
    pub tenants_file: String,

    /// Accept deliveries for integrations with no signing secret.
    pub allow_unsigned_webhooks: bool,

    /// Seconds to wait for correlated events before flushing a buffer.
    pub aggregation_delay_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse()?,

            tenants_file: env::var("TENANTS_FILE").unwrap_or_else(|_| "tenants.toml".to_string()),

            allow_unsigned_webhooks: env::var("ALLOW_UNSIGNED_WEBHOOKS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            aggregation_delay_secs: env::var("AGGREGATION_DELAY_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
        })
    }
}
