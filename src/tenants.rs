use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::destinations::DestinationConfig;
use crate::models::PlanTier;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// Shared secret for signature verification. Absent means unsigned
    /// deliveries, which are only accepted when the service allows them.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub plan: PlanTier,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_active() -> bool {
    true
}

/// Lookup interface the pipeline consumes. The file-backed implementation
/// below covers single-node deployments; a registry service client would
/// implement the same trait.
pub trait TenantDirectory: Send + Sync {
    fn tenant(&self, tenant_id: &str) -> Option<TenantConfig>;

    fn exists(&self, tenant_id: &str) -> bool {
        self.tenant(tenant_id).is_some()
    }

    fn provider_settings(&self, tenant_id: &str, provider: &str) -> Option<ProviderSettings> {
        self.tenant(tenant_id)
            .and_then(|t| t.providers.get(provider).cloned())
    }
}

#[derive(Debug, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: HashMap<String, TenantConfig>,
}

/// In-memory directory loaded from a TOML file at startup.
#[derive(Default)]
pub struct StaticDirectory {
    tenants: DashMap<String, TenantConfig>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let parsed: TenantsFile = toml::from_str(raw)?;
        let directory = Self::new();
        for (id, config) in parsed.tenants {
            directory.tenants.insert(id, config);
        }
        Ok(directory)
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&raw)?)
    }

    pub fn insert(&self, tenant_id: impl Into<String>, config: TenantConfig) {
        self.tenants.insert(tenant_id.into(), config);
    }

    pub fn remove(&self, tenant_id: &str) {
        self.tenants.remove(tenant_id);
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl TenantDirectory for StaticDirectory {
    fn tenant(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.tenants.get(tenant_id).map(|t| t.clone())
    }
}
