//! Connection-string based backend selection.
//!
//! # Purpose
//! A [`DriverRegistry`] maps URL schemes (`mem`, `mongo`, `postgres`) to
//! [`DriverFactory`] implementations. Nothing registers itself: callers build
//! a registry explicitly, usually via [`DriverRegistry::with_default_drivers`],
//! and may install it once as the process-wide registry.
//!
//! # Key invariants
//! - Scheme lookup is case-insensitive (URLs normalize schemes to lowercase).
//! - Registering a scheme twice replaces the earlier factory.
use crate::backends::memory::MemoryDriver;
use crate::backends::mongo::MongoDriver;
use crate::backends::postgres::PostgresDriver;
use crate::config::PolicyStoreConfig;
use crate::errors::{PolicyStoreError, PolicyStoreResult};
use crate::gateway::RuleGateway;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use url::Url;

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

/// Opens a gateway for a parsed connection URL.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self, url: &Url) -> PolicyStoreResult<Arc<dyn RuleGateway>>;
}

#[async_trait]
impl DriverFactory for MemoryDriver {
    async fn open(&self, url: &Url) -> PolicyStoreResult<Arc<dyn RuleGateway>> {
        Ok(Arc::new(MemoryDriver::open(self, url)?))
    }
}

#[async_trait]
impl DriverFactory for MongoDriver {
    async fn open(&self, url: &Url) -> PolicyStoreResult<Arc<dyn RuleGateway>> {
        Ok(Arc::new(MongoDriver::open(self, url).await?))
    }
}

#[async_trait]
impl DriverFactory for PostgresDriver {
    async fn open(&self, url: &Url) -> PolicyStoreResult<Arc<dyn RuleGateway>> {
        Ok(Arc::new(PostgresDriver::open(self, url.as_str()).await?))
    }
}

#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the `mem` scheme.
    pub fn with_memory_driver() -> Self {
        let mut registry = Self::new();
        registry.register("mem", Arc::new(MemoryDriver::new()));
        registry
    }

    /// `mem`, `mongo`, `postgres` and `postgresql`, configured from `config`.
    pub fn with_default_drivers(config: &PolicyStoreConfig) -> Self {
        let mut registry = Self::with_memory_driver();
        registry.register(
            "mongo",
            Arc::new(MongoDriver::new(config.mongo_server_url.clone())),
        );
        let postgres: Arc<dyn DriverFactory> =
            Arc::new(PostgresDriver::new(config.postgres.clone()));
        registry.register("postgres", postgres.clone());
        registry.register("postgresql", postgres);
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: Arc<dyn DriverFactory>) {
        self.drivers.insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Open the gateway named by `url`.
    ///
    /// # Errors
    /// - [`PolicyStoreError::InvalidUrl`] when `url` does not parse.
    /// - [`PolicyStoreError::UnknownScheme`] when no driver claims its scheme.
    pub async fn resolve(&self, url: &str) -> PolicyStoreResult<Arc<dyn RuleGateway>> {
        let parsed = Url::parse(url).map_err(|err| PolicyStoreError::InvalidUrl(err.to_string()))?;
        let factory = self
            .drivers
            .get(parsed.scheme())
            .ok_or_else(|| PolicyStoreError::UnknownScheme(parsed.scheme().to_string()))?;
        factory.open(&parsed).await
    }

    /// Install `registry` as the process-wide registry. Returns `false` if one
    /// was already installed; the existing registry is kept.
    pub fn install(registry: DriverRegistry) -> bool {
        GLOBAL_REGISTRY.set(registry).is_ok()
    }

    pub fn global() -> Option<&'static DriverRegistry> {
        GLOBAL_REGISTRY.get()
    }
}
