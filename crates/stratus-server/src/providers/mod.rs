//! Provider gateway: the uniform southbound contract.
//!
//! Every provider speaks four operations over a named zone. The gateway
//! wraps a concrete provider with latency and error metrics; a registry
//! maps provider kinds to factories that parse their own JSON config.
//! Concrete cloud adapters live outside this crate and register factories
//! at startup.

mod http;
mod memory;

pub use http::HttpJsonProvider;
pub use memory::MemoryProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use stratus_common::types::ProviderRecord;
use stratus_common::{Error, Result};

use crate::metrics;

/// Per-operation deadline for provider calls.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// The four-operation provider contract.
///
/// `get_records` may or may not include the SOA; names may be relative or
/// absolute; provider ids may or may not be present. The sync engine
/// normalizes all of that.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the current records of the zone.
    async fn get_records(&self, zone: &str) -> Result<Vec<ProviderRecord>>;

    /// Creates records, returning the created set (possibly with ids).
    async fn append_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>>;

    /// Upserts records by provider id or (name, type).
    async fn set_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>>;

    /// Removes records matched by provider id or (name, type, value).
    async fn delete_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>>;
}

/// A provider factory: parses the opaque JSON config into a provider.
pub type Factory = fn(&str) -> Result<Arc<dyn Provider>>;

/// Registry of provider kinds. Process-wide, filled at startup.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<&'static str, Factory>,
}

impl Registry {
    /// A registry with the built-in provider kinds.
    pub fn builtin() -> Self {
        let mut reg = Registry::default();
        reg.register("memory", memory::factory);
        reg.register("httpjson", http::factory);
        reg
    }

    pub fn register(&mut self, kind: &'static str, factory: Factory) {
        self.factories.insert(kind, factory);
    }

    /// Instantiates the provider for a config, wrapped with metrics.
    pub fn open(&self, name: &str, kind: &str, config: &str) -> Result<Gateway> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            Error::user(format!("unknown provider kind {kind:?}"))
        })?;
        let provider = factory(config)?;
        Ok(Gateway {
            name: name.to_string(),
            provider,
        })
    }
}

/// A provider instance plus the config name it was opened under; wraps
/// every call with a duration histogram and error counter.
#[derive(Clone)]
pub struct Gateway {
    name: String,
    provider: Arc<dyn Provider>,
}

impl Gateway {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn with_metric<F, T>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let res = tokio::time::timeout(PROVIDER_TIMEOUT, call)
            .await
            .map_err(|_| Error::transient(format!("provider {op} timed out")))
            .and_then(|r| r);
        metrics::observe_provider_op(&self.name, op, start.elapsed(), res.is_err());
        res
    }

    pub async fn get_records(&self, zone: &str) -> Result<Vec<ProviderRecord>> {
        let res = self
            .with_metric("get", self.provider.get_records(zone))
            .await;
        debug!(zone, provider = %self.name, ok = res.is_ok(), "provider get records");
        res
    }

    pub async fn append_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        debug!(zone, provider = %self.name, n = records.len(), "provider append records");
        self.with_metric("append", self.provider.append_records(zone, records))
            .await
    }

    pub async fn set_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        debug!(zone, provider = %self.name, n = records.len(), "provider set records");
        self.with_metric("set", self.provider.set_records(zone, records))
            .await
    }

    pub async fn delete_records(
        &self,
        zone: &str,
        records: Vec<ProviderRecord>,
    ) -> Result<Vec<ProviderRecord>> {
        debug!(zone, provider = %self.name, n = records.len(), "provider delete records");
        self.with_metric("delete", self.provider.delete_records(zone, records))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_kind() {
        let reg = Registry::builtin();
        assert!(reg.open("cfg", "nope", "{}").is_err());
        assert!(reg.open("cfg", "memory", "{}").is_ok());
    }

    #[tokio::test]
    async fn gateway_wraps_calls() {
        let reg = Registry::builtin();
        let gw = reg.open("cfg", "memory", "{}").unwrap();
        assert!(gw.get_records("z0.example.").await.unwrap().is_empty());
    }
}
