//! [`ClientConfig`]/[`ClientConfigBuilder`]: the full option surface of
//! spec §6's configuration table, in the builder-light style of
//! `examples/Protryon-klickhouse/klickhouse/src/lib.rs`'s `ClientOptions`
//! plain-struct-with-defaults pattern, expanded to a fluent builder
//! grounded in `SpacetimeDBConnectionBuilder`
//! (`examples/original_source/src/spacetimedb_sdk/connection_builder.py`),
//! which is where every numeric default below comes from.

use url::Url;

use crate::compression::CompressionMethod;
use crate::error::{Result, TransportError};
use crate::time::Duration;

/// `text` or `binary` framing, spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Text,
    Binary,
}

/// Compression aggressiveness knob, spec §6's `compression.level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Fastest,
    Balanced,
    Best,
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub level: CompressionLevel,
    pub threshold: usize,
    pub prefer_brotli: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: CompressionLevel::Balanced,
            threshold: crate::compression::DEFAULT_THRESHOLD_BYTES,
            prefer_brotli: false,
        }
    }
}

impl CompressionConfig {
    /// Client-offered algorithm list in preference order, spec §4.2's
    /// negotiation rule ("intersect ... in client preference order").
    pub fn offered_methods(&self) -> Vec<CompressionMethod> {
        if !self.enabled {
            return vec![];
        }
        if self.prefer_brotli {
            vec![CompressionMethod::Brotli, CompressionMethod::Gzip]
        } else {
            vec![CompressionMethod::Gzip, CompressionMethod::Brotli]
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLatency,
    Random,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub health_check_interval: Duration,
    pub lb_strategy: LoadBalancingStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            health_check_interval: Duration::from_secs(30),
            lb_strategy: LoadBalancingStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub auto_start: bool,
    pub max_concurrent_executions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { auto_start: true, max_concurrent_executions: 10 }
    }
}

/// The full recognized option surface at connection construction, spec §6.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub uri: Url,
    pub module_name: String,
    pub token: Option<String>,
    pub protocol: Protocol,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub initial_energy: i64,
    pub max_energy: i64,
    pub energy_budget: Option<i64>,
    pub compression: CompressionConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub auto_trigger_lifecycle: bool,
    pub http_base_url_override: Option<Url>,
}

impl ClientConfig {
    pub fn builder(uri: impl Into<String>, module_name: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(uri, module_name)
    }

    /// Derives the HTTP admin URL from the WebSocket URL by scheme swap
    /// (`ws` -> `http`, `wss` -> `https`), spec §6, unless an override was set.
    pub fn http_base_url(&self) -> Result<Url> {
        if let Some(url) = &self.http_base_url_override {
            return Ok(url.clone());
        }
        let mut url = self.uri.clone();
        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => return Err(TransportError::Unreachable(format!("unsupported scheme {other}")).into()),
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Unreachable("failed to swap scheme".into()))?;
        Ok(url)
    }
}

/// Fluent builder mirroring `SpacetimeDBConnectionBuilder`'s `with_*` chain,
/// but as a value-returning builder rather than a mutate-self one, the
/// idiomatic Rust shape for this pattern.
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    uri: String,
    module_name: String,
    token: Option<String>,
    protocol: Protocol,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    initial_energy: i64,
    max_energy: i64,
    energy_budget: Option<i64>,
    compression: CompressionConfig,
    pool: PoolConfig,
    retry: RetryConfig,
    scheduler: SchedulerConfig,
    auto_trigger_lifecycle: bool,
    http_base_url_override: Option<String>,
}

impl ClientConfigBuilder {
    pub fn new(uri: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            module_name: module_name.into(),
            token: None,
            protocol: Protocol::Binary,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            initial_energy: 100_000,
            max_energy: 1_000_000,
            energy_budget: None,
            compression: CompressionConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            auto_trigger_lifecycle: true,
            http_base_url_override: None,
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool, max_attempts: u32) -> Self {
        self.auto_reconnect = enabled;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn energy_budget(mut self, budget: i64, initial: i64, max_energy: i64) -> Self {
        self.energy_budget = Some(budget);
        self.initial_energy = initial;
        self.max_energy = max_energy;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn auto_trigger_lifecycle(mut self, enabled: bool) -> Self {
        self.auto_trigger_lifecycle = enabled;
        self
    }

    pub fn http_base_url(mut self, url: impl Into<String>) -> Self {
        self.http_base_url_override = Some(url.into());
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        let uri = Url::parse(&self.uri).map_err(|e| TransportError::Unreachable(e.to_string()))?;
        match uri.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::Unreachable(format!("unsupported scheme {other}")).into()),
        }
        let http_base_url_override = self
            .http_base_url_override
            .map(|u| Url::parse(&u).map_err(|e| TransportError::Unreachable(e.to_string())))
            .transpose()?;
        Ok(ClientConfig {
            uri,
            module_name: self.module_name,
            token: self.token,
            protocol: self.protocol,
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            initial_energy: self.initial_energy,
            max_energy: self.max_energy,
            energy_budget: self.energy_budget,
            compression: self.compression,
            pool: self.pool,
            retry: self.retry,
            scheduler: self.scheduler,
            auto_trigger_lifecycle: self.auto_trigger_lifecycle,
            http_base_url_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_url_swaps_scheme() {
        let config = ClientConfig::builder("wss://db.example.com/foo", "my_module").build().unwrap();
        assert_eq!(config.http_base_url().unwrap().scheme(), "https");
    }

    #[test]
    fn ws_scheme_swaps_to_http() {
        let config = ClientConfig::builder("ws://localhost:3000", "my_module").build().unwrap();
        assert_eq!(config.http_base_url().unwrap().scheme(), "http");
    }

    #[test]
    fn explicit_http_base_url_overrides_derivation() {
        let config = ClientConfig::builder("ws://localhost:3000", "my_module")
            .http_base_url("https://admin.example.com")
            .build()
            .unwrap();
        assert_eq!(config.http_base_url().unwrap().as_str(), "https://admin.example.com/");
    }

    #[test]
    fn rejects_non_ws_scheme() {
        assert!(ClientConfig::builder("http://localhost:3000", "my_module").build().is_err());
    }

    #[test]
    fn compression_offers_gzip_before_brotli_by_default() {
        let config = CompressionConfig::default();
        assert_eq!(config.offered_methods(), vec![CompressionMethod::Gzip, CompressionMethod::Brotli]);
    }
}
