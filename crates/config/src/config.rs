//! Configuration structures and parsing for modproxy

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Largest same-backend retry budget accepted by validation.
pub const MAX_SAME_BACKEND_RETRIES: u32 = 5;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream proxying and cache settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Local authoritative module server
    #[serde(default)]
    pub local: LocalConfig,

    /// Checksum database pass-through
    #[serde(default)]
    pub sumdb: SumdbConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Validation(
                "Server has no listen addresses".to_string(),
            ));
        }

        for upstream in &self.proxy.upstreams {
            validate_upstream_url(upstream)?;
        }

        if let Some(proxy) = &self.proxy.outbound_proxy {
            if url::Url::parse(proxy).is_err() {
                return Err(ConfigError::Validation(format!(
                    "Invalid outbound proxy URL: {}",
                    proxy
                )));
            }
        }

        if self.proxy.same_backend_retries > MAX_SAME_BACKEND_RETRIES {
            return Err(ConfigError::Validation(format!(
                "same_backend_retries must be at most {}",
                MAX_SAME_BACKEND_RETRIES
            )));
        }

        let ratio = self.global.tracing.sampling_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Validation(format!(
                "Tracing sampling_ratio must be within [0, 1], got {}",
                ratio
            )));
        }

        Ok(())
    }

    /// True when no upstream is configured and every request is served locally
    pub fn is_direct_only(&self) -> bool {
        self.proxy.upstreams.is_empty()
    }
}

fn validate_upstream_url(raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ConfigError::Validation(format!("Invalid upstream URL {}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::Validation(format!(
                "Upstream {} uses unsupported scheme '{}'",
                raw, other
            )))
        }
    }

    if parsed.host_str().is_none() {
        return Err(ConfigError::Validation(format!(
            "Upstream {} has no host",
            raw
        )));
    }

    Ok(())
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OpenTelemetry tracing configuration
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracing: TracingConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// OpenTelemetry tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Enable OpenTelemetry tracing
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint (e.g., "http://localhost:4317")
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Sampling ratio (0.0 to 1.0, default: 1.0 = sample everything)
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "modproxy".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Addresses to accept client connections on (":8081" binds all interfaces)
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> Vec<String> {
    vec![":8081".to_string()]
}

/// Upstream proxying and on-disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream base URLs in priority order; empty means every request is direct
    #[serde(default)]
    pub upstreams: Vec<String>,

    /// Comma-separated glob patterns of module paths that bypass the upstreams
    #[serde(default)]
    pub exclude: String,

    /// Root directory of the artifact cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Seconds a cached `@latest` or `@v/list` response stays fresh
    #[serde(default = "default_list_expire_secs")]
    pub list_expire_secs: u64,

    /// Delay before retrying a backend after a transport error (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Retries against the same backend before failing over to the next one
    #[serde(default = "default_same_backend_retries")]
    pub same_backend_retries: u32,

    /// Skip TLS certificate verification towards upstreams
    #[serde(default = "default_insecure_skip_verify")]
    pub insecure_skip_verify: bool,

    /// Explicit proxy for the outbound leg; environment proxies are used otherwise
    #[serde(default)]
    pub outbound_proxy: Option<String>,

    /// Timeouts for upstream exchanges
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstreams: Vec::new(),
            exclude: String::new(),
            cache_dir: default_cache_dir(),
            list_expire_secs: default_list_expire_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            same_backend_retries: default_same_backend_retries(),
            insecure_skip_verify: default_insecure_skip_verify(),
            outbound_proxy: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_list_expire_secs() -> u64 {
    300
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_same_backend_retries() -> u32 {
    1
}

fn default_insecure_skip_verify() -> bool {
    true
}

/// Timeout configuration for upstream connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connection timeout in seconds (time to establish TCP connection)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    /// Total time allowed for one upstream exchange in seconds (0 = no limit)
    #[serde(default = "default_read_timeout")]
    pub read: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
        }
    }
}

/// Local authoritative server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding module files laid out like the cache
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
        }
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./modules")
}

/// Checksum database pass-through configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumdbConfig {
    /// Checksum database hosts that may be proxied
    #[serde(default = "default_supported_sumdbs")]
    pub supported: Vec<String>,
}

impl Default for SumdbConfig {
    fn default() -> Self {
        Self {
            supported: default_supported_sumdbs(),
        }
    }
}

fn default_supported_sumdbs() -> Vec<String> {
    vec![
        "sum.golang.org".to_string(),
        "sum.golang.google.cn".to_string(),
    ]
}
