//! Configuration management for Ratewall.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{RatewallError, Result};
use crate::ratelimit::{Allowlist, LimitConfig, DEFAULT_WHITELIST_RANGES};

/// Prefix for environment overrides, e.g. `RATEWALL__RATE_LIMITING__NAMESPACE`.
pub const ENV_PREFIX: &str = "RATEWALL";

/// Main configuration for the Ratewall service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewallConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// What to do with a request when the counter store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through without quota headers
    Open,
    /// Reject the request with 503
    #[default]
    Closed,
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, per instance
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the Redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Upper bound for one store round trip
    #[serde(default = "default_store_timeout", with = "duration_format")]
    pub timeout: Duration,

    /// How often the memory store drops expired windows
    #[serde(default = "default_sweep_interval", with = "duration_format")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            timeout: default_store_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_store_timeout() -> Duration {
    crate::ratelimit::DEFAULT_STORE_TIMEOUT
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix for every identity key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Limit applied to routes without their own
    #[serde(default)]
    pub global: LimitConfig,

    /// Counter store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// CIDR ranges exempted from limiting
    #[serde(
        default = "default_white_list_ip_range",
        alias = "whiteListIpRange",
        alias = "whitelistiprange"
    )]
    pub white_list_ip_range: Vec<String>,

    /// Behaviour when the store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Take the client address from proxy headers such as `X-Forwarded-For`.
    /// Only safe behind a proxy that overwrites them; otherwise the peer
    /// address is used.
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Route path -> route-specific limit
    #[serde(default)]
    pub routes: HashMap<String, LimitConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            global: LimitConfig::default(),
            store: StoreConfig::default(),
            white_list_ip_range: default_white_list_ip_range(),
            failure_policy: FailurePolicy::default(),
            trust_proxy_headers: false,
            routes: HashMap::new(),
        }
    }
}

fn default_namespace() -> String {
    "clhr".to_string()
}

fn default_white_list_ip_range() -> Vec<String> {
    DEFAULT_WHITELIST_RANGES
        .iter()
        .map(|range| range.to_string())
        .collect()
}

impl RateLimitingConfig {
    /// Check the configuration for values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace must not be empty"));
        }

        validate_limit("global", &self.global)?;
        for (route, limit) in &self.routes {
            if !route.starts_with('/') {
                return Err(invalid(format!("route '{}' must start with '/'", route)));
            }
            validate_limit(route, limit)?;
        }

        Allowlist::parse(&self.white_list_ip_range)?;

        if self.store.timeout.is_zero() {
            return Err(invalid("store timeout must be greater than zero"));
        }

        match self.store.backend {
            StoreBackend::Memory if self.store.sweep_interval.is_zero() => {
                Err(invalid("store sweep_interval must be greater than zero"))
            }
            StoreBackend::Redis if self.store.redis_url.is_none() => {
                Err(invalid("redis backend requires store.redis_url"))
            }
            StoreBackend::Redis if !cfg!(feature = "redis") => {
                Err(invalid("redis backend requires the 'redis' feature"))
            }
            _ => Ok(()),
        }
    }
}

fn validate_limit(name: &str, limit: &LimitConfig) -> Result<()> {
    if limit.is_limited() && limit.duration.is_zero() {
        return Err(invalid(format!(
            "{} limit of {} has a zero duration",
            name, limit.limit
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> RatewallError {
    RatewallError::InvalidConfig(msg.into())
}

impl RatewallConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatewallError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from an optional YAML file, overlaid with
    /// `RATEWALL__SECTION__KEY` environment variables.
    ///
    /// Route paths keep the case they have in the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut file = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        // Route paths are not valid key expressions and lose their case in
        // the merged tree, so they bypass it.
        let file_routes = std::mem::take(&mut file.rate_limiting.routes);

        let env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__");

        let mut merged: Self = config::Config::builder()
            .add_source(config::Config::try_from(&file)?)
            .add_source(env.clone())
            .build()?
            .try_deserialize()?;

        let env_routes = config::Config::builder()
            .add_source(env)
            .build()?
            .get_table("rate_limiting.routes")
            .map(|table| table.into_keys().collect::<Vec<_>>())
            .unwrap_or_default();

        merged.rate_limiting.routes = restore_route_keys(
            file_routes,
            merged.rate_limiting.routes,
            &env_routes,
        );

        Ok(merged)
    }
}

/// Rebuild the route table from the file's routes, applying only the entries
/// the environment touched.
fn restore_route_keys(
    mut file_routes: HashMap<String, LimitConfig>,
    mut merged_routes: HashMap<String, LimitConfig>,
    env_routes: &[String],
) -> HashMap<String, LimitConfig> {
    for env_route in env_routes {
        let Some(limit) = merged_routes.remove(env_route) else {
            continue;
        };

        let mut matched = false;
        for (route, existing) in file_routes.iter_mut() {
            if route.to_lowercase() == *env_route {
                *existing = limit;
                matched = true;
            }
        }
        if !matched {
            file_routes.insert(env_route.clone(), limit);
        }
    }
    file_routes
}

/// Serde support for durations written as integer milliseconds or as
/// human-readable spans such as `"1s"` or `"15m"`.
pub mod duration_format {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    /// Serialize as integer milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize from integer milliseconds or a humantime span.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    /// Parse a duration string. Bare digits are milliseconds.
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if let Ok(ms) = text.parse::<u64>() {
            return Ok(Duration::from_millis(ms));
        }
        humantime::parse_duration(text).map_err(|e| format!("invalid duration '{}': {}", text, e))
    }
}
