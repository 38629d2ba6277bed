use crate::client::transport::{TransportSettings, DEFAULT_USER_AGENT};
use crate::error::{FetchError, Result};
use crate::proxy::ban::DEFAULT_BAN_PATTERN;
use crate::proxy::{CoordinatorConfig, RemoteAllocatorConfig};
use crate::repository::LeasePolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Separator between entries of `ROTA_BAN_PATTERNS`
const BAN_PATTERN_SEPARATOR: &str = "||";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote allocator configuration
    pub allocator: AllocatorConfig,
    /// Lease store configuration
    pub store: StoreConfig,
    /// HTTP transport configuration
    pub transport: TransportConfig,
    /// Fetch behaviour
    pub fetch: FetchConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Base URL of the allocator; unset means no allocation is possible
    pub url: Option<String>,
    /// Shared secret, sent as its SHA-1 hex digest
    pub secret: String,
    /// Transport attempts per allocator call
    pub attempts: u32,
    /// Optional newline-delimited user agent list
    pub user_agents_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding `lock/` and `blacklist/` (default: ./data)
    pub data_dir: PathBuf,
    /// Lease lifetime in seconds (default: 30)
    pub lease_ttl_secs: u64,
    /// Treat expired leases as absent on lookup
    pub enforce_lease_ttl: bool,
    /// Blacklist retention in seconds, 0 = permanent
    pub blacklist_retention_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub keep_alive: bool,
    pub verbose: bool,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Name leases are recorded under
    pub service_name: String,
    /// Consecutive no-response attempts tolerated per proxy
    pub no_response_threshold: u32,
    /// Overall deadline in seconds, 0 = unbounded
    pub deadline_secs: u64,
    /// Attempt cap, 0 = unbounded
    pub max_attempts: u32,
    /// Case-insensitive ban page patterns
    pub ban_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            allocator: AllocatorConfig {
                url: parse_allocator_url()?,
                secret: get_env_or("ROTA_ALLOCATOR_SECRET", ""),
                attempts: parse_env("ROTA_ALLOCATOR_ATTEMPTS", 3)?,
                user_agents_file: optional_env("ROTA_USER_AGENTS_FILE").map(PathBuf::from),
            },
            store: StoreConfig {
                data_dir: PathBuf::from(get_env_or("ROTA_DATA_DIR", "./data")),
                lease_ttl_secs: parse_env("ROTA_LEASE_TTL_SECS", 30)?,
                enforce_lease_ttl: parse_bool("ROTA_ENFORCE_LEASE_TTL", true)?,
                blacklist_retention_secs: parse_env("ROTA_BLACKLIST_RETENTION_SECS", 0)?,
            },
            transport: TransportConfig {
                timeout_secs: parse_env("ROTA_TIMEOUT_SECS", 30)?,
                follow_redirects: parse_bool("ROTA_FOLLOW_REDIRECTS", true)?,
                max_redirects: parse_env("ROTA_MAX_REDIRECTS", 10)?,
                keep_alive: parse_bool("ROTA_KEEP_ALIVE", true)?,
                verbose: parse_bool("ROTA_VERBOSE", false)?,
                user_agent: get_env_or("ROTA_USER_AGENT", DEFAULT_USER_AGENT),
                accept_invalid_certs: parse_bool("ROTA_ACCEPT_INVALID_CERTS", false)?,
            },
            fetch: FetchConfig {
                service_name: get_env_or("ROTA_SERVICE_NAME", "default"),
                no_response_threshold: parse_env("ROTA_NO_RESPONSE_THRESHOLD", 2)?,
                deadline_secs: parse_env("ROTA_FETCH_DEADLINE_SECS", 600)?,
                max_attempts: parse_env("ROTA_MAX_ATTEMPTS", 0)?,
                ban_patterns: get_env_or("ROTA_BAN_PATTERNS", DEFAULT_BAN_PATTERN)
                    .split(BAN_PATTERN_SEPARATOR)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Base transport settings, without a proxy
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            proxy: None,
            user_agent: self.transport.user_agent.clone(),
            timeout: Duration::from_secs(self.transport.timeout_secs),
            verbose: self.transport.verbose,
            follow_redirects: self.transport.follow_redirects,
            max_redirects: self.transport.max_redirects,
            keep_alive: self.transport.keep_alive,
            accept_invalid_certs: self.transport.accept_invalid_certs,
        }
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            ttl: chrono::Duration::seconds(self.store.lease_ttl_secs as i64),
            enforce_ttl: self.store.enforce_lease_ttl,
            blacklist_retention: (self.store.blacklist_retention_secs > 0)
                .then(|| chrono::Duration::seconds(self.store.blacklist_retention_secs as i64)),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            service_name: self.fetch.service_name.clone(),
            lease_ttl: chrono::Duration::seconds(self.store.lease_ttl_secs as i64),
            no_response_threshold: self.fetch.no_response_threshold.max(1),
            deadline: (self.fetch.deadline_secs > 0)
                .then(|| Duration::from_secs(self.fetch.deadline_secs)),
            max_attempts: (self.fetch.max_attempts > 0).then_some(self.fetch.max_attempts),
            ..CoordinatorConfig::default()
        }
    }

    /// Allocator client configuration; fails when no allocator URL is set
    pub fn remote_allocator(&self) -> Result<RemoteAllocatorConfig> {
        let base_url = self
            .allocator
            .url
            .clone()
            .ok_or_else(|| FetchError::MissingEnvVar("ROTA_ALLOCATOR_URL".into()))?;
        Ok(RemoteAllocatorConfig {
            base_url,
            secret: self.allocator.secret.clone(),
            attempts: self.allocator.attempts.max(1),
        })
    }
}

fn parse_allocator_url() -> Result<Option<String>> {
    let Some(raw) = optional_env("ROTA_ALLOCATOR_URL") else {
        return Ok(None);
    };

    let url = Url::parse(&raw).map_err(|e| {
        FetchError::InvalidConfig(format!("ROTA_ALLOCATOR_URL must be a valid URL: {}", e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidConfig(format!(
            "ROTA_ALLOCATOR_URL has unsupported scheme: {}",
            url.scheme()
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(FetchError::InvalidConfig(
            "ROTA_ALLOCATOR_URL must not include query/fragment".into(),
        ));
    }

    Ok(Some(raw.trim_end_matches('/').to_string()))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Non-blank environment variable, trimmed
fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match optional_env(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| FetchError::InvalidConfig(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match optional_env(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(FetchError::InvalidConfig(format!(
                "{} must be true or false",
                key
            ))),
        },
    }
}
