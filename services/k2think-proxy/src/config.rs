//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional. The client API key is loaded from the
//! VALID_API_KEY env var or `server.api_key_file`, never from the TOML
//! itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use token_pool::Thresholds;
use translate::PacingConfig;

pub const API_KEY_ENV: &str = "VALID_API_KEY";

const DEFAULT_CONFIG_FILE: &str = "k2think-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub refresh: RefreshConfig,
}

/// Listeners and client authentication
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin endpoints are unauthenticated; keep this on loopback.
    pub admin_listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Browser origins allowed by CORS; `*` allows any.
    pub cors_origins: Vec<String>,
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            admin_listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
            cors_origins: vec!["*".into()],
            api_key_file: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://www.k2think.ai/api/chat/completions".into(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_failures_per_token: u32,
    pub consecutive_failure_threshold: u32,
    pub upstream_error_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = Thresholds::default();
        Self {
            max_failures_per_token: defaults.max_failures_per_token,
            consecutive_failure_threshold: defaults.consecutive_failure_threshold,
            upstream_error_threshold: defaults.upstream_error_threshold,
        }
    }
}

impl PoolConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_failures_per_token: self.max_failures_per_token,
            consecutive_failure_threshold: self.consecutive_failure_threshold,
            upstream_error_threshold: self.upstream_error_threshold,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Simulated-streaming pace
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub delay_ms: u64,
    pub max_duration_secs: f64,
    pub chunk_size: usize,
    pub min_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            delay_ms: 50,
            max_duration_secs: 10.0,
            chunk_size: 50,
            min_chunk_size: 50,
        }
    }
}

impl StreamConfig {
    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            delay: Duration::from_millis(self.delay_ms),
            max_duration: Duration::try_from_secs_f64(self.max_duration_secs)
                .unwrap_or_else(|_| PacingConfig::default().max_duration),
            default_chunk_size: self.chunk_size,
            min_chunk_size: self.min_chunk_size,
        }
    }
}

/// Credential refresh via account sign-in
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub accounts_file: PathBuf,
    pub interval_secs: u64,
    pub max_workers: usize,
    pub signin_url: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            accounts_file: PathBuf::from("accounts.txt"),
            interval_secs: 86_400,
            max_workers: 4,
            signin_url: k2think_auth::constants::SIGNIN_URL.into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then resolve the API key.
    ///
    /// API key resolution order:
    /// 1. VALID_API_KEY env var
    /// 2. `server.api_key_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Same as `load` for a config that lives only in defaults and env vars.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        config.server.api_key = Some(resolve_api_key(config.server.api_key_file.as_deref())?);
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |msg: &str| Err(common::Error::Config(msg.to_string()));

        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream.url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }
        if !self.refresh.signin_url.starts_with("http://")
            && !self.refresh.signin_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "refresh.signin_url must start with http:// or https://, got: {}",
                self.refresh.signin_url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return invalid("upstream.timeout_secs must be greater than 0");
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be greater than 0");
        }
        if self.refresh.max_workers == 0 {
            return invalid("refresh.max_workers must be greater than 0");
        }
        if self.refresh.interval_secs == 0 {
            return invalid("refresh.interval_secs must be greater than 0");
        }
        if self.stream.chunk_size == 0 || self.stream.min_chunk_size == 0 {
            return invalid("stream chunk sizes must be greater than 0");
        }
        // also rejects NaN and anything past Duration::MAX
        match Duration::try_from_secs_f64(self.stream.max_duration_secs) {
            Ok(d) if !d.is_zero() => {}
            _ => return invalid("stream.max_duration_secs must be a positive number of seconds"),
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

fn resolve_api_key(key_file: Option<&Path>) -> common::Result<Secret<String>> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        let key = key.trim().to_owned();
        if !key.is_empty() {
            return Ok(Secret::new(key));
        }
    }
    if let Some(key_file) = key_file {
        let key = std::fs::read_to_string(key_file).map_err(|e| {
            common::Error::Config(format!(
                "failed to read api_key_file {}: {e}",
                key_file.display()
            ))
        })?;
        let key = key.trim().to_owned();
        if !key.is_empty() {
            return Ok(Secret::new(key));
        }
    }
    Err(common::Error::MissingSecret(format!(
        "{API_KEY_ENV} or server.api_key_file"
    )))
}
