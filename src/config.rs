//! Worker configuration.
//!
//! Loaded from a TOML file with `${ENV_VAR}` substitution, so deployment
//! secrets stay out of the file. Every field has a default; a missing file
//! is not an error.
//!
//! # Example
//!
//! ```toml
//! [service]
//! name = "books-service"
//!
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::RetryPolicy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dlq: DlqConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "shelfstream".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConsumerConfig {
    /// Consumer group; defaults to `<service name>-group`
    #[serde(default)]
    pub group: Option<String>,

    /// Consumer name within the group; defaults to the hostname, then to a
    /// generated id. Keeping it stable across restarts lets the worker
    /// reclaim its own pending messages.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_stream")]
    pub stream: String,

    #[serde(default = "default_dlq_max_len")]
    pub max_len: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            stream: default_dlq_stream(),
            max_len: default_dlq_max_len(),
        }
    }
}

fn default_dlq_stream() -> String {
    crate::dlq::DEFAULT_DLQ_STREAM.to_string()
}

fn default_dlq_max_len() -> usize {
    crate::dlq::DEFAULT_DLQ_MAX_LEN
}

impl SyncConfig {
    /// Load from `SHELFSTREAM_CONFIG` or the default path. A missing file
    /// yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            env::var("SHELFSTREAM_CONFIG").unwrap_or_else(|_| "config/shelfstream.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");
        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            service = %config.service.name,
            consumer_group = %config.consumer_group(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::Validation(format!(
                "redis url must start with redis:// or rediss://, got '{}'",
                self.redis.url
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "service.name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Consumer group for this service's workers.
    pub fn consumer_group(&self) -> String {
        self.consumer
            .group
            .clone()
            .unwrap_or_else(|| format!("{}-group", self.service.name))
    }

    /// Stable consumer name within the group.
    pub fn consumer_name(&self) -> String {
        if let Some(name) = &self.consumer.name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("worker-{name}");
            }
        }

        format!("worker-{}", uuid::Uuid::new_v4())
    }

    /// Dispatch retry schedule from the configured bounds.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

/// Substitute environment variables written as `${VAR_NAME}`. Unset
/// variables keep the placeholder so validation can flag them.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
