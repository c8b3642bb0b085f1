// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::rabbitmq::RabbitMQError;

/// Delay schedule between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { step_ms: u64, max_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { step_ms, max_ms } => step_ms.saturating_mul(attempt as u64).min(max_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 2u64.saturating_pow(attempt - 1);
                initial_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Bounded or unbounded sequence of attempts separated by a backoff delay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Fraction of the delay randomly added or removed (0.15 = ±15%)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::infinite(Backoff::Exponential {
            initial_ms: 1_000,
            max_ms: 32_000,
        })
    }
}

impl RetryPolicy {
    pub fn infinite(backoff: Backoff) -> Self {
        Self {
            max_attempts: None,
            backoff,
            jitter: 0.0,
        }
    }

    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
            jitter: 0.0,
        }
    }

    /// Policy used by `send`: six attempts, 500ms linear steps capped at 2s.
    pub fn publish_default() -> Self {
        Self::bounded(
            6,
            Backoff::Linear {
                step_ms: 500,
                max_ms: 2_000,
            },
        )
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// True once `attempts` attempts have been made and no more are allowed.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Delay after the `attempt`-th failure, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let base = delay.as_millis() as f64;
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter * base;
        Duration::from_millis((base + spread).max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub vhost: Option<String>,
    /// Shown in the broker management UI
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_confirm_delivery")]
    pub confirm_delivery: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "RetryPolicy::publish_default")]
    pub publish_retry: RetryPolicy,
    /// Upper bound for joining a consumer task or the monitor during teardown
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

// Default values
pub(crate) fn default_host() -> String { "localhost".to_string() }
pub(crate) fn default_port() -> u16 { 5672 }
pub(crate) fn default_username() -> String { "guest".to_string() }
pub(crate) fn default_password() -> String { "guest".to_string() }
fn default_heartbeat() -> u16 { 30 }
fn default_timeout() -> u64 { 5000 }
fn default_confirm_delivery() -> bool { true }
fn default_join_timeout() -> u64 { 5000 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            vhost: None,
            connection_name: None,
            heartbeat_seconds: default_heartbeat(),
            connection_timeout_ms: default_timeout(),
            confirm_delivery: default_confirm_delivery(),
            retry: RetryPolicy::default(),
            publish_retry: RetryPolicy::publish_default(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_confirm_delivery(mut self, confirm: bool) -> Self {
        self.confirm_delivery = confirm;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_publish_retry(mut self, retry: RetryPolicy) -> Self {
        self.publish_retry = retry;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn vhost(&self) -> &str {
        self.vhost.as_deref().unwrap_or("/")
    }

    pub fn connection_name(&self) -> String {
        self.connection_name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", env!("CARGO_PKG_NAME"), std::process::id()))
    }

    /// Broker address for log lines; never includes the password.
    pub fn display_uri(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.vhost().trim_start_matches('/')
        )
    }

    pub fn validate(&self) -> Result<(), RabbitMQError> {
        if self.host.trim().is_empty() {
            return Err(RabbitMQError::Config("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RabbitMQError::Config("port cannot be 0".to_string()));
        }
        if self.join_timeout_ms == 0 {
            return Err(RabbitMQError::Config("join_timeout_ms cannot be 0".to_string()));
        }
        Ok(())
    }

    /// Load a JSON configuration file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;

        let config: ConnectionConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON")?;

        config
            .validate()
            .map_err(|e| anyhow!("Configuration error in {}: {}", path.display(), e))?;

        Ok(config)
    }
}

/// Looks for `rabbitmq.json` in the working directory, `config/`, then `~/.rabbitmq.json`.
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rabbitmq.json")),
        ("Config directory", Path::new("config/rabbitmq.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbitmq.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find rabbitmq.json in the current directory, config/, or the home directory"
    ))
}
