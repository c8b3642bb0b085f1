// src/env.rs
use dotenv::dotenv;
use std::env;

use crate::config::{default_host, default_password, default_port, default_username, ConnectionConfig};
use crate::rabbitmq::Result;

/// Connection arguments as given by the caller; `None` falls back to the
/// environment, then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
}

impl ConnectionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    /// Resolves against the process environment (after loading `.env`).
    pub fn resolve(self) -> Result<ConnectionConfig> {
        dotenv().ok();
        self.resolve_with(|key| env::var(key).ok())
    }

    /// Resolves against an arbitrary lookup. Empty values count as absent.
    pub fn resolve_with<F>(self, lookup: F) -> Result<ConnectionConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = match self.port {
            Some(port) => port,
            None => match lookup("RABBITMQ_PORT") {
                Some(val) => val.trim().parse()?,
                None => default_port(),
            },
        };

        let config = ConnectionConfig {
            host: self.host.or_else(|| lookup("RABBITMQ_HOST")).unwrap_or_else(default_host),
            port,
            username: self
                .username
                .or_else(|| lookup("RABBITMQ_USERNAME"))
                .unwrap_or_else(default_username),
            password: self
                .password
                .or_else(|| lookup("RABBITMQ_PASSWORD"))
                .unwrap_or_else(default_password),
            vhost: self.vhost.or_else(|| lookup("RABBITMQ_VHOST")),
            ..ConnectionConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl ConnectionConfig {
    /// Everything from `RABBITMQ_*` variables, defaults for the rest.
    pub fn from_env() -> Result<Self> {
        ConnectionArgs::new().resolve()
    }
}
