//! Configuration loading for both binaries.
//!
//! YAML on disk, `${VAR}`-style environment expansion on every string field
//! before parsing — mirrors the original Go implementation's `viper` +
//! `mapstructure.DecodeHookFuncKind` env-expansion hook (see
//! `examples/original_source/pkg/config/config.go`), minus the
//! `.env`-file loading, which is an operator convenience this crate leaves
//! to the shell.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub proxy: ProxyConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
    pub port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub ssl: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub addr: String,
    pub port: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Trace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    pub level: LogLevel,
}

impl DatabaseConfig {
    /// Postgres connection string, mirroring the `fmt.Sprintf` key=value
    /// DSN built in `postgres.go`.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} dbname={} password={} sslmode={}",
            self.host, self.port, self.user, self.name, self.password, self.ssl
        )
    }
}

impl Config {
    /// Load configuration from a YAML file, expanding `${VAR}` references
    /// in every string value against the current environment before
    /// deserializing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let expanded = shellexpand::env(&raw)
            .context("failed to expand environment variables in config")?
            .into_owned();
        let config: Config = serde_yaml::from_str(&expanded).context("failed to parse config")?;
        Ok(config)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.addr, self.server.port)
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.addr, self.proxy.port)
    }
}
