//! Tracing setup shared by both binaries.
//!
//! The structured logger itself is an external collaborator per spec §1 —
//! call sites throughout the crate just use `tracing::{debug,info,warn,error}!`
//! the way `certificate_manager.rs` and `proxy_server.rs` already do in the
//! teacher. This module only owns turning `Config.logger.level` into a
//! subscriber.

use crate::config::LogLevel;
use tracing_subscriber::EnvFilter;

pub fn init(level: LogLevel) {
    let level = match level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Trace => tracing::Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
