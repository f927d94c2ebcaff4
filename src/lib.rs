//! proxyauth
//!
//! Authentication components for a secrets platform.
//!
//! # Features
//!
//! - **Proxy-header backend**: issues leases to users a trusted reverse proxy
//!   has already authenticated, gated by role allowlists, required headers
//!   and source CIDRs ([`backend`])
//! - **HTTP host**: serves the backend and the token endpoints ([`server`])
//! - **Auto-auth agent**: keeps a token alive from a pluggable auth method and
//!   publishes it to sinks ([`agent`])
//! - **File watcher**: change detection with reconcile sweeps and burst
//!   coalescing ([`watcher`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod api;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod watcher;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}"))),
    }
}
