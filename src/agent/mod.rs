//! Auto-auth agent.
//!
//! One [`AuthMethod`] produces login payloads, the [`AuthHandler`] turns them
//! into tokens and keeps them renewed, and the sinks publish every new token.

pub mod client;
pub mod handler;
pub mod method;
pub mod methods;
pub mod renewer;
pub mod sink;

pub use client::{Host, HostClient};
pub use handler::AuthHandler;
pub use method::{AuthConfig, AuthMethod, ClientTls, CredsSignal, LoginRequest};
pub use renewer::{LifetimeWatcher, RenewOutput, RenewerHandle, TokenRenewer};
pub use sink::{FileSink, Sink, SinkConfig};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::AgentConfig;

/// Run the agent until `cancel` fires, or until the first token is published
/// when `exit_after_auth` is set.
pub async fn run(config: &AgentConfig, cancel: CancellationToken) -> Result<()> {
    let sinks = sink::build_sinks(&config.auto_auth.sinks)?;
    if sinks.is_empty() {
        warn!("No sinks configured, tokens will be discarded");
    }
    let host = HostClient::new(&config.vault.address)?;
    let method_config = &config.auto_auth.method;
    let method = methods::build(method_config)?;

    info!(
        method = %method_config.method_type,
        mount = %method_config.mount_path(),
        address = %config.vault.address,
        "Starting agent"
    );

    let handler_cancel = cancel.child_token();
    let (handler, tokens) = AuthHandler::new(Arc::new(host), method_config.min_backoff);
    let handler_task = tokio::spawn(handler.run(Arc::clone(&method), handler_cancel.clone()));

    let result = sink::run_sinks(tokens, sinks, cancel.clone(), config.exit_after_auth).await;

    handler_cancel.cancel();
    if let Err(e) = handler_task.await {
        warn!(error = %e, "Auth handler task failed");
    }
    method.shutdown().await;
    info!("Agent stopped");
    result
}
