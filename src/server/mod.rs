//! HTTP host for the proxy backend.

mod lease;
mod router;

pub use lease::{LeaseRecord, LeaseStore, generate_token};
pub use router::{AppState, PeerAddr, create_router};

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{self, BackendSettings, InMemoryStorage, Operation, ProxyBackend, Request};
use crate::config::{BackendSeed, Config};
use crate::{Error, Result};

/// The `serve` host.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a host from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build the backend, seed it, and serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );

        let backend = ProxyBackend::new(
            Arc::new(InMemoryStorage::new()),
            BackendSettings {
                system_default_ttl: server.system_default_ttl,
                system_max_ttl: server.system_max_ttl,
            },
        );
        seed(&backend, &self.config.backend).await?;

        let admin_token = server.resolve_admin_token();
        match (&server.admin_token, &admin_token) {
            (Some(mode), Some(token)) if mode == "auto" => {
                warn!(admin_token = %token, "Generated admin token for this run");
            }
            (_, None) => warn!("No admin token configured - config and role endpoints are disabled"),
            _ => {}
        }

        let cancel = CancellationToken::new();
        let leases = Arc::new(LeaseStore::new());
        let reaper = leases.spawn_reaper(cancel.child_token());
        let state = Arc::new(AppState {
            backend,
            leases,
            mount: server.mount.clone(),
            admin_token,
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        info!(
            host = %server.host,
            port = server.port,
            mount = %server.mount,
            version = env!("CARGO_PKG_VERSION"),
            "Listening"
        );
        info!("  POST http://{addr}/v1/auth/{}/login", server.mount);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        cancel.cancel();
        let _ = reaper.await;
        info!("Server stopped");
        Ok(())
    }
}

/// Write the configured config and roles through the normal write paths.
pub async fn seed(backend: &ProxyBackend, seed: &BackendSeed) -> Result<()> {
    if let Some(config) = &seed.config {
        write_seed(backend, "config", config).await?;
        info!("Seeded backend config");
    }
    for (name, role) in &seed.roles {
        write_seed(backend, &format!("role/{name}"), role).await?;
        info!(role = %name, "Seeded role");
    }
    Ok(())
}

async fn write_seed(backend: &ProxyBackend, path: &str, data: &Value) -> Result<()> {
    let req = Request::new(Operation::Create, path).with_data(data.clone());
    match backend.handle_request(&req).await? {
        backend::Response::Error(message) => Err(Error::Config(format!("backend.{path}: {message}"))),
        backend::Response::Written { warnings } => {
            for warning in warnings {
                warn!(path = %path, warning = %warning, "Seed accepted with warning");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Resolve on Ctrl-C or SIGTERM, then cancel `cancel`.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = cancel.cancelled() => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
