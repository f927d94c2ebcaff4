//! JWT-from-environment method.
//!
//! Logs in with the JWT found in a configured environment variable. After the
//! first successful login, a 500ms ticker rereads the variable and asks for
//! re-authentication whenever its value changes.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{EnvReader, Options};
use crate::agent::method::{AuthConfig, AuthMethod, CredsSignal, LoginRequest};
use crate::{Error, Result};

/// How often the variable is reread.
pub const JWT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Logs in with a JWT read from an environment variable.
pub struct JwtMethod {
    mount: String,
    role: String,
    env_var: String,
    reader: EnvReader,
    latest: Arc<ArcSwap<String>>,
    bootstrapped: watch::Sender<bool>,
    signal: CredsSignal,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JwtMethod {
    /// Build the method; keys `role` and `env-var` are required. Must be
    /// called inside a tokio runtime.
    pub fn new(config: &AuthConfig, reader: EnvReader) -> Result<Self> {
        let opts = Options::new(config);
        let role = opts.required_string("role")?;
        let env_var = opts.required_string("env-var")?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("jwt method started outside a tokio runtime".to_string()))?;

        let latest = Arc::new(ArcSwap::from_pointee(String::new()));
        let (bootstrapped, gate) = watch::channel(false);
        let signal = CredsSignal::new();
        let stop = CancellationToken::new();

        let task = runtime.spawn(watch_env(
            env_var.clone(),
            Arc::clone(&reader),
            Arc::clone(&latest),
            gate,
            signal.sender(),
            stop.clone(),
        ));

        Ok(Self {
            mount: config.mount_path(),
            role,
            env_var,
            reader,
            latest,
            bootstrapped,
            signal,
            stop,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn watch_env(
    env_var: String,
    reader: EnvReader,
    latest: Arc<ArcSwap<String>>,
    mut gate: watch::Receiver<bool>,
    creds_tx: mpsc::Sender<()>,
    stop: CancellationToken,
) {
    tokio::select! {
        () = stop.cancelled() => return,
        opened = gate.wait_for(|ready| *ready) => {
            if opened.is_err() {
                return;
            }
        }
    }
    debug!(env_var = %env_var, "Watching JWT variable");

    let mut ticker = tokio::time::interval(JWT_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(value) = reader(&env_var).filter(|v| !v.is_empty()) else {
            continue;
        };
        if **latest.load() != value {
            latest.store(Arc::new(value));
            info!(env_var = %env_var, "JWT changed, requesting re-authentication");
            let _ = creds_tx.try_send(());
        }
    }
}

#[async_trait::async_trait]
impl AuthMethod for JwtMethod {
    async fn authenticate(&self) -> Result<LoginRequest> {
        let jwt = (self.reader)(&self.env_var)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Method(format!("environment variable {} is empty", self.env_var)))?;
        self.latest.store(Arc::new(jwt.clone()));
        Ok(LoginRequest::new(
            format!("{}/login", self.mount),
            json!({"role": self.role, "jwt": jwt}),
        ))
    }

    fn new_creds(&self) -> Option<mpsc::Receiver<()>> {
        self.signal.take_receiver()
    }

    fn cred_success(&self) {
        self.bootstrapped.send_replace(true);
    }

    async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
