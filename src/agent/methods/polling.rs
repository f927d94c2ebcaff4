//! Credential-polling method.
//!
//! A background task asks the [`CredentialProvider`] for fresh credentials on
//! every tick. When they differ from the last ones seen, they replace them and
//! the supervisor is told to re-authenticate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EnvReader, Options};
use crate::agent::method::{AuthConfig, AuthMethod, CredsSignal, LoginRequest};
use crate::{Error, Result};

/// Poll interval when `credential_poll_interval` is not set.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of the credentials a polling method logs in with.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// One credential record. Compared structurally between polls.
    type Credentials: Clone + PartialEq + Send + Sync + fmt::Debug + 'static;

    /// Fetch the current credentials.
    async fn retrieve(&self) -> Result<Self::Credentials>;

    /// Login fields derived from `creds`.
    fn login_data(&self, creds: &Self::Credentials) -> Map<String, Value>;
}

/// Reads credentials from a fixed set of environment variables.
pub struct EnvCredentialProvider {
    vars: Vec<String>,
    reader: EnvReader,
}

impl EnvCredentialProvider {
    /// Provider over `vars`, read through `reader`.
    #[must_use]
    pub fn new(vars: Vec<String>, reader: EnvReader) -> Self {
        Self { vars, reader }
    }

    /// Provider over the `credential_env_vars` option.
    pub fn from_config(config: &AuthConfig, reader: EnvReader) -> Result<Self> {
        let vars = Options::new(config).string_list("credential_env_vars")?;
        if vars.is_empty() {
            return Err(Error::Config(format!(
                "{}: 'credential_env_vars' is required",
                config.method_type
            )));
        }
        Ok(Self::new(vars, reader))
    }
}

#[async_trait::async_trait]
impl CredentialProvider for EnvCredentialProvider {
    type Credentials = BTreeMap<String, String>;

    async fn retrieve(&self) -> Result<Self::Credentials> {
        self.vars
            .iter()
            .map(|var| match (self.reader)(var) {
                Some(value) if !value.is_empty() => Ok((var.to_ascii_lowercase(), value)),
                _ => Err(Error::Method(format!("credential variable {var} is not set"))),
            })
            .collect()
    }

    fn login_data(&self, creds: &Self::Credentials) -> Map<String, Value> {
        creds
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }
}

struct Shared<P: CredentialProvider> {
    provider: P,
    last_creds: Mutex<Option<P::Credentials>>,
}

impl<P: CredentialProvider> Shared<P> {
    /// Record `creds`; returns `true` when they replaced different ones.
    fn observe(&self, creds: P::Credentials) -> bool {
        let mut last = self.last_creds.lock();
        match last.as_ref() {
            Some(previous) if *previous == creds => false,
            Some(_) => {
                *last = Some(creds);
                true
            }
            None => {
                *last = Some(creds);
                false
            }
        }
    }
}

/// Polls a [`CredentialProvider`] and logs in with its latest credentials.
pub struct PollingMethod<P: CredentialProvider> {
    shared: Arc<Shared<P>>,
    mount: String,
    role: String,
    login_type: Option<String>,
    signal: CredsSignal,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: CredentialProvider> PollingMethod<P> {
    /// Build the method and start polling. Must be called inside a tokio runtime.
    pub fn new(config: &AuthConfig, provider: P) -> Result<Self> {
        let opts = Options::new(config);
        let role = opts.required_string("role")?;
        let login_type = opts.string("type")?;
        let mut interval = opts
            .duration("credential_poll_interval")?
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        if interval < MIN_POLL_INTERVAL {
            warn!(interval = ?interval, "credential_poll_interval below 1s, using 1s");
            interval = MIN_POLL_INTERVAL;
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("polling method started outside a tokio runtime".to_string()))?;

        let shared = Arc::new(Shared {
            provider,
            last_creds: Mutex::new(None),
        });
        let signal = CredsSignal::new();
        let stop = CancellationToken::new();
        let task = runtime.spawn(poll_loop(
            Arc::clone(&shared),
            interval,
            signal.sender(),
            stop.clone(),
        ));

        Ok(Self {
            shared,
            mount: config.mount_path(),
            role,
            login_type,
            signal,
            stop,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn poll_loop<P: CredentialProvider>(
    shared: Arc<Shared<P>>,
    interval: Duration,
    creds_tx: mpsc::Sender<()>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let retrieved = tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => tokio::select! {
                () = stop.cancelled() => break,
                retrieved = shared.provider.retrieve() => retrieved,
            },
        };

        match retrieved {
            Ok(creds) => {
                if shared.observe(creds) {
                    info!("Credentials changed, requesting re-authentication");
                    let _ = creds_tx.try_send(());
                } else {
                    debug!("Credentials unchanged");
                }
            }
            Err(e) => warn!(error = %e, "Failed to poll credentials, keeping previous ones"),
        }
    }
    debug!("Credential poller stopped");
}

#[async_trait::async_trait]
impl<P: CredentialProvider> AuthMethod for PollingMethod<P> {
    async fn authenticate(&self) -> Result<LoginRequest> {
        let known = self.shared.last_creds.lock().clone();
        let creds = match known {
            Some(creds) => creds,
            None => {
                let creds = self.shared.provider.retrieve().await?;
                self.shared.observe(creds.clone());
                creds
            }
        };

        let mut data = self.shared.provider.login_data(&creds);
        data.insert("role".to_string(), json!(self.role));
        if let Some(login_type) = &self.login_type {
            data.insert("type".to_string(), json!(login_type));
        }
        Ok(LoginRequest::new(format!("{}/login", self.mount), Value::Object(data)))
    }

    fn new_creds(&self) -> Option<mpsc::Receiver<()>> {
        self.signal.take_receiver()
    }

    async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
