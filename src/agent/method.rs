//! The contract every auth method satisfies.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::Result;

/// Method configuration as written in the agent config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Method name (`jwt`, `cert`, `token_file`, `polling`, ...)
    #[serde(rename = "type")]
    pub method_type: String,
    /// Mount of the auth backend on the host; defaults to `auth/<type>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Base of the supervisor's retry backoff (default 2s)
    #[serde(
        with = "crate::config::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_backoff: Option<Duration>,
    /// Method-specific options; unknown keys are ignored
    pub config: Map<String, Value>,
}

impl AuthConfig {
    /// Build a config for `method_type` with the given options.
    #[must_use]
    pub fn new(method_type: impl Into<String>, config: Value) -> Self {
        Self {
            method_type: method_type.into(),
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ..Self::default()
        }
    }

    /// Mount path without surrounding slashes.
    #[must_use]
    pub fn mount_path(&self) -> String {
        match &self.mount_path {
            Some(path) if !path.trim_matches('/').is_empty() => path.trim_matches('/').to_string(),
            _ => format!("auth/{}", self.method_type),
        }
    }
}

/// What a method hands the supervisor: where to log in and with what.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    /// Host path, e.g. `auth/jwt/login`
    pub path: String,
    /// Request body
    pub data: Map<String, Value>,
    /// Client certificate to present on the login connection
    pub tls: Option<ClientTls>,
}

impl LoginRequest {
    /// Build a login request; non-object data becomes an empty body.
    #[must_use]
    pub fn new(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            data: match data {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            tls: None,
        }
    }

    /// Present `tls` when logging in.
    #[must_use]
    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// PEM material for a mutual-TLS login, read fresh on every authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientTls {
    /// Certificate chain followed by its private key
    pub identity_pem: Vec<u8>,
    /// Additional root certificate trusted for the host
    pub ca_pem: Option<Vec<u8>>,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("identity_pem", &format_args!("<{} bytes>", self.identity_pem.len()))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .finish()
    }
}

/// A pluggable source of login payloads.
///
/// `authenticate` may block briefly (an HTTP call, a file read) but must not
/// block indefinitely. Methods that rotate credentials out of band hand the
/// supervisor a receiver from `new_creds`; each message means "re-authenticate
/// now".
#[async_trait::async_trait]
pub trait AuthMethod: Send + Sync {
    /// Produce the login path and payload.
    async fn authenticate(&self) -> Result<LoginRequest>;

    /// Take the credential-change signal. Returns `None` for methods that
    /// never rotate, and after the first call.
    fn new_creds(&self) -> Option<mpsc::Receiver<()>>;

    /// Called by the supervisor after the first successful login.
    fn cred_success(&self) {}

    /// Stop every background task the method owns. Idempotent.
    async fn shutdown(&self);
}

/// One-slot "credentials changed" signal.
///
/// At most one notification is pending; extra notifications while one is
/// pending are dropped since they ask for the same thing.
pub struct CredsSignal {
    tx: mpsc::Sender<()>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl CredsSignal {
    /// Create an empty signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// A producer handle for background tasks.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<()> {
        self.tx.clone()
    }

    /// Post a notification. Returns `false` if one was already pending.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    /// Take the consumer end; `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.rx.lock().take()
    }
}

impl Default for CredsSignal {
    fn default() -> Self {
        Self::new()
    }
}
