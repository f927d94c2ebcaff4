//! Proxy-header credential backend.
//!
//! Converts a request that a trusted reverse proxy has already authenticated
//! into a lease-bearing session. The proxy injects the authenticated user in a
//! configurable header; the backend matches that user against a role's glob
//! allowlist, checks required headers and the caller's source address, and
//! returns a [`LeaseAuth`].
//!
//! # Paths
//!
//! | Path | Operations | Notes |
//! |------|------------|-------|
//! | `config` | read / create / update / delete / exists | Singleton |
//! | `role/` | list | Role names, sorted |
//! | `role/<name>` | read / create / update / delete / exists | `<name>` lower-cased |
//! | `login` | update / alias-lookahead / renew | Unauthenticated |
//!
//! # Outcomes
//!
//! Every operation returns `Result<Response>`:
//!
//! - `Ok(Response::Error(..))` is a validation failure the host reports to
//!   the client (4xx);
//! - `Err(Error::Fatal | Error::Storage)` is an environment failure the host
//!   logs and hides behind an opaque 5xx;
//! - anything else is a success.

pub mod audit;
pub mod authorize;
mod fields;
pub mod path_config;
pub mod path_login;
pub mod path_role;
pub mod storage;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

pub use authorize::{Decision, authorize};
pub use path_config::ProxyConfig;
pub use path_role::Role;
pub use storage::{InMemoryStorage, Storage};

/// Operation kind carried by a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Read an entry
    Read,
    /// Create an entry that does not exist yet
    Create,
    /// Update an existing entry (login uses this too)
    Update,
    /// Delete an entry
    Delete,
    /// List keys under a prefix
    List,
    /// Resolve the identity alias without authorizing
    AliasLookahead,
    /// Renew an issued lease
    Renew,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::AliasLookahead => "alias-lookahead",
            Self::Renew => "renew",
        };
        f.write_str(s)
    }
}

/// Connection details of the caller, as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Peer address, either `ip` or `ip:port`
    pub remote_addr: String,
}

/// A request routed to the backend by the host.
#[derive(Debug, Clone)]
pub struct Request {
    /// Operation kind
    pub operation: Operation,
    /// Path relative to the backend mount (`login`, `role/dev`, ...)
    pub path: String,
    /// Input fields
    pub data: Map<String, Value>,
    /// Request headers, `name → values`. `None` when the host did not pass them.
    pub headers: Option<HashMap<String, Vec<String>>>,
    /// Caller connection info
    pub connection: Option<Connection>,
    /// The lease being renewed (renew only)
    pub auth: Option<LeaseAuth>,
}

impl Request {
    /// Build a request with no data, headers or connection info.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            headers: None,
            connection: None,
            auth: None,
        }
    }

    /// Attach input data; non-object values are ignored.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        if let Value::Object(map) = data {
            self.data = map;
        }
        self
    }

    /// Attach a header map.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, Vec<String>>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Attach one header value, creating the header map if needed.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Attach caller connection info.
    #[must_use]
    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.connection = Some(Connection {
            remote_addr: remote_addr.into(),
        });
        self
    }

    /// Attach the lease being renewed.
    #[must_use]
    pub fn with_auth(mut self, auth: LeaseAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

/// Identity alias attached to a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// Authenticated username
    pub name: String,
    /// `{role}`
    pub metadata: BTreeMap<String, String>,
}

/// Lease bundle returned from a successful login or renewal.
///
/// Durations are in seconds; zero means "use the host default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAuth {
    /// Display name (the username)
    pub display_name: String,
    /// Normalized policies granted by the role
    pub policies: Vec<String>,
    /// Lease TTL
    pub ttl: u64,
    /// Lease max TTL
    pub max_ttl: u64,
    /// Periodic TTL; when non-zero every renewal resets the TTL to this value
    pub period: u64,
    /// Always `true` for proxy leases
    pub renewable: bool,
    /// Identity alias
    pub alias: Alias,
    /// `{username, role}`; renewal reads the identity back from here
    pub metadata: BTreeMap<String, String>,
    /// Source networks the lease stays bound to (inherited from the backend config)
    #[serde(default)]
    pub bound_cidrs: Vec<IpNet>,
}

/// Backend response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Login or renewal succeeded
    Auth(Box<LeaseAuth>),
    /// Alias lookahead result
    Alias(Alias),
    /// Read result
    Data(Value),
    /// List result
    List(Vec<String>),
    /// Write or delete succeeded, possibly with advisory warnings
    Written {
        /// Advisory warnings (accepted but unusual values)
        warnings: Vec<String>,
    },
    /// Read of an absent entry
    NotFound,
    /// Validation failure reported to the client
    Error(String),
}

impl Response {
    /// Successful write without warnings.
    #[must_use]
    pub fn written() -> Self {
        Self::Written {
            warnings: Vec::new(),
        }
    }

    /// Validation failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Returns `true` for validation failures.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The validation message, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Limits inherited from the host; used only for advisory warnings.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    /// Host default lease TTL
    pub system_default_ttl: Duration,
    /// Host maximum lease TTL
    pub system_max_ttl: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            system_default_ttl: Duration::from_secs(768 * 3600),
            system_max_ttl: Duration::from_secs(768 * 3600),
        }
    }
}

/// The proxy-header credential backend.
///
/// Stateless between requests: everything persistent lives in the
/// [`Storage`] the host provides.
pub struct ProxyBackend {
    storage: Arc<dyn Storage>,
    settings: BackendSettings,
}

impl ProxyBackend {
    /// Create a backend over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, settings: BackendSettings) -> Self {
        Self { storage, settings }
    }

    /// Host limits this backend was created with.
    #[must_use]
    pub fn settings(&self) -> BackendSettings {
        self.settings
    }

    /// Route a request to its path handler.
    pub async fn handle_request(&self, req: &Request) -> Result<Response> {
        let path = req.path.trim_matches('/');
        match (path, req.operation) {
            ("config", Operation::Read) => self.read_config().await,
            ("config", Operation::Create | Operation::Update) => self.write_config(req).await,
            ("config", Operation::Delete) => self.delete_config().await,
            ("role", Operation::List) => self.list_roles().await,
            ("login", Operation::Update) => self.login(req).await,
            ("login", Operation::AliasLookahead) => self.alias_lookahead(req).await,
            ("login", Operation::Renew) => self.renew(req).await,
            (p, op) if p.starts_with("role/") => {
                let name = p.trim_start_matches("role/").to_lowercase();
                if name.is_empty() || name.contains('/') {
                    return Ok(Response::error(format!("invalid role name {name:?}")));
                }
                match op {
                    Operation::Read => self.read_role(&name).await,
                    Operation::Create | Operation::Update => self.write_role(&name, req).await,
                    Operation::Delete => self.delete_role(&name).await,
                    _ => Ok(unsupported(p, op)),
                }
            }
            (p, op) => Ok(unsupported(p, op)),
        }
    }

    /// Existence check used by the host to pick create vs update.
    pub async fn exists(&self, req: &Request) -> Result<bool> {
        let path = req.path.trim_matches('/');
        if path == "config" {
            return Ok(self.load_config().await?.is_some());
        }
        if let Some(name) = path.strip_prefix("role/") {
            return Ok(self.load_role(&name.to_lowercase()).await?.is_some());
        }
        Ok(false)
    }
}

fn unsupported(path: &str, op: Operation) -> Response {
    Response::error(format!("unsupported operation {op} on path {path:?}"))
}
