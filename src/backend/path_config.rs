//! `config`: the backend-wide singleton.
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `user_header` | Header the proxy puts the authenticated user in (canonicalized) |
//! | `bound_cidrs` | Networks logins must come from; inherited by every lease |

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::json;

use proxyauth_core::canonical_header_key;

use super::audit::{self, AuditEvent};
use super::storage::{get_json, put_json};
use super::{Operation, ProxyBackend, Request, Response, fields};
use crate::Result;

/// Storage key of the singleton config.
pub const CONFIG_KEY: &str = "config";

/// Backend-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Canonical name of the header carrying the authenticated user
    pub user_header: String,
    /// Allowed source networks, in write order
    #[serde(default)]
    pub bound_cidrs: Vec<IpNet>,
}

impl ProxyConfig {
    /// Public representation returned by reads.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        let cidrs: Vec<String> = self.bound_cidrs.iter().map(ToString::to_string).collect();
        json!({
            "user_header": self.user_header,
            "bound_cidrs": cidrs,
        })
    }
}

/// Parse CIDR strings, failing on the first one that does not parse.
///
/// A bare address is accepted as a single-host network.
pub(crate) fn parse_cidrs(items: &[String]) -> std::result::Result<Vec<IpNet>, String> {
    items
        .iter()
        .map(|raw| {
            raw.parse::<IpNet>()
                .or_else(|_| raw.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| format!("invalid CIDR block {raw:?}"))
        })
        .collect()
}

impl ProxyBackend {
    /// Load the stored config, if any.
    pub async fn load_config(&self) -> Result<Option<ProxyConfig>> {
        get_json(self.storage.as_ref(), CONFIG_KEY).await
    }

    pub(super) async fn read_config(&self) -> Result<Response> {
        Ok(match self.load_config().await? {
            Some(config) => Response::Data(config.to_value()),
            None => Response::NotFound,
        })
    }

    /// Create replaces any stored config; update merges over it.
    pub(super) async fn write_config(&self, req: &Request) -> Result<Response> {
        let existing = match req.operation {
            Operation::Update => self.load_config().await?,
            _ => None,
        };

        let user_header = match fields::string(&req.data, "user_header") {
            Ok(Some(h)) => canonical_header_key(h.trim()),
            Ok(None) => existing
                .as_ref()
                .map(|c| c.user_header.clone())
                .unwrap_or_default(),
            Err(e) => return Ok(Response::error(e)),
        };
        if user_header.is_empty() {
            return Ok(Response::error("user_header must be set"));
        }

        let bound_cidrs = match fields::string_list(&req.data, "bound_cidrs") {
            Ok(Some(raw)) => match parse_cidrs(&raw) {
                Ok(cidrs) => cidrs,
                Err(e) => return Ok(Response::error(e)),
            },
            Ok(None) => existing.map(|c| c.bound_cidrs).unwrap_or_default(),
            Err(e) => return Ok(Response::error(e)),
        };

        let config = ProxyConfig {
            user_header,
            bound_cidrs,
        };
        put_json(self.storage.as_ref(), CONFIG_KEY, &config).await?;
        audit::emit(&AuditEvent::config_written(&config));
        Ok(Response::written())
    }

    pub(super) async fn delete_config(&self) -> Result<Response> {
        self.storage.delete(CONFIG_KEY).await?;
        Ok(Response::written())
    }
}
