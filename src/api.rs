//! Wire types shared by the HTTP host and the agent's client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response envelope for login, renew and lookup calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Lease duration of a data secret (seconds)
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether a data secret is renewable
    #[serde(default)]
    pub renewable: bool,
    /// Response data (reads, lookups)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Auth block (logins, renewals)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SecretAuth>,
    /// Advisory warnings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Secret {
    /// The client token, when the auth block carries a non-empty one.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.auth
            .as_ref()
            .map(|a| a.client_token.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Lease duration of the auth block, in seconds.
    #[must_use]
    pub fn token_ttl(&self) -> u64 {
        self.auth.as_ref().map_or(0, |a| a.lease_duration)
    }

    /// Whether the token can be renewed.
    #[must_use]
    pub fn token_renewable(&self) -> bool {
        self.auth.as_ref().is_some_and(|a| a.renewable)
    }
}

/// Auth block of a [`Secret`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretAuth {
    /// Opaque client token
    pub client_token: String,
    /// Token accessor
    #[serde(default)]
    pub accessor: String,
    /// Granted policies
    #[serde(default)]
    pub policies: Vec<String>,
    /// Token metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Lease duration (seconds)
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the token can be renewed
    #[serde(default)]
    pub renewable: bool,
}

/// Error body returned by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error messages, most relevant first
    pub errors: Vec<String>,
}
