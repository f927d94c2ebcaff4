//! Audit logging for backend lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized record in
//! a single `audit` field, so log aggregators can parse it without knowing
//! the event shape up front.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `login.issued` | A login produced a lease |
//! | `login.denied` | A login was refused with a validation error |
//! | `login.renewed` | A lease renewal passed re-authorization |
//! | `renew.denied` | A renewal was refused |
//! | `role.written` | A role was created or updated |
//! | `role.deleted` | A role was deleted |
//! | `config.written` | The backend config was written |

use serde::Serialize;

use super::{LeaseAuth, ProxyConfig, Role};

/// Structured audit record.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g. `"login.issued"`).
    pub event: &'static str,
    /// Role involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Authenticated username, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Caller address, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// Policies granted (issued/renewed/written).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<String>>,
    /// Reason for a denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            role: None,
            username: None,
            remote_addr: None,
            policies: None,
            reason: None,
        }
    }

    /// `login.issued`
    #[must_use]
    pub fn issued(auth: &LeaseAuth, remote_addr: Option<&str>) -> Self {
        Self {
            role: auth.metadata.get("role").cloned(),
            username: Some(auth.display_name.clone()),
            remote_addr: remote_addr.map(ToString::to_string),
            policies: Some(auth.policies.clone()),
            ..Self::bare("login.issued")
        }
    }

    /// `login.denied`
    #[must_use]
    pub fn denied(
        role: &str,
        username: Option<&str>,
        remote_addr: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            role: Some(role.to_string()),
            username: username.map(ToString::to_string),
            remote_addr: remote_addr.map(ToString::to_string),
            reason: Some(reason.into()),
            ..Self::bare("login.denied")
        }
    }

    /// `login.renewed`
    #[must_use]
    pub fn renewed(auth: &LeaseAuth) -> Self {
        Self {
            event: "login.renewed",
            ..Self::issued(auth, None)
        }
    }

    /// `renew.denied`
    #[must_use]
    pub fn renew_denied(role: &str, username: &str, reason: impl Into<String>) -> Self {
        Self {
            event: "renew.denied",
            ..Self::denied(role, Some(username), None, reason)
        }
    }

    /// `role.written`
    #[must_use]
    pub fn role_written(name: &str, role: &Role) -> Self {
        Self {
            role: Some(name.to_string()),
            policies: Some(role.policies.clone()),
            ..Self::bare("role.written")
        }
    }

    /// `role.deleted`
    #[must_use]
    pub fn role_deleted(name: &str) -> Self {
        Self {
            role: Some(name.to_string()),
            ..Self::bare("role.deleted")
        }
    }

    /// `config.written`
    #[must_use]
    pub fn config_written(config: &ProxyConfig) -> Self {
        Self {
            reason: Some(format!(
                "user_header={} bound_cidrs={}",
                config.user_header,
                config.bound_cidrs.len()
            )),
            ..Self::bare("config.written")
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO proxyauth::backend::audit audit={"event":"login.issued","role":"dev",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "proxy backend audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
