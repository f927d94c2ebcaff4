//! `login`: issue, look ahead and renew leases.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use proxyauth_core::equivalent_policies;

use super::audit::{self, AuditEvent};
use super::authorize::{self, Decision, authorize};
use super::{Alias, LeaseAuth, ProxyBackend, ProxyConfig, Request, Response, Role, fields};
use crate::{Error, Result};

/// Error returned while no config has been written.
pub const CONFIG_MISSING: &str = "could not load configuration";

/// Fatal error returned when the role's policies drifted since issue.
pub const POLICIES_CHANGED: &str = "policies have changed, not renewing";

fn remote_addr(req: &Request) -> Option<&str> {
    req.connection.as_ref().map(|c| c.remote_addr.as_str())
}

/// Read `role` from the login data.
fn requested_role(req: &Request) -> std::result::Result<String, String> {
    match fields::string(&req.data, "role")? {
        Some(name) if !name.trim().is_empty() => Ok(name.trim().to_lowercase()),
        _ => Err("missing role".to_string()),
    }
}

fn build_lease(config: &ProxyConfig, role: &Role, role_name: &str, username: &str) -> LeaseAuth {
    LeaseAuth {
        display_name: username.to_string(),
        policies: role.policies.clone(),
        ttl: role.ttl,
        max_ttl: role.max_ttl,
        period: role.period,
        renewable: true,
        alias: Alias {
            name: username.to_string(),
            metadata: BTreeMap::from([("role".to_string(), role_name.to_string())]),
        },
        metadata: BTreeMap::from([
            ("role".to_string(), role_name.to_string()),
            ("username".to_string(), username.to_string()),
        ]),
        bound_cidrs: config.bound_cidrs.clone(),
    }
}

impl ProxyBackend {
    pub(super) async fn login(&self, req: &Request) -> Result<Response> {
        let role_name = match requested_role(req) {
            Ok(name) => name,
            Err(message) => return Ok(Response::error(message)),
        };

        let Some(config) = self.load_config().await? else {
            warn!(role = %role_name, "Login attempted before the backend was configured");
            return Ok(Response::error(CONFIG_MISSING));
        };

        let username = match authorize::remote_user(&config, req)? {
            Ok(username) => username,
            Err(message) => {
                audit::emit(&AuditEvent::denied(&role_name, None, remote_addr(req), &message));
                return Ok(Response::error(message));
            }
        };

        let Some(role) = self.load_role(&role_name).await? else {
            let message = format!("invalid role name {role_name:?}");
            audit::emit(&AuditEvent::denied(
                &role_name,
                Some(&username),
                remote_addr(req),
                &message,
            ));
            return Ok(Response::error(message));
        };

        if let Decision::Deny(message) = authorize(&config, &role, req, &username)? {
            audit::emit(&AuditEvent::denied(
                &role_name,
                Some(&username),
                remote_addr(req),
                &message,
            ));
            return Ok(Response::error(message));
        }

        let auth = build_lease(&config, &role, &role_name, &username);
        audit::emit(&AuditEvent::issued(&auth, remote_addr(req)));
        Ok(Response::Auth(Box::new(auth)))
    }

    /// Resolve the alias for the request without authorizing it.
    pub(super) async fn alias_lookahead(&self, req: &Request) -> Result<Response> {
        let role_name = match requested_role(req) {
            Ok(name) => name,
            Err(message) => return Ok(Response::error(message)),
        };
        let Some(config) = self.load_config().await? else {
            return Ok(Response::error(CONFIG_MISSING));
        };
        Ok(match authorize::remote_user(&config, req)? {
            Ok(username) => Response::Alias(Alias {
                name: username,
                metadata: BTreeMap::from([("role".to_string(), role_name)]),
            }),
            Err(message) => Response::error(message),
        })
    }

    pub(super) async fn renew(&self, req: &Request) -> Result<Response> {
        let lease = req
            .auth
            .as_ref()
            .ok_or_else(|| Error::Fatal("renewal request carries no lease".to_string()))?;
        let (Some(role_name), Some(username)) =
            (lease.metadata.get("role"), lease.metadata.get("username"))
        else {
            return Err(Error::Fatal(
                "lease metadata is missing the role or username".to_string(),
            ));
        };

        let Some(config) = self.load_config().await? else {
            return Ok(Response::error(CONFIG_MISSING));
        };
        let Some(role) = self.load_role(role_name).await? else {
            let message = format!("role {role_name:?} no longer exists");
            audit::emit(&AuditEvent::renew_denied(role_name, username, &message));
            return Ok(Response::error(message));
        };

        if let Decision::Deny(message) = authorize(&config, &role, req, username)? {
            audit::emit(&AuditEvent::renew_denied(role_name, username, &message));
            return Ok(Response::error(message));
        }

        if !equivalent_policies(&role.policies, &lease.policies) {
            debug!(role = %role_name, current = ?role.policies, leased = ?lease.policies, "Policy drift");
            audit::emit(&AuditEvent::renew_denied(role_name, username, POLICIES_CHANGED));
            return Err(Error::Fatal(POLICIES_CHANGED.to_string()));
        }

        let mut renewed = lease.clone();
        renewed.ttl = role.ttl;
        renewed.max_ttl = role.max_ttl;
        renewed.period = role.period;
        audit::emit(&AuditEvent::renewed(&renewed));
        Ok(Response::Auth(Box::new(renewed)))
    }
}
