//! `role/<name>`: named authorization rules.
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `allowed_users` | Glob patterns; at least one must match the user |
//! | `required_headers` | Canonical header name → exact required value |
//! | `policies` | Normalized policy names granted on login |
//! | `ttl`, `max_ttl`, `period` | Lease lifetimes in seconds |

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use proxyauth_core::{canonical_header_key, normalize_policies};

use super::audit::{self, AuditEvent};
use super::storage::{get_json, put_json};
use super::{Operation, ProxyBackend, Request, Response, fields};
use crate::Result;

/// Storage prefix for roles.
pub const ROLE_PREFIX: &str = "role/";

/// A stored role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Glob patterns matched against the username
    pub allowed_users: Vec<String>,
    /// Canonical header name → required value
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,
    /// Normalized policies
    #[serde(default)]
    pub policies: Vec<String>,
    /// Lease TTL (seconds)
    #[serde(default)]
    pub ttl: u64,
    /// Lease max TTL (seconds)
    #[serde(default)]
    pub max_ttl: u64,
    /// Periodic TTL (seconds)
    #[serde(default)]
    pub period: u64,
}

impl Role {
    /// Public representation returned by reads.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        json!({
            "allowed_users": self.allowed_users,
            "required_headers": self.required_headers,
            "policies": self.policies,
            "ttl": self.ttl,
            "max_ttl": self.max_ttl,
            "period": self.period,
        })
    }
}

fn role_key(name: &str) -> String {
    format!("{ROLE_PREFIX}{name}")
}

/// Fold `required_headers` into canonical form, rejecting collisions.
fn canonical_headers(pairs: Vec<(String, String)>) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for (name, value) in pairs {
        let canonical = canonical_header_key(name.trim());
        if canonical.is_empty() {
            return Err("required_headers: empty header name".to_string());
        }
        if out.insert(canonical.clone(), value).is_some() {
            return Err(format!(
                "required_headers: {canonical:?} is specified more than once"
            ));
        }
    }
    Ok(out)
}

/// Apply `data` on top of `role`, validating as we go.
fn merge_fields(role: &mut Role, req: &Request) -> std::result::Result<(), String> {
    let data = &req.data;

    if let Some(users) = fields::string_list(data, "allowed_users")? {
        role.allowed_users = users;
    }
    if let Some(pairs) = fields::string_pairs(data, "required_headers")? {
        role.required_headers = canonical_headers(pairs)?;
    }
    if let Some(policies) = fields::string_list(data, "policies")? {
        role.policies = normalize_policies(&policies);
    }
    if let Some(ttl) = fields::duration_secs(data, "ttl")? {
        role.ttl = ttl;
    }
    if let Some(max_ttl) = fields::duration_secs(data, "max_ttl")? {
        role.max_ttl = max_ttl;
    }
    if let Some(period) = fields::duration_secs(data, "period")? {
        role.period = period;
    }

    if role.allowed_users.is_empty() {
        return Err("allowed_users must contain at least one entry".to_string());
    }
    if role.max_ttl > 0 && role.ttl > role.max_ttl {
        return Err("ttl cannot be greater than max_ttl".to_string());
    }
    Ok(())
}

/// Advisory warnings for durations beyond the host limits.
fn lifetime_warnings(role: &Role, default_ttl: Duration, max_ttl: Duration) -> Vec<String> {
    let mut warnings = Vec::new();
    if role.ttl > default_ttl.as_secs() {
        warnings.push(format!(
            "ttl of {}s is greater than the system default of {}s",
            role.ttl,
            default_ttl.as_secs()
        ));
    }
    if role.max_ttl > max_ttl.as_secs() {
        warnings.push(format!(
            "max_ttl of {}s is greater than the system max of {}s",
            role.max_ttl,
            max_ttl.as_secs()
        ));
    }
    if role.period > max_ttl.as_secs() {
        warnings.push(format!(
            "period of {}s is greater than the system max of {}s",
            role.period,
            max_ttl.as_secs()
        ));
    }
    warnings
}

impl ProxyBackend {
    /// Load a role by (already lower-cased) name.
    pub async fn load_role(&self, name: &str) -> Result<Option<Role>> {
        get_json(self.storage.as_ref(), &role_key(name)).await
    }

    pub(super) async fn list_roles(&self) -> Result<Response> {
        let names = self.storage.list(ROLE_PREFIX).await?;
        Ok(Response::List(names))
    }

    pub(super) async fn read_role(&self, name: &str) -> Result<Response> {
        Ok(match self.load_role(name).await? {
            Some(role) => Response::Data(role.to_value()),
            None => Response::NotFound,
        })
    }

    /// Create replaces any stored role; update merges over it.
    pub(super) async fn write_role(&self, name: &str, req: &Request) -> Result<Response> {
        let mut role = match req.operation {
            Operation::Update => self.load_role(name).await?.unwrap_or_default(),
            _ => Role::default(),
        };
        if let Err(message) = merge_fields(&mut role, req) {
            return Ok(Response::error(message));
        }

        let warnings = lifetime_warnings(
            &role,
            self.settings.system_default_ttl,
            self.settings.system_max_ttl,
        );
        put_json(self.storage.as_ref(), &role_key(name), &role).await?;
        audit::emit(&AuditEvent::role_written(name, &role));
        Ok(Response::Written { warnings })
    }

    pub(super) async fn delete_role(&self, name: &str) -> Result<Response> {
        self.storage.delete(&role_key(name)).await?;
        audit::emit(&AuditEvent::role_deleted(name));
        Ok(Response::written())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{BackendSettings, InMemoryStorage, Operation};
    use pretty_assertions::assert_eq;

    fn backend() -> ProxyBackend {
        ProxyBackend::new(
            Arc::new(InMemoryStorage::new()),
            BackendSettings {
                system_default_ttl: Duration::from_secs(3600),
                system_max_ttl: Duration::from_secs(7200),
            },
        )
    }

    async fn write(b: &ProxyBackend, name: &str, data: serde_json::Value) -> Response {
        let req = Request::new(Operation::Create, format!("role/{name}")).with_data(data);
        b.handle_request(&req).await.unwrap()
    }

    #[tokio::test]
    async fn empty_allowed_users_is_rejected_without_writing() {
        let b = backend();

        let resp = write(&b, "dev", json!({"allowed_users": []})).await;

        assert!(resp.is_error());
        assert!(b.load_role("dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn colliding_header_names_are_rejected() {
        // GIVEN: two spellings of the same header
        let b = backend();

        // WHEN: writing the role
        let resp = write(
            &b,
            "dev",
            json!({"allowed_users": "alice", "required_headers": {"X-Foo": "a", "x-foo": "b"}}),
        )
        .await;

        // THEN: rejected and storage untouched
        assert!(resp.is_error());
        assert!(b.load_role("dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_above_max_ttl_is_rejected() {
        let b = backend();
        let resp = write(&b, "dev", json!({"allowed_users": "a", "ttl": 600, "max_ttl": 60})).await;
        assert_eq!(resp.error_message(), Some("ttl cannot be greater than max_ttl"));

        let resp = write(&b, "dev", json!({"allowed_users": "a", "ttl": 600, "max_ttl": 0})).await;
        assert!(!resp.is_error());
    }

    #[tokio::test]
    async fn negative_durations_are_rejected() {
        let b = backend();
        let resp = write(&b, "dev", json!({"allowed_users": "a", "period": -5})).await;
        assert_eq!(resp.error_message(), Some("period cannot be negative"));
    }

    #[tokio::test]
    async fn long_durations_are_accepted_with_warnings() {
        // GIVEN: a ttl above the host default and a max_ttl above the host max
        let b = backend();

        // WHEN: writing the role
        let resp = write(&b, "dev", json!({"allowed_users": "a", "ttl": "2h", "max_ttl": "3h"})).await;

        // THEN: accepted with two warnings
        let Response::Written { warnings } = resp else {
            panic!("expected a write, got {resp:?}");
        };
        assert_eq!(warnings.len(), 2);
        assert_eq!(b.load_role("dev").await.unwrap().unwrap().ttl, 7200);
    }

    #[tokio::test]
    async fn read_returns_normalized_fields() {
        let b = backend();
        write(
            &b,
            "dev",
            json!({
                "allowed_users": "alice, bob*",
                "required_headers": "x-team=ops",
                "policies": "Dev, ops, dev",
                "ttl": 60,
            }),
        )
        .await;

        let resp = b
            .handle_request(&Request::new(Operation::Read, "role/dev"))
            .await
            .unwrap();

        assert_eq!(
            resp,
            Response::Data(json!({
                "allowed_users": ["alice", "bob*"],
                "required_headers": {"X-Team": "ops"},
                "policies": ["dev", "ops"],
                "ttl": 60,
                "max_ttl": 0,
                "period": 0,
            }))
        );
    }

    #[tokio::test]
    async fn update_merges_over_the_stored_role() {
        let b = backend();
        write(&b, "dev", json!({"allowed_users": "alice", "policies": "dev"})).await;

        let req = Request::new(Operation::Update, "role/dev").with_data(json!({"ttl": 30}));
        b.handle_request(&req).await.unwrap();

        let role = b.load_role("dev").await.unwrap().unwrap();
        assert_eq!(role.allowed_users, vec!["alice"]);
        assert_eq!(role.policies, vec!["dev"]);
        assert_eq!(role.ttl, 30);
    }

    #[tokio::test]
    async fn delete_then_read_is_not_found() {
        let b = backend();
        write(&b, "dev", json!({"allowed_users": "alice"})).await;

        b.handle_request(&Request::new(Operation::Delete, "role/dev"))
            .await
            .unwrap();

        let resp = b
            .handle_request(&Request::new(Operation::Read, "role/dev"))
            .await
            .unwrap();
        assert_eq!(resp, Response::NotFound);
    }
}
