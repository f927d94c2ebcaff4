//! Authorization engine deciding login and renewal admission.
//!
//! Given `(config, role, request, username)` the checks run in order and the
//! first failure wins:
//!
//! 1. **User match**: some glob in `role.allowed_users` matches the username.
//! 2. **Required headers**: every `(name, value)` in `role.required_headers`
//!    is present in the request exactly once with exactly that value.
//! 3. **CIDR binding**: when `config.bound_cidrs` is non-empty the caller's
//!    address falls inside one of them.
//!
//! A missing headers map, or missing connection info while CIDRs are bound,
//! is an environment failure ([`Error::Fatal`]) rather than a denial.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use tracing::debug;

use proxyauth_core::glob_matches;
use proxyauth_core::header::same_header;

use super::{ProxyConfig, Request, Role};
use crate::{Error, Result};

/// Denial message: no glob matched.
pub const USER_NOT_PERMITTED: &str = "user not permitted to authenticate with this role";
/// Denial message: a required header is missing, repeated or wrong.
pub const HEADER_MISMATCH: &str = "required header not present, or has incorrect value";
/// Denial message: the caller is outside every bound CIDR.
pub const UNAUTHORIZED_SOURCE: &str = "unauthorized source address";
/// Denial message: the user header was absent or empty.
pub const UNKNOWN_USER: &str = "could not identify remote user";

/// Outcome of [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// All checks passed
    Allow,
    /// A check failed; the message goes back to the client
    Deny(String),
}

impl Decision {
    fn deny(message: &str) -> Self {
        Self::Deny(message.to_string())
    }
}

/// Borrow the request headers or fail.
pub(crate) fn request_headers(req: &Request) -> Result<&HashMap<String, Vec<String>>> {
    req.headers
        .as_ref()
        .ok_or_else(|| Error::Fatal("request headers are missing".to_string()))
}

/// Every value of every header whose canonical name equals `name`'s.
pub(crate) fn header_values<'a>(headers: &'a HashMap<String, Vec<String>>, name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(key, _)| same_header(key, name))
        .flat_map(|(_, values)| values.iter().map(String::as_str))
        .collect()
}

/// Extract the authenticated username from the configured header.
///
/// `Ok(Err(message))` is a denial: the header appeared more than once, or
/// not at all. The value is taken verbatim, so globs match exactly what the
/// proxy sent.
pub(crate) fn remote_user(
    config: &ProxyConfig,
    req: &Request,
) -> Result<std::result::Result<String, String>> {
    let headers = request_headers(req)?;
    let values = header_values(headers, &config.user_header);
    Ok(match values.as_slice() {
        [] => Err(UNKNOWN_USER.to_string()),
        [one] if one.is_empty() => Err(UNKNOWN_USER.to_string()),
        [one] => Ok((*one).to_string()),
        many => Err(format!("header present {} times", many.len())),
    })
}

/// Parse `ip`, `ip:port` or `[v6]:port`.
fn parse_remote_ip(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    remote
        .parse::<SocketAddr>()
        .map(|s| s.ip())
        .or_else(|_| remote.trim_matches(['[', ']']).parse::<IpAddr>())
        .ok()
}

pub(crate) fn source_allowed(cidrs: &[IpNet], remote: &str) -> bool {
    let Some(ip) = parse_remote_ip(remote) else {
        return false;
    };
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    };
    cidrs.iter().any(|net| net.contains(&ip))
}

/// Run the three admission checks.
pub fn authorize(config: &ProxyConfig, role: &Role, req: &Request, username: &str) -> Result<Decision> {
    if !role
        .allowed_users
        .iter()
        .any(|pattern| glob_matches(pattern, username))
    {
        debug!(username = %username, "No allowed_users pattern matched");
        return Ok(Decision::deny(USER_NOT_PERMITTED));
    }

    if !role.required_headers.is_empty() {
        let headers = request_headers(req)?;
        for (name, expected) in &role.required_headers {
            match header_values(headers, name).as_slice() {
                [value] if value == expected => {}
                _ => {
                    debug!(header = %name, "Required header check failed");
                    return Ok(Decision::deny(HEADER_MISMATCH));
                }
            }
        }
    }

    if !config.bound_cidrs.is_empty() {
        let connection = req.connection.as_ref().ok_or_else(|| {
            Error::Fatal("connection information is missing but CIDRs are bound".to_string())
        })?;
        if !source_allowed(&config.bound_cidrs, &connection.remote_addr) {
            debug!(remote_addr = %connection.remote_addr, "Source address outside bound CIDRs");
            return Ok(Decision::deny(UNAUTHORIZED_SOURCE));
        }
    }

    Ok(Decision::Allow)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backend::Operation;
    use proxyauth_core::canonical_header_key;

    fn config(cidrs: &[&str]) -> ProxyConfig {
        ProxyConfig {
            user_header: "Remote_user".to_string(),
            bound_cidrs: cidrs.iter().map(|c| c.parse().unwrap()).collect(),
        }
    }

    fn role(users: &[&str], headers: &[(&str, &str)]) -> Role {
        Role {
            allowed_users: users.iter().map(ToString::to_string).collect(),
            required_headers: headers
                .iter()
                .map(|(k, v)| (canonical_header_key(k), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Role::default()
        }
    }

    fn login() -> Request {
        Request::new(Operation::Update, "login")
    }

    #[test]
    fn glob_miss_is_denied() {
        let decision = authorize(&config(&[]), &role(&["user3*x"], &[]), &login(), "user3foobar").unwrap();
        assert_eq!(decision, Decision::Deny(USER_NOT_PERMITTED.to_string()));
    }

    #[test]
    fn required_header_lookup_ignores_case() {
        // GIVEN: the request spells the header in lower case
        let req = login().with_header("req_hdr_1", "REQ_VAL_1");

        // WHEN: authorizing against a role requiring REQ_HDR_1
        let decision = authorize(&config(&[]), &role(&["*"], &[("REQ_HDR_1", "REQ_VAL_1")]), &req, "u").unwrap();

        // THEN: allowed
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn multi_valued_required_header_is_denied() {
        let req = login()
            .with_header("X-Team", "ops")
            .with_header("X-Team", "dev");
        let decision = authorize(&config(&[]), &role(&["*"], &[("x-team", "ops")]), &req, "u").unwrap();
        assert_eq!(decision, Decision::Deny(HEADER_MISMATCH.to_string()));
    }

    #[test]
    fn missing_headers_map_is_fatal_when_headers_are_required() {
        let result = authorize(&config(&[]), &role(&["*"], &[("x-team", "ops")]), &login(), "u");
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[test]
    fn bound_cidrs_without_connection_is_fatal() {
        let result = authorize(&config(&["10.0.0.0/8"]), &role(&["*"], &[]), &login(), "u");
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[test]
    fn source_address_is_checked_against_cidrs() {
        let cfg = config(&["10.0.0.0/8", "192.168.0.0/16"]);
        let r = role(&["*"], &[]);

        let inside = login().with_remote_addr("192.168.4.2:51234");
        assert_eq!(authorize(&cfg, &r, &inside, "u").unwrap(), Decision::Allow);

        let outside = login().with_remote_addr("172.16.0.1");
        assert_eq!(
            authorize(&cfg, &r, &outside, "u").unwrap(),
            Decision::Deny(UNAUTHORIZED_SOURCE.to_string())
        );

        let garbage = login().with_remote_addr("not-an-ip");
        assert!(matches!(authorize(&cfg, &r, &garbage, "u").unwrap(), Decision::Deny(_)));
    }

    #[test]
    fn ipv4_mapped_ipv6_peers_match_ipv4_networks() {
        let cfg = config(&["10.0.0.0/8"]);
        let req = login().with_remote_addr("[::ffff:10.1.2.3]:443");
        assert_eq!(authorize(&cfg, &role(&["*"], &[]), &req, "u").unwrap(), Decision::Allow);
    }

    #[test]
    fn remote_user_counts_occurrences_across_spellings() {
        let cfg = config(&[]);

        let one = login().with_header("REMOTE_USER", "alice");
        assert_eq!(remote_user(&cfg, &one).unwrap(), Ok("alice".to_string()));

        let twice = login()
            .with_header("REMOTE_USER", "alice")
            .with_header("remote_user", "bob");
        assert_eq!(
            remote_user(&cfg, &twice).unwrap(),
            Err("header present 2 times".to_string())
        );

        let none = login().with_header("X-Other", "x");
        assert_eq!(remote_user(&cfg, &none).unwrap(), Err(UNKNOWN_USER.to_string()));

        assert!(remote_user(&cfg, &login()).is_err());
    }

    /// Test the username header value is used verbatim
    #[test]
    fn test_remote_user_is_not_trimmed() {
        // GIVEN: a proxy that sends the username with surrounding spaces
        let cfg = config(&[]);
        let padded = login().with_header("REMOTE_USER", " alice ");

        // WHEN: extracting the user
        let user = remote_user(&cfg, &padded).unwrap().unwrap();

        // THEN: the spaces are kept and an exact allowlist entry does not match
        assert_eq!(user, " alice ");
        assert_eq!(
            authorize(&cfg, &role(&["alice"], &[]), &padded, &user).unwrap(),
            Decision::Deny(USER_NOT_PERMITTED.to_string())
        );
        let empty = login().with_header("REMOTE_USER", "");
        assert_eq!(remote_user(&cfg, &empty).unwrap(), Err(UNKNOWN_USER.to_string()));
    }
}
