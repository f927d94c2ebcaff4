//! Configuration management
//!
//! YAML file merged with `PROXYAUTH_`-prefixed environment variables (`__`
//! separates nesting levels, e.g. `PROXYAUTH_SERVER__PORT=8300`).
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 8200
//!   mount: proxy
//!   system_default_ttl: 768h
//!   admin_token: env:PROXYAUTH_ADMIN_TOKEN
//! backend:
//!   config:
//!     user_header: X-Remote-User
//!   roles:
//!     dev:
//!       allowed_users: "alice,bob*"
//! agent:
//!   vault:
//!     address: http://127.0.0.1:8200
//!   auto_auth:
//!     method:
//!       type: jwt
//!       config:
//!         role: dev
//!         env-var: CI_JOB_JWT
//!     sinks:
//!       - type: file
//!         config:
//!           path: /tmp/token
//! ```

use std::{collections::BTreeMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{AuthConfig, SinkConfig};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP host configuration
    pub server: ServerConfig,
    /// Backend state seeded at startup
    pub backend: BackendSeed,
    /// Auto-auth agent configuration
    pub agent: AgentConfig,
}

/// HTTP host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Mount point of the proxy backend (`/v1/auth/<mount>/...`)
    pub mount: String,
    /// Lease TTL applied when a role leaves `ttl` at zero
    #[serde(with = "duration")]
    pub system_default_ttl: Duration,
    /// Upper bound for lease max TTL
    #[serde(with = "duration")]
    pub system_max_ttl: Duration,
    /// Token guarding the config and role endpoints.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (generates random token)
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8200,
            mount: "proxy".to_string(),
            system_default_ttl: Duration::from_secs(768 * 3600),
            system_max_ttl: Duration::from_secs(768 * 3600),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the admin token (expand env vars, generate if `auto`).
    ///
    /// An `env:VAR` naming an unset or empty variable resolves to `None`,
    /// which leaves the admin endpoints disabled.
    #[must_use]
    pub fn resolve_admin_token(&self) -> Option<String> {
        let token = self.admin_token.as_ref()?;
        if token == "auto" {
            use rand::Rng;
            let random_bytes: [u8; 32] = rand::rng().random();
            Some(format!(
                "pxa_admin_{}",
                base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, random_bytes)
            ))
        } else if let Some(var_name) = token.strip_prefix("env:") {
            match env::var(var_name) {
                Ok(value) if !value.is_empty() => Some(value),
                _ => {
                    warn!(
                        variable = var_name,
                        "Admin token variable is unset or empty, admin endpoints disabled"
                    );
                    None
                }
            }
        } else {
            Some(token.clone())
        }
    }
}

/// Backend state written through the normal write paths at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSeed {
    /// Fields for the `config` path
    pub config: Option<serde_json::Value>,
    /// Role name → fields for `role/<name>`
    pub roles: BTreeMap<String, serde_json::Value>,
}

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host connection
    pub vault: VaultConfig,
    /// Auth method and sinks
    pub auto_auth: AutoAuthConfig,
    /// Exit once the first token has reached every sink
    pub exit_after_auth: bool,
}

/// Host connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Base address of the host
    pub address: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
        }
    }
}

/// Auth method and sinks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAuthConfig {
    /// The method to authenticate with
    pub method: AuthConfig,
    /// Where to publish tokens
    pub sinks: Vec<SinkConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("PROXYAUTH_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

/// Serde adapter for durations written as integer seconds or unit strings
/// (`"500ms"`, `"30s"`, `"5m"`, `"1h 30m"`, `"2d"`).
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Parse `"90s"`, `"1h30m"`, `"1h 30m"` or `"45"` (seconds).
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        let invalid = || format!("invalid duration {text:?}");
        if text.is_empty() {
            return Err(invalid());
        }

        let mut total = Duration::ZERO;
        let mut rest = text;
        while !rest.is_empty() {
            rest = rest.trim_start();
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(invalid());
            }
            let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
            rest = &rest[digits..];
            let unit_len = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
            let part = match &rest[..unit_len] {
                "ms" => Duration::from_millis(value),
                "s" | "sec" | "secs" => Duration::from_secs(value),
                "m" | "min" | "mins" => Duration::from_secs(value.saturating_mul(60)),
                "h" | "hr" | "hrs" => Duration::from_secs(value.saturating_mul(3600)),
                "d" | "day" | "days" => Duration::from_secs(value.saturating_mul(86_400)),
                _ => return Err(invalid()),
            };
            total = total.saturating_add(part);
            rest = &rest[unit_len..];
        }
        Ok(total)
    }

    /// Serialize as `"{secs}s"`, or `"{millis}ms"` for sub-second precision.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }

    /// Deserialize from integer seconds or a unit string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    /// Same as the parent module, for `Option<Duration>` fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` as a unit string.
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration.
        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(deserialize_with = "crate::config::duration::deserialize")] Duration);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.port, 8200);
        assert_eq!(config.server.mount, "proxy");
        assert_eq!(config.agent.vault.address, "http://127.0.0.1:8200");
        assert!(!config.agent.exit_after_auth);
    }

    #[test]
    fn yaml_durations_accept_seconds_and_units() {
        let yaml = r"
server:
  port: 8300
  system_default_ttl: 1h
  system_max_ttl: 7200
agent:
  auto_auth:
    method:
      type: token_file
      min_backoff: 5s
      config:
        token_file_path: /tmp/token
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8300);
        assert_eq!(config.server.system_default_ttl, Duration::from_secs(3600));
        assert_eq!(config.server.system_max_ttl, Duration::from_secs(7200));
        assert_eq!(config.agent.auto_auth.method.method_type, "token_file");
        assert_eq!(config.agent.auto_auth.method.min_backoff, Some(Duration::from_secs(5)));
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxyauth.yaml");
        std::fs::write(
            &path,
            "backend:\n  config:\n    user_header: x-user\n  roles:\n    dev:\n      allowed_users: alice\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();

        assert!(config.backend.config.is_some());
        assert!(config.backend.roles.contains_key("dev"));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/proxyauth.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn duration_parse_handles_units_and_compounds() {
        assert_eq!(duration::parse("45").unwrap(), Duration::from_secs(45));
        assert_eq!(duration::parse("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(duration::parse("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(duration::parse("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(duration::parse("2d").unwrap(), Duration::from_secs(172_800));
        assert!(duration::parse("").is_err());
        assert!(duration::parse("soon").is_err());
        assert!(duration::parse("5 parsecs").is_err());
    }

    /// Test an unset admin token variable disables admin access
    #[test]
    fn test_admin_token_from_unset_env_var_is_none() {
        // GIVEN: a config pointing at a variable nobody sets
        let server = ServerConfig {
            admin_token: Some("env:PROXYAUTH_TEST_UNSET_ADMIN_TOKEN".to_string()),
            ..ServerConfig::default()
        };

        // WHEN/THEN: no token resolves, the reference text is never a credential
        assert_eq!(server.resolve_admin_token(), None);
    }

    #[test]
    fn admin_token_literal_is_used_as_is() {
        let server = ServerConfig {
            admin_token: Some("s3cret".to_string()),
            ..ServerConfig::default()
        };
        assert_eq!(server.resolve_admin_token().as_deref(), Some("s3cret"));
    }

    #[test]
    fn admin_token_auto_generates_a_prefixed_value() {
        let server = ServerConfig {
            admin_token: Some("auto".to_string()),
            ..ServerConfig::default()
        };
        let token = server.resolve_admin_token().unwrap();
        assert!(token.starts_with("pxa_admin_"));
        assert_eq!(server.resolve_admin_token().map(|t| t.len()), Some(token.len()));
    }
}
