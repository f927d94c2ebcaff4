//! Built-in auth methods.
//!
//! | `type` | Method | Rotates out of band |
//! |--------|--------|---------------------|
//! | `polling`, `aws`, `gcp`, `oci` | [`PollingMethod`] over [`EnvCredentialProvider`] | on credential change |
//! | `jwt` | [`JwtMethod`] | when the env var changes |
//! | `cert` | [`CertMethod`] | when a cert file changes |
//! | `token_file` | [`TokenFileMethod`] | no |

mod cert;
mod jwt;
mod polling;
mod token_file;

pub use cert::CertMethod;
pub use jwt::JwtMethod;
pub use polling::{CredentialProvider, EnvCredentialProvider, PollingMethod};
pub use token_file::TokenFileMethod;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use super::method::{AuthConfig, AuthMethod};
use crate::{Error, Result};

/// Reads an environment variable. Injected so tests never touch the process
/// environment.
pub type EnvReader = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// [`EnvReader`] over the process environment.
#[must_use]
pub fn process_env() -> EnvReader {
    Arc::new(|name| std::env::var(name).ok())
}

/// Build the method named by `config.method_type`.
pub fn build(config: &AuthConfig) -> Result<Arc<dyn AuthMethod>> {
    let method: Arc<dyn AuthMethod> = match config.method_type.as_str() {
        "polling" | "aws" | "gcp" | "oci" => {
            let provider = EnvCredentialProvider::from_config(config, process_env())?;
            Arc::new(PollingMethod::new(config, provider)?)
        }
        "jwt" => Arc::new(JwtMethod::new(config, process_env())?),
        "cert" => Arc::new(CertMethod::new(config)?),
        "token_file" => Arc::new(TokenFileMethod::new(config)?),
        "" => return Err(Error::Config("auth method type is required".to_string())),
        other => return Err(Error::Config(format!("unknown auth method type {other:?}"))),
    };
    Ok(method)
}

/// Typed access to a method's option map.
///
/// Strings accept numbers and booleans, booleans accept `"true"`, `"false"`,
/// `"1"` and `"0"`, durations accept integer seconds or unit strings.
/// Unknown keys are ignored.
pub(crate) struct Options<'a> {
    method: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> Options<'a> {
    pub(crate) fn new(config: &'a AuthConfig) -> Self {
        Self {
            method: &config.method_type,
            map: &config.config,
        }
    }

    fn invalid(&self, key: &str, expected: &str) -> Error {
        Error::Config(format!("{}: '{key}' must be {expected}", self.method))
    }

    pub(crate) fn string(&self, key: &str) -> Result<Option<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub(crate) fn required_string(&self, key: &str) -> Result<String> {
        self.string(key)?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config(format!("{}: '{key}' is required", self.method)))
    }

    pub(crate) fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(self.invalid(key, "a boolean")),
            },
            Some(Value::Number(n)) => match n.as_u64() {
                Some(1) => Ok(Some(true)),
                Some(0) => Ok(Some(false)),
                _ => Err(self.invalid(key, "a boolean")),
            },
            Some(_) => Err(self.invalid(key, "a boolean")),
        }
    }

    pub(crate) fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| self.invalid(key, "a non-negative number of seconds")),
            Some(Value::String(s)) => crate::config::duration::parse(s)
                .map(Some)
                .map_err(|e| Error::Config(format!("{}: '{key}': {e}", self.method))),
            Some(_) => Err(self.invalid(key, "a duration")),
        }
    }

    pub(crate) fn string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(proxyauth_core::parse_comma_list(s)),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.invalid(key, "a list of strings"))
                })
                .collect(),
            Some(_) => Err(self.invalid(key, "a list of strings")),
        }
    }
}
