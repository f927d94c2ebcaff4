//! Command-line interface

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};

use crate::agent::LoginRequest;
use crate::{Error, Result};

/// Proxy-header credential backend and auto-auth agent
#[derive(Parser, Debug)]
#[command(name = "proxyauth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PROXYAUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PROXYAUTH_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "PROXYAUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP host for the proxy backend (default)
    Serve {
        /// Host to bind to
        #[arg(long, env = "PROXYAUTH_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PROXYAUTH_PORT")]
        port: Option<u16>,
    },

    /// Run the auto-auth agent
    Agent {
        /// Exit once the first token has been written to every sink
        #[arg(long)]
        exit_after_auth: bool,
    },

    /// Log in once and print the result
    Login {
        /// Login method (only `proxy`)
        #[arg(long, default_value = "proxy")]
        method: String,

        /// Mount of the backend; the request goes to `auth/<path>/login`
        #[arg(long, default_value = "proxy")]
        path: String,

        /// Host address (defaults to `agent.vault.address`)
        #[arg(long, env = "PROXYAUTH_ADDR")]
        address: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Login fields as `key=value` (`role=<name>`)
        #[arg(value_name = "K=V")]
        fields: Vec<String>,
    },
}

/// Output format of `login`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// The full response as JSON
    Json,
    /// The full response as YAML
    Yaml,
    /// Only the client token
    Token,
}

/// Flags that are also accepted with a single dash (`-method=proxy`).
const SINGLE_DASH_FLAGS: &[&str] = &["method", "path", "address", "format"];

/// Rewrite `-method`, `-path`, `-address` and `-format` into their `--` forms.
pub fn normalize_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(rest) = text.strip_prefix('-').filter(|r| !r.starts_with('-')) else {
                return arg;
            };
            let name = rest.split('=').next().unwrap_or_default();
            if SINGLE_DASH_FLAGS.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

/// Build the login request for `login -method=proxy role=<name>`.
///
/// `name` is accepted as an alias for `role` and only used when `role` is
/// absent.
pub fn login_request(method: &str, path: &str, fields: &[String]) -> Result<LoginRequest> {
    if method != "proxy" {
        return Err(Error::Config(format!(
            "unknown login method {method:?}; only \"proxy\" is supported"
        )));
    }

    let mut data = Map::new();
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("expected key=value, got {field:?}")))?;
        data.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    if let Some(name) = data.remove("name") {
        data.entry("role").or_insert(name);
    }
    if !data.contains_key("role") {
        return Err(Error::Config("'role' is required".to_string()));
    }

    let mount = path.trim_matches('/');
    let mount = if mount.is_empty() { "proxy" } else { mount };
    Ok(LoginRequest::new(format!("auth/{mount}/login"), Value::Object(data)))
}
