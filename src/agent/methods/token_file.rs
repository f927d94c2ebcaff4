//! Token-file method.
//!
//! Reads a token someone else dropped on disk and validates it through the
//! host's lookup-self endpoint. The last good token is cached so a consumed or
//! emptied file does not break re-authentication.

use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Options;
use crate::agent::client::LOOKUP_SELF_PATH;
use crate::agent::method::{AuthConfig, AuthMethod, LoginRequest};
use crate::{Error, Result};

/// Logs in with a token read from a file.
pub struct TokenFileMethod {
    path: PathBuf,
    remove_after_reading: bool,
    cached: Mutex<String>,
}

impl TokenFileMethod {
    /// Build the method; `token_file_path` is required.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let opts = Options::new(config);
        Ok(Self {
            path: PathBuf::from(opts.required_string("token_file_path")?),
            remove_after_reading: opts.bool("remove_token_file_after_reading")?.unwrap_or(false),
            cached: Mutex::new(String::new()),
        })
    }

    fn reuse_cached(&self, reason: &str) -> Result<String> {
        let cached = self.cached.lock().clone();
        if cached.is_empty() {
            return Err(Error::Method(format!(
                "{reason} at {} and no cached token known",
                self.path.display()
            )));
        }
        warn!(path = %self.path.display(), reason, "Reusing cached token");
        Ok(cached)
    }
}

#[async_trait::async_trait]
impl AuthMethod for TokenFileMethod {
    async fn authenticate(&self) -> Result<LoginRequest> {
        let token = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                if self.remove_after_reading {
                    if let Err(e) = tokio::fs::remove_file(&self.path).await {
                        warn!(path = %self.path.display(), error = %e, "Failed to remove token file");
                    }
                }
                let token = content.trim();
                if token.is_empty() {
                    self.reuse_cached("token file is empty")?
                } else {
                    debug!(path = %self.path.display(), "Read token from file");
                    *self.cached.lock() = token.to_string();
                    token.to_string()
                }
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Token file unreadable");
                self.reuse_cached("token file is unreadable")?
            }
        };
        Ok(LoginRequest::new(LOOKUP_SELF_PATH, json!({ "token": token })))
    }

    fn new_creds(&self) -> Option<mpsc::Receiver<()>> {
        None
    }

    async fn shutdown(&self) {}
}
