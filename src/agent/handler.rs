//! Auth supervisor.
//!
//! Drives one [`AuthMethod`] through authenticate → publish → renew, backing
//! off between failed attempts and starting over whenever the renewer finishes
//! or the method reports new credentials.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::Host;
use super::method::AuthMethod;
use crate::api::Secret;
use crate::{Error, Result};

/// Base of the retry backoff when the method config sets none.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(2);

/// Spread of the jitter around the base backoff.
const BACKOFF_JITTER_MS: u64 = 2000;

/// Long-running auth loop for one method.
pub struct AuthHandler {
    host: Arc<dyn Host>,
    output: mpsc::Sender<String>,
    done: CancellationToken,
    min_backoff: Duration,
    rng: StdRng,
}

impl AuthHandler {
    /// Create a handler and the receiver its tokens are published on.
    ///
    /// The channel holds a single token; the handler waits for the consumer
    /// before moving on to renewal.
    #[must_use]
    pub fn new(host: Arc<dyn Host>, min_backoff: Option<Duration>) -> (Self, mpsc::Receiver<String>) {
        let (output, rx) = mpsc::channel(1);
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() ^ u64::from(d.subsec_nanos()));
        let handler = Self {
            host,
            output,
            done: CancellationToken::new(),
            min_backoff: min_backoff.unwrap_or(DEFAULT_MIN_BACKOFF),
            rng: StdRng::seed_from_u64(seed),
        };
        (handler, rx)
    }

    /// Fires once [`AuthHandler::run`] has returned.
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Run until `shutdown` fires.
    ///
    /// The method's own `shutdown` is left to the caller.
    pub async fn run(mut self, method: Arc<dyn AuthMethod>, shutdown: CancellationToken) {
        let _done = self.done.clone().drop_guard();
        let mut creds_rx = method.new_creds();
        let mut bootstrapped = false;

        info!("Auth handler started");

        'auth: loop {
            if shutdown.is_cancelled() {
                break;
            }
            let backoff = self.next_backoff();

            let attempt = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.authenticate(method.as_ref()) => result,
            };
            let (secret, token) = match attempt {
                Ok(found) => found,
                Err(e) => {
                    error!(error = %e, backoff = ?backoff, "Authentication failed, backing off");
                    if sleep_or_shutdown(backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if !bootstrapped {
                method.cred_success();
                bootstrapped = true;
            }
            info!(ttl = secret.token_ttl(), renewable = secret.token_renewable(), "Authentication successful");

            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                sent = self.output.send(token) => {
                    if sent.is_err() {
                        warn!("Token output closed, stopping auth handler");
                        break;
                    }
                }
            }

            let mut renewer = self.host.start_renewer(&secret, shutdown.child_token());
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        renewer.stop();
                        break 'auth;
                    }
                    () = creds_signal(&mut creds_rx) => {
                        info!("Credentials changed, re-authenticating");
                        renewer.stop();
                        continue 'auth;
                    }
                    finished = &mut renewer.done_rx => {
                        match finished {
                            Ok(Ok(())) => info!("Token renewal finished"),
                            Ok(Err(e)) => error!(error = %e, "Token renewal failed"),
                            Err(_) => warn!("Token renewer went away"),
                        }
                        renewer.stop();
                        debug!(backoff = ?backoff, "Re-authenticating after backoff");
                        if sleep_or_shutdown(backoff, &shutdown).await {
                            break 'auth;
                        }
                        continue 'auth;
                    }
                    Some(renewal) = renewer.renew_rx.recv() => {
                        info!(lease = ?renewal.lease_duration, "Token renewed");
                    }
                }
            }
        }

        info!("Auth handler stopped");
    }

    async fn authenticate(&self, method: &dyn AuthMethod) -> Result<(Secret, String)> {
        let request = method.authenticate().await?;
        debug!(path = %request.path, "Logging in");
        let secret = self
            .host
            .login(&request)
            .await?
            .ok_or_else(|| Error::Method("host returned no lease".to_string()))?;
        let token = secret
            .token()
            .ok_or_else(|| Error::Method("host returned an empty token".to_string()))?
            .to_string();
        Ok((secret, token))
    }

    /// `min_backoff` shifted by a uniform jitter in `[-1s, +1s)`.
    fn next_backoff(&mut self) -> Duration {
        let jitter = Duration::from_millis(self.rng.random_range(0..BACKOFF_JITTER_MS));
        (self.min_backoff + jitter).saturating_sub(Duration::from_millis(BACKOFF_JITTER_MS / 2))
    }
}

/// Sleep for `duration`; returns `true` if `shutdown` fired first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

/// Resolves on each credential-change notification; pending forever once the
/// method has no signal or has closed it.
async fn creds_signal(rx: &mut Option<mpsc::Receiver<()>>) {
    if let Some(inner) = rx.as_mut() {
        if inner.recv().await.is_some() {
            return;
        }
    }
    *rx = None;
    std::future::pending::<()>().await;
}
