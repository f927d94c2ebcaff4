//! Token lifetime watcher.
//!
//! Renews a token at a jittered 70-90 % of its current lease. Each success is
//! reported on [`RenewerHandle::renew_rx`]; the watcher finishes exactly once
//! on [`RenewerHandle::done_rx`]:
//!
//! - `Ok(())` when the token is not renewable, the host stops extending it, or
//!   the watcher was cancelled
//! - `Err(_)` when every renewal attempt failed

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use backon::{ExponentialBuilder, Retryable};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::Secret;
use crate::{Error, Result};

/// Renewal attempts per lease before giving up.
const RENEW_ATTEMPTS: usize = 3;

/// The host call the watcher drives.
#[async_trait::async_trait]
pub trait TokenRenewer: Send + Sync + 'static {
    /// Renew `token`, optionally asking for `increment` seconds.
    async fn renew(&self, token: &str, increment: Option<u64>) -> Result<Secret>;
}

/// One successful renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewOutput {
    /// Lease granted by the renewal
    pub lease_duration: Duration,
    /// When the renewal completed
    pub renewed_at: SystemTime,
}

/// Receiving side of a running watcher.
#[derive(Debug)]
pub struct RenewerHandle {
    /// Successful renewals
    pub renew_rx: mpsc::Receiver<RenewOutput>,
    /// Final outcome; fires once
    pub done_rx: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
}

impl RenewerHandle {
    /// Assemble a handle from its parts. The watcher stops when `cancel` fires.
    #[must_use]
    pub fn new(
        renew_rx: mpsc::Receiver<RenewOutput>,
        done_rx: oneshot::Receiver<Result<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            renew_rx,
            done_rx,
            cancel,
        }
    }

    /// Stop the watcher. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the renewal task for one token.
pub struct LifetimeWatcher;

impl LifetimeWatcher {
    /// Start renewing the token in `secret` until `cancel` fires.
    pub fn start<R: TokenRenewer>(
        renewer: Arc<R>,
        secret: &Secret,
        cancel: CancellationToken,
    ) -> RenewerHandle {
        let (renew_tx, renew_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();

        let token = secret.token().unwrap_or_default().to_string();
        let lease = Duration::from_secs(secret.token_ttl());
        let renewable = secret.token_renewable();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = if renewable && !lease.is_zero() {
                renew_loop(renewer.as_ref(), &token, lease, &renew_tx, &task_cancel).await
            } else {
                // Nothing to renew; hold on until most of the lease is gone so
                // the supervisor re-authenticates before expiry.
                if !lease.is_zero() {
                    tokio::select! {
                        () = task_cancel.cancelled() => {}
                        () = tokio::time::sleep(grace_period(lease)) => {}
                    }
                }
                Ok(())
            };
            let _ = done_tx.send(result);
        });

        RenewerHandle::new(renew_rx, done_rx, cancel)
    }
}

async fn renew_loop<R: TokenRenewer>(
    renewer: &R,
    token: &str,
    mut lease: Duration,
    renew_tx: &mpsc::Sender<RenewOutput>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let wait = grace_period(lease);
        debug!(wait = ?wait, lease = ?lease, "Next token renewal scheduled");
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(wait) => {}
        }

        let increment = Some(lease.as_secs());
        let attempt = (|| async { renewer.renew(token, increment).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(1))
                    .with_max_times(RENEW_ATTEMPTS - 1),
            )
            .sleep(tokio::time::sleep)
            .when(Error::is_retryable)
            .notify(|err, dur| warn!(error = %err, retry_in = ?dur, "Token renewal failed"));

        let secret = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = attempt => result?,
        };

        lease = Duration::from_secs(secret.token_ttl());
        let output = RenewOutput {
            lease_duration: lease,
            renewed_at: SystemTime::now(),
        };
        if renew_tx.send(output).await.is_err() {
            return Ok(());
        }
        if lease.is_zero() || !secret.token_renewable() {
            return Ok(());
        }
    }
}

/// A jittered 70-90 % of `lease`.
fn grace_period(lease: Duration) -> Duration {
    lease.mul_f64(rand::rng().random_range(0.7..0.9))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SecretAuth;
    use parking_lot::Mutex;

    fn lease(token: &str, ttl: u64, renewable: bool) -> Secret {
        Secret {
            auth: Some(SecretAuth {
                client_token: token.to_string(),
                lease_duration: ttl,
                renewable,
                ..SecretAuth::default()
            }),
            ..Secret::default()
        }
    }

    struct Scripted {
        answers: Mutex<Vec<Result<Secret>>>,
        calls: Mutex<Vec<(String, Option<u64>)>>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<Secret>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TokenRenewer for Scripted {
        async fn renew(&self, token: &str, increment: Option<u64>) -> Result<Secret> {
            self.calls.lock().push((token.to_string(), increment));
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                Err(Error::Api("no more answers".to_string()))
            } else {
                answers.remove(0)
            }
        }
    }

    #[test]
    fn grace_period_stays_within_bounds() {
        let lease = Duration::from_secs(100);
        for _ in 0..100 {
            let wait = grace_period(lease);
            assert!(wait >= Duration::from_secs(70) && wait <= Duration::from_secs(90));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_until_the_host_stops_extending() {
        // GIVEN: a renewable 100s lease and a host that extends once, then caps
        let renewer = Scripted::new(vec![
            Ok(lease("pxa_t", 100, true)),
            Ok(lease("pxa_t", 0, true)),
        ]);

        // WHEN: the watcher runs
        let mut handle =
            LifetimeWatcher::start(renewer.clone(), &lease("pxa_t", 100, true), CancellationToken::new());

        // THEN: two renewals are reported and the watcher finishes cleanly
        let first = handle.renew_rx.recv().await.unwrap();
        assert_eq!(first.lease_duration, Duration::from_secs(100));
        let second = handle.renew_rx.recv().await.unwrap();
        assert_eq!(second.lease_duration, Duration::ZERO);
        assert!((&mut handle.done_rx).await.unwrap().is_ok());
        assert_eq!(renewer.calls.lock()[0], ("pxa_t".to_string(), Some(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_finish_with_an_error() {
        // GIVEN: a host that refuses every renewal
        let renewer = Scripted::new(Vec::new());

        // WHEN: the watcher runs
        let handle = LifetimeWatcher::start(renewer.clone(), &lease("pxa_t", 10, true), CancellationToken::new());

        // THEN: three attempts are made and the watcher reports the failure
        assert!(handle.done_rx.await.unwrap().is_err());
        assert_eq!(renewer.calls.lock().len(), RENEW_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn non_renewable_tokens_finish_without_calling_the_host() {
        let renewer = Scripted::new(Vec::new());

        let handle = LifetimeWatcher::start(renewer.clone(), &lease("pxa_t", 30, false), CancellationToken::new());

        assert!(handle.done_rx.await.unwrap().is_ok());
        assert!(renewer.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_watcher() {
        let renewer = Scripted::new(Vec::new());
        let handle = LifetimeWatcher::start(renewer.clone(), &lease("pxa_t", 3600, true), CancellationToken::new());

        handle.stop();

        assert!(handle.done_rx.await.unwrap().is_ok());
        assert!(renewer.calls.lock().is_empty());
    }
}
