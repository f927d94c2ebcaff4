//! Issued leases.
//!
//! Leases are indexed by their opaque client token. A background reaper drops
//! expired ones every 60 seconds; lookups treat an expired lease as absent even
//! before the reaper gets to it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{Secret, SecretAuth};
use crate::backend::{BackendSettings, LeaseAuth};

const REAP_INTERVAL: Duration = Duration::from_secs(60);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// A lease handed out by the host.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    /// Opaque client token (`pxa_<base64>`)
    pub token: String,
    /// UUID v4 accessor
    pub accessor: String,
    /// Auth bundle returned by the backend
    pub auth: LeaseAuth,
    /// Issued-at (Unix epoch seconds)
    pub issued_at: u64,
    /// Current expiry (Unix epoch seconds)
    pub expires_at: u64,
    /// Hard limit the lease can never be renewed past; `None` for periodic leases
    pub max_expires_at: Option<u64>,
}

impl LeaseRecord {
    /// Mint a lease for `auth`, applying host defaults to zero TTLs.
    #[must_use]
    pub fn issue(auth: LeaseAuth, settings: &BackendSettings) -> Self {
        let issued_at = now_secs();
        let max_ttl = effective_max_ttl(&auth, settings);
        let ttl = effective_ttl(&auth, settings, None);
        let mut record = Self {
            token: generate_token(),
            accessor: uuid::Uuid::new_v4().to_string(),
            issued_at,
            expires_at: issued_at,
            max_expires_at: (auth.period == 0).then_some(issued_at + max_ttl),
            auth,
        };
        record.extend(ttl, issued_at);
        record
    }

    /// Apply a renewal: replace the auth bundle and push the expiry out.
    pub fn renew(&mut self, auth: LeaseAuth, settings: &BackendSettings, increment: Option<u64>) {
        let ttl = effective_ttl(&auth, settings, increment);
        if auth.period > 0 {
            self.max_expires_at = None;
        }
        self.auth = auth;
        self.extend(ttl, now_secs());
    }

    fn extend(&mut self, ttl: u64, now: u64) {
        let wanted = now + ttl;
        self.expires_at = self.max_expires_at.map_or(wanted, |limit| wanted.min(limit));
    }

    /// Seconds left on the lease.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.expires_at.saturating_sub(now_secs())
    }

    /// Returns `true` once the lease has run out.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }

    /// The login/renew answer for this lease.
    #[must_use]
    pub fn to_secret(&self) -> Secret {
        Secret {
            auth: Some(SecretAuth {
                client_token: self.token.clone(),
                accessor: self.accessor.clone(),
                policies: self.auth.policies.clone(),
                metadata: self.auth.metadata.clone(),
                lease_duration: self.remaining(),
                renewable: self.auth.renewable,
            }),
            ..Secret::default()
        }
    }

    /// The lookup-self answer for this lease.
    #[must_use]
    pub fn lookup_data(&self) -> Value {
        json!({
            "accessor": self.accessor,
            "display_name": self.auth.display_name,
            "policies": self.auth.policies,
            "meta": self.auth.metadata,
            "ttl": self.remaining(),
            "period": self.auth.period,
            "renewable": self.auth.renewable,
            "creation_time": self.issued_at,
            "expire_time": self.expires_at,
            "bound_cidrs": self.auth.bound_cidrs,
        })
    }
}

fn effective_max_ttl(auth: &LeaseAuth, settings: &BackendSettings) -> u64 {
    let system_max = settings.system_max_ttl.as_secs();
    match auth.max_ttl {
        0 => system_max,
        max => max.min(system_max),
    }
}

fn effective_ttl(auth: &LeaseAuth, settings: &BackendSettings, increment: Option<u64>) -> u64 {
    if auth.period > 0 {
        return auth.period;
    }
    let ttl = match (increment, auth.ttl) {
        (Some(requested), _) if requested > 0 => requested,
        (_, 0) => settings.system_default_ttl.as_secs(),
        (_, ttl) => ttl,
    };
    ttl.min(effective_max_ttl(auth, settings))
}

/// Generate a random opaque client token: `pxa_<43-char URL-safe base64>`.
#[must_use]
pub fn generate_token() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!(
        "pxa_{}",
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, random_bytes)
    )
}

/// Lease table keyed by client token.
#[derive(Default)]
pub struct LeaseStore {
    by_token: DashMap<String, LeaseRecord>,
}

impl LeaseStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly issued lease.
    pub fn insert(&self, record: LeaseRecord) {
        debug!(accessor = %record.accessor, "Lease stored");
        self.by_token.insert(record.token.clone(), record);
    }

    /// Look up a live lease.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<LeaseRecord> {
        let record = self.by_token.get(token)?.clone();
        if record.is_expired() {
            self.by_token.remove(token);
            return None;
        }
        Some(record)
    }

    /// Apply a renewal to the stored lease in place and return the result.
    ///
    /// The entry stays locked while it is modified, so concurrent renewals of
    /// one token apply one after the other. Returns `None` when the lease is
    /// gone or expired; a renewal never brings it back.
    pub fn renew(
        &self,
        token: &str,
        auth: LeaseAuth,
        settings: &BackendSettings,
        increment: Option<u64>,
    ) -> Option<LeaseRecord> {
        let mut record = self.by_token.get_mut(token)?;
        if record.is_expired() {
            drop(record);
            self.by_token.remove(token);
            return None;
        }
        record.renew(auth, settings, increment);
        Some(record.clone())
    }

    /// Number of stored leases, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Returns `true` when no lease is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Drop every expired lease; returns how many went.
    pub fn reap_expired(&self) -> usize {
        let before = self.by_token.len();
        self.by_token.retain(|_, record| !record.is_expired());
        let reaped = before.saturating_sub(self.by_token.len());
        if reaped > 0 {
            debug!(count = reaped, "Reaped expired leases");
        }
        reaped
    }

    /// Run [`reap_expired`](Self::reap_expired) every minute until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        store.reap_expired();
                    }
                }
            }
        })
    }
}
