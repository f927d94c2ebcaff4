//! Client-certificate method.
//!
//! Tracks the certificate, key and optional CA files with a
//! [`RateLimitedWatcher`]; every coalesced change triggers a re-authentication
//! so a rotated certificate is picked up without restarting the agent. The
//! files are re-read on each login and presented as the connection's client
//! identity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Options;
use crate::agent::method::{AuthConfig, AuthMethod, ClientTls, CredsSignal, LoginRequest};
use crate::watcher::{FileWatcher, RateLimitedWatcher};
use crate::{Error, Result};

/// Coalesce window when `reload_interval` is not set.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Logs in with a client certificate and reloads it when it changes.
pub struct CertMethod {
    mount: String,
    name: Option<String>,
    client_cert: PathBuf,
    client_key: PathBuf,
    ca_cert: Option<PathBuf>,
    files: Vec<PathBuf>,
    watcher: RateLimitedWatcher,
    signal: CredsSignal,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CertMethod {
    /// Build the method and start watching its files. Must be called inside a
    /// tokio runtime.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let opts = Options::new(config);
        let name = opts.string("name")?.filter(|n| !n.is_empty());
        let client_cert = PathBuf::from(opts.required_string("client_cert")?);
        let client_key = PathBuf::from(opts.required_string("client_key")?);
        let ca_cert = opts
            .string("ca_cert")?
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let mut files = vec![client_cert.clone(), client_key.clone()];
        files.extend(ca_cert.clone());
        let reload_interval = opts
            .duration("reload_interval")?
            .unwrap_or(DEFAULT_RELOAD_INTERVAL);

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("cert method started outside a tokio runtime".to_string()))?;

        let watcher = RateLimitedWatcher::new(FileWatcher::new()?, reload_interval);
        for file in &files {
            watcher.add(file)?;
        }
        let stop = CancellationToken::new();
        watcher.start(&stop)?;
        let events = watcher
            .events()
            .ok_or_else(|| Error::Watcher("cert watcher produced no events channel".to_string()))?;

        let signal = CredsSignal::new();
        let task = runtime.spawn(forward_changes(events, signal.sender()));

        Ok(Self {
            mount: config.mount_path(),
            name,
            client_cert,
            client_key,
            ca_cert,
            files,
            watcher,
            signal,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    /// Files being watched.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Current certificate, key and CA as login TLS material.
    async fn load_tls(&self) -> Result<ClientTls> {
        let mut identity_pem = read_pem(&self.client_cert).await?;
        if !identity_pem.ends_with(b"\n") {
            identity_pem.push(b'\n');
        }
        identity_pem.extend(read_pem(&self.client_key).await?);
        let ca_pem = match &self.ca_cert {
            Some(path) => Some(read_pem(path).await?),
            None => None,
        };
        Ok(ClientTls { identity_pem, ca_pem })
    }
}

async fn forward_changes(
    mut events: mpsc::Receiver<crate::watcher::FileWatcherEvent>,
    creds_tx: mpsc::Sender<()>,
) {
    while let Some(event) = events.recv().await {
        info!(files = ?event.filenames, "Certificate files changed, requesting re-authentication");
        let _ = creds_tx.try_send(());
    }
    debug!("Certificate watcher closed");
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::Method(format!("cannot read {}: {e}", path.display())))
}

#[async_trait::async_trait]
impl AuthMethod for CertMethod {
    async fn authenticate(&self) -> Result<LoginRequest> {
        let tls = self.load_tls().await?;
        let mut data = Map::new();
        if let Some(name) = &self.name {
            data.insert("name".to_string(), Value::String(name.clone()));
        }
        Ok(LoginRequest::new(format!("{}/login", self.mount), Value::Object(data)).with_tls(tls))
    }

    fn new_creds(&self) -> Option<mpsc::Receiver<()>> {
        self.signal.take_receiver()
    }

    async fn shutdown(&self) {
        self.stop.cancel();
        self.watcher.stop().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))).unwrap()
    }

    fn write_files(dir: &Path) -> (PathBuf, PathBuf) {
        let cert = dir.join("client.crt");
        let key = dir.join("client.key");
        std::fs::write(&cert, fixture("client-a.crt")).unwrap();
        std::fs::write(&key, fixture("client-a.key")).unwrap();
        (cert, key)
    }

    fn identity(cert: &str, key: &str) -> Vec<u8> {
        let mut pem = fixture(cert);
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend(fixture(key));
        pem
    }

    #[tokio::test]
    async fn authenticate_presents_current_files_and_sends_name() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_files(dir.path());
        let ca = dir.path().join("ca.crt");
        std::fs::write(&ca, fixture("ca.crt")).unwrap();
        let method = CertMethod::new(&AuthConfig::new(
            "cert",
            json!({"name": "web", "client_cert": cert, "client_key": key, "ca_cert": ca}),
        ))
        .unwrap();

        let request = method.authenticate().await.unwrap();
        assert_eq!(request.path, "auth/cert/login");
        assert_eq!(Value::Object(request.data), json!({"name": "web"}));
        let tls = request.tls.unwrap();
        assert_eq!(tls.identity_pem, identity("client-a.crt", "client-a.key"));
        assert_eq!(tls.ca_pem, Some(fixture("ca.crt")));

        std::fs::remove_file(&key).unwrap();
        assert!(matches!(method.authenticate().await, Err(Error::Method(_))));
        method.shutdown().await;
    }

    #[tokio::test]
    async fn rotated_certificate_is_presented_on_next_login() {
        // GIVEN: a cert method logged in with certificate A
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_files(dir.path());
        let method = CertMethod::new(&AuthConfig::new(
            "cert",
            json!({"client_cert": cert, "client_key": key}),
        ))
        .unwrap();
        let first = method.authenticate().await.unwrap().tls.unwrap();

        // WHEN: the files are rotated to certificate B
        std::fs::write(&cert, fixture("client-b.crt")).unwrap();
        std::fs::write(&key, fixture("client-b.key")).unwrap();

        // THEN: the next login carries B, and the host client accepts it
        let second = method.authenticate().await.unwrap().tls.unwrap();
        assert_eq!(first.identity_pem, identity("client-a.crt", "client-a.key"));
        assert_eq!(second.identity_pem, identity("client-b.crt", "client-b.key"));
        assert!(
            crate::agent::HostClient::new("https://127.0.0.1:8200")
                .unwrap()
                .with_tls(&second)
                .is_ok()
        );
        method.shutdown().await;
    }

    #[tokio::test]
    async fn rotated_certificate_requests_reauthentication() {
        // GIVEN: a cert method with a short reload window
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_files(dir.path());
        let method = CertMethod::new(&AuthConfig::new(
            "cert",
            json!({"client_cert": cert, "client_key": key, "reload_interval": "100ms"}),
        ))
        .unwrap();
        let mut creds = method.new_creds().unwrap();

        // WHEN: both files are rewritten
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&cert, fixture("client-b.crt")).unwrap();
        std::fs::write(&key, fixture("client-b.key")).unwrap();

        // THEN: a re-authentication is requested
        let signal = tokio::time::timeout(Duration::from_secs(5), creds.recv()).await;
        assert_eq!(signal.unwrap(), Some(()));
        method.shutdown().await;
    }

    #[test]
    fn cert_and_key_are_required() {
        let err = CertMethod::new(&AuthConfig::new("cert", json!({"client_cert": "/tmp/c"})))
            .err()
            .unwrap();
        assert!(err.to_string().contains("client_key"));
    }
}
