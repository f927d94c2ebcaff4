//! Token sinks.
//!
//! The supervisor publishes each new token once; [`run_sinks`] fans it out to
//! every configured sink, retrying failed writes with backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Default permissions of a token file.
pub const DEFAULT_FILE_MODE: u32 = 0o640;

/// Sink configuration as written in the agent config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink kind; only `file` is built in
    #[serde(rename = "type")]
    pub sink_type: String,
    /// Sink-specific options
    pub config: Map<String, Value>,
}

/// A destination for tokens.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Publish `token`, replacing whatever was published before.
    async fn write(&self, token: &str) -> Result<()>;
}

/// Writes the token to a file via a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    mode: u32,
}

impl FileSink {
    /// Create a sink writing to `path` with `mode` permissions (unix only).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn from_config(config: &Map<String, Value>) -> Result<Self> {
        let path = config
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Config("file sink: 'path' is required".to_string()))?;
        let mode = match config.get("mode") {
            None => DEFAULT_FILE_MODE,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .ok_or_else(|| Error::Config(format!("file sink: invalid mode {n}")))?,
            Some(Value::String(s)) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
                .map_err(|_| Error::Config(format!("file sink: invalid mode {s:?}")))?,
            Some(other) => return Err(Error::Config(format!("file sink: invalid mode {other}"))),
        };
        Ok(Self::new(path, mode))
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn write(&self, token: &str) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::Config(format!("file sink: {} is not a file", self.path.display())))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        tokio::fs::write(&tmp, token).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(self.mode)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Token written");
        Ok(())
    }
}

/// Build the configured sinks.
pub fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Box<dyn Sink>>> {
    configs
        .iter()
        .map(|config| match config.sink_type.as_str() {
            "file" => Ok(Box::new(FileSink::from_config(&config.config)?) as Box<dyn Sink>),
            other => Err(Error::Config(format!("unknown sink type {other:?}"))),
        })
        .collect()
}

/// Deliver tokens from `rx` to every sink until `cancel` fires or the channel
/// closes. With `exit_after_auth`, returns after the first token.
pub async fn run_sinks(
    mut rx: mpsc::Receiver<String>,
    sinks: Vec<Box<dyn Sink>>,
    cancel: CancellationToken,
    exit_after_auth: bool,
) -> Result<()> {
    loop {
        let token = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            token = rx.recv() => match token {
                Some(token) => token,
                None => return Ok(()),
            },
        };

        for sink in &sinks {
            let write = (|| async { sink.write(&token).await })
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(Duration::from_millis(500))
                        .with_max_times(4),
                )
                .sleep(tokio::time::sleep)
                .when(Error::is_retryable)
                .notify(|err, dur| warn!(sink = %sink.describe(), error = %err, retry_in = ?dur, "Sink write failed"));

            let result = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = write => result,
            };
            match result {
                Ok(()) => info!(sink = %sink.describe(), "Token published"),
                Err(e) if exit_after_auth => return Err(e),
                Err(e) => error!(sink = %sink.describe(), error = %e, "Giving up on sink for this token"),
            }
        }

        if exit_after_auth {
            info!("Token written to all sinks, exiting");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink_config(value: Value) -> SinkConfig {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn file_sink_replaces_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let sink = FileSink::new(&path, DEFAULT_FILE_MODE);

        sink.write("pxa_first").await.unwrap();
        sink.write("pxa_second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "pxa_second");
        assert!(!dir.path().join("token.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_sink_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        FileSink::new(&path, 0o600).write("pxa_t").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn build_sinks_reads_path_and_mode() {
        let sinks = build_sinks(&[sink_config(json!({
            "type": "file",
            "config": {"path": "/tmp/pxa-token", "mode": "0600"}
        }))])
        .unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].describe(), "file:/tmp/pxa-token");

        let missing = build_sinks(&[sink_config(json!({"type": "file"}))]);
        assert!(matches!(missing, Err(Error::Config(_))));

        let unknown = build_sinks(&[sink_config(json!({"type": "socket"}))]);
        assert!(matches!(unknown, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn exit_after_auth_stops_after_first_token() {
        // GIVEN: one file sink and a single queued token
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let (tx, rx) = mpsc::channel(1);
        tx.send("pxa_once".to_string()).await.unwrap();

        // WHEN: sinks run with exit_after_auth while the sender stays open
        let sinks: Vec<Box<dyn Sink>> = vec![Box::new(FileSink::new(&path, DEFAULT_FILE_MODE))];
        run_sinks(rx, sinks, CancellationToken::new(), true).await.unwrap();

        // THEN: the token landed and run_sinks returned on its own
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "pxa_once");
        drop(tx);
    }

    #[tokio::test]
    async fn cancel_stops_an_idle_sink_loop() {
        let (_tx, rx) = mpsc::channel::<String>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_sinks(rx, Vec::new(), cancel, false).await.unwrap();
    }
}
