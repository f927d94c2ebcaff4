//! Backend storage, the host's key/value interface.
//!
//! The [`Storage`] trait is what the host hands the backend. Values are
//! opaque bytes; the backend encodes its records as JSON through
//! [`get_json`] / [`put_json`]. [`InMemoryStorage`] is a `DashMap`-backed
//! implementation used by the HTTP host and the tests.

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Key/value store provided by the host.
///
/// Implementations must give linearizable single-key reads and writes.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Fetch the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the immediate children of `prefix`, sorted.
    ///
    /// Nested keys are reported once as `child/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory storage backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter_map(|e| {
                let rest = e.key().strip_prefix(prefix)?;
                match rest.split_once('/') {
                    Some((child, _)) => Some(format!("{child}/")),
                    None => Some(rest.to_string()),
                }
            })
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Read and decode a JSON record.
pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    let Some(raw) = storage.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| Error::Storage(format!("failed to decode {key}: {e}")))
}

/// Encode and write a JSON record.
pub async fn put_json<T: Serialize + Sync>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let raw =
        serde_json::to_vec(value).map_err(|e| Error::Storage(format!("failed to encode {key}: {e}")))?;
    storage.put(key, raw).await
}
