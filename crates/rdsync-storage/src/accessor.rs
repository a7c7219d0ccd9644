//! Storage accessor: the single collaborator every synchronization step
//! reads and writes through.
//!
//! Layout inside the operator (names are hex-encoded so any file name is a
//! valid object key and prefix ordering is preserved):
//!
//! ```text
//! files/{hex(name)}      raw content
//! metadata/{hex(name)}   JSON metadata map
//! config/{hex(name)}     JSON config map
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use rdsync_core::{Metadata, RdsyncError, RdsyncResult};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// A named config entry: string keys to string values.
pub type ConfigMap = BTreeMap<String, String>;

const FILES: &str = "files/";
const METADATA: &str = "metadata/";
const CONFIG: &str = "config/";

#[async_trait]
pub trait StorageAccessor: Send + Sync {
    /// Open the file's content as a stream. Missing files are `FileNotFound`.
    async fn content_for_reading(&self, name: &str)
        -> RdsyncResult<Box<dyn AsyncRead + Send + Unpin>>;

    async fn read_content(&self, name: &str) -> RdsyncResult<Option<Bytes>>;
    async fn write_content(&self, name: &str, content: Bytes) -> RdsyncResult<()>;
    async fn delete_content(&self, name: &str) -> RdsyncResult<()>;

    async fn get_metadata(&self, name: &str) -> RdsyncResult<Option<Metadata>>;
    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> RdsyncResult<()>;
    async fn delete_metadata(&self, name: &str) -> RdsyncResult<()>;

    async fn get_config(&self, name: &str) -> RdsyncResult<Option<ConfigMap>>;
    async fn set_config(&self, name: &str, config: &ConfigMap) -> RdsyncResult<()>;
    async fn delete_config(&self, name: &str) -> RdsyncResult<()>;

    /// Config entries whose name starts with `prefix`, ordered by name.
    async fn configs_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> RdsyncResult<Vec<(String, ConfigMap)>>;

    /// Names of every file that has metadata, tombstones included.
    async fn list_files(&self) -> RdsyncResult<Vec<String>>;

    /// Serialize mutations of one file. The guard holds the lock until dropped.
    async fn lock_file(&self, name: &str) -> OwnedMutexGuard<()>;
}

/// Per-name async locks, created on demand.
#[derive(Debug, Default)]
struct FileLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() > 1024 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct OpendalAccessor {
    op: Operator,
    locks: FileLocks,
}

impl OpendalAccessor {
    pub fn new(op: Operator) -> Self {
        OpendalAccessor {
            op,
            locks: FileLocks::default(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn read_key(&self, key: &str) -> RdsyncResult<Option<Bytes>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_bytes())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RdsyncError::Storage(format!("reading {key}: {e}"))),
        }
    }

    async fn write_key(&self, key: &str, bytes: impl Into<opendal::Buffer>) -> RdsyncResult<()> {
        self.op
            .write(key, bytes.into())
            .await
            .map(|_| ())
            .map_err(|e| RdsyncError::Storage(format!("writing {key}: {e}")))
    }

    async fn delete_key(&self, key: &str) -> RdsyncResult<()> {
        self.op
            .delete(key)
            .await
            .map_err(|e| RdsyncError::Storage(format!("deleting {key}: {e}")))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> RdsyncResult<Option<T>> {
        match self.read_key(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RdsyncError::Storage(format!("decoding {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn write_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> RdsyncResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| RdsyncError::Storage(format!("encoding {key}: {e}")))?;
        self.write_key(key, bytes).await
    }

    /// Decoded names of every object directly under `dir`.
    async fn list_names(&self, dir: &str) -> RdsyncResult<Vec<String>> {
        let entries = match self.op.list(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RdsyncError::Storage(format!("listing {dir}: {e}"))),
        };

        let mut names: Vec<String> = entries
            .iter()
            .map(|entry| entry.name())
            .filter(|name| !name.is_empty() && !name.ends_with('/'))
            .filter_map(|name| match decode_name(name) {
                Some(decoded) => Some(decoded),
                None => {
                    warn!(dir, object = name, "skipping object with undecodable name");
                    None
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl StorageAccessor for OpendalAccessor {
    async fn content_for_reading(
        &self,
        name: &str,
    ) -> RdsyncResult<Box<dyn AsyncRead + Send + Unpin>> {
        let path = key(FILES, name);
        let open_error = |e: opendal::Error| match e.kind() {
            ErrorKind::NotFound => RdsyncError::FileNotFound(name.to_string()),
            _ => RdsyncError::Storage(format!("opening {path}: {e}")),
        };
        // The stat behind an unbounded range reports a missing object.
        let stream = self
            .op
            .reader(&path)
            .await
            .map_err(open_error)?
            .into_bytes_stream(..)
            .await
            .map_err(open_error)?;
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn read_content(&self, name: &str) -> RdsyncResult<Option<Bytes>> {
        self.read_key(&key(FILES, name)).await
    }

    async fn write_content(&self, name: &str, content: Bytes) -> RdsyncResult<()> {
        debug!(file = name, bytes = content.len(), "writing content");
        self.write_key(&key(FILES, name), content).await
    }

    async fn delete_content(&self, name: &str) -> RdsyncResult<()> {
        self.delete_key(&key(FILES, name)).await
    }

    async fn get_metadata(&self, name: &str) -> RdsyncResult<Option<Metadata>> {
        self.read_json(&key(METADATA, name)).await
    }

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> RdsyncResult<()> {
        self.write_json(&key(METADATA, name), metadata).await
    }

    async fn delete_metadata(&self, name: &str) -> RdsyncResult<()> {
        self.delete_key(&key(METADATA, name)).await
    }

    async fn get_config(&self, name: &str) -> RdsyncResult<Option<ConfigMap>> {
        self.read_json(&key(CONFIG, name)).await
    }

    async fn set_config(&self, name: &str, config: &ConfigMap) -> RdsyncResult<()> {
        self.write_json(&key(CONFIG, name), config).await
    }

    async fn delete_config(&self, name: &str) -> RdsyncResult<()> {
        self.delete_key(&key(CONFIG, name)).await
    }

    async fn configs_with_prefix(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> RdsyncResult<Vec<(String, ConfigMap)>> {
        let names = self.list_names(CONFIG).await?;
        let mut out = Vec::new();
        for name in names
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .skip(skip)
            .take(take)
        {
            // Entries can vanish between the listing and the read.
            if let Some(config) = self.get_config(&name).await? {
                out.push((name, config));
            }
        }
        Ok(out)
    }

    async fn list_files(&self) -> RdsyncResult<Vec<String>> {
        self.list_names(METADATA).await
    }

    async fn lock_file(&self, name: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(name).await
    }
}

fn key(dir: &str, name: &str) -> String {
    format!("{dir}{}", hex::encode(name))
}

fn decode_name(encoded: &str) -> Option<String> {
    String::from_utf8(hex::decode(encoded).ok()?).ok()
}
