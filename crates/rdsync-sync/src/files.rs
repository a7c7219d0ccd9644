//! Local file mutations: upload, metadata update, rename, delete.
//!
//! Every mutation runs under the file's lock, bumps the ledger and issues a
//! fresh ETag. Rename and delete leave a tombstone at the old name so the
//! change can later be pushed to peers.

use std::sync::Arc;

use bytes::Bytes;
use rdsync_chunks::{hash_bytes, hash_to_hex};
use rdsync_core::metadata::{CONFLICT, CONTENT_HASH, DELETED, ETAG, RENAME};
use rdsync_core::{Metadata, RdsyncError, RdsyncResult};
use rdsync_storage::StorageAccessor;
use tracing::{debug, info};

use crate::history;

pub fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn content_hash(content: &[u8]) -> String {
    hash_to_hex(&hash_bytes(content))
}

/// A tombstone is metadata left behind by a delete or a rename.
pub fn is_tombstone(meta: &Metadata) -> bool {
    meta.is_deleted() || meta.rename_target().is_some()
}

pub struct FileStore {
    storage: Arc<dyn StorageAccessor>,
    server_id: String,
    history_limit: Option<usize>,
}

impl FileStore {
    pub fn new(storage: Arc<dyn StorageAccessor>, server_id: impl Into<String>, history_limit: Option<usize>) -> Self {
        FileStore {
            storage,
            server_id: server_id.into(),
            history_limit,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageAccessor> {
        &self.storage
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn history_limit(&self) -> Option<usize> {
        self.history_limit
    }

    /// Raw metadata, tombstones included.
    pub async fn metadata(&self, name: &str) -> RdsyncResult<Option<Metadata>> {
        self.storage.get_metadata(name).await
    }

    /// Metadata of a live file; tombstones count as missing.
    pub async fn live_metadata(&self, name: &str) -> RdsyncResult<Metadata> {
        match self.storage.get_metadata(name).await? {
            Some(meta) if !is_tombstone(&meta) => Ok(meta),
            _ => Err(RdsyncError::FileNotFound(name.to_string())),
        }
    }

    pub async fn download(&self, name: &str) -> RdsyncResult<(Metadata, Bytes)> {
        let _guard = self.storage.lock_file(name).await;
        let meta = self.live_metadata(name).await?;
        let content = self
            .storage
            .read_content(name)
            .await?
            .ok_or_else(|| RdsyncError::FileNotFound(name.to_string()))?;
        Ok((meta, content))
    }

    /// Live file names.
    pub async fn list(&self) -> RdsyncResult<Vec<String>> {
        let mut live = Vec::new();
        for name in self.storage.list_files().await? {
            if let Some(meta) = self.storage.get_metadata(&name).await? {
                if !is_tombstone(&meta) {
                    live.push(name);
                }
            }
        }
        Ok(live)
    }

    /// Create or replace a file. User entries of `metadata` replace the old
    /// ones; reserved entries in it are ignored.
    pub async fn upload(&self, name: &str, metadata: &Metadata, content: Bytes) -> RdsyncResult<Metadata> {
        let _guard = self.storage.lock_file(name).await;
        let previous = self.storage.get_metadata(name).await?;

        let mut meta = Metadata::new();
        meta.replace_user_entries(metadata);
        let version = history::bump(previous.as_ref(), &mut meta, &self.server_id, self.history_limit)?;
        meta.insert(CONTENT_HASH, content_hash(&content));
        meta.insert(ETAG, new_etag());
        if previous.as_ref().is_some_and(Metadata::is_conflicted) {
            meta.insert(CONFLICT, "true");
        }

        let size = content.len();
        self.storage.write_content(name, content).await?;
        self.storage.set_metadata(name, &meta).await?;
        info!(file = name, version = %version, bytes = size, "file uploaded");
        Ok(meta)
    }

    pub async fn update_metadata(&self, name: &str, metadata: &Metadata) -> RdsyncResult<Metadata> {
        let _guard = self.storage.lock_file(name).await;
        let previous = self.live_metadata(name).await?;

        let mut meta = previous.clone();
        meta.replace_user_entries(metadata);
        let version = history::bump(Some(&previous), &mut meta, &self.server_id, self.history_limit)?;
        meta.insert(ETAG, new_etag());

        self.storage.set_metadata(name, &meta).await?;
        debug!(file = name, version = %version, "metadata updated");
        Ok(meta)
    }

    /// Move `from` to `to`, leaving a rename tombstone at `from`.
    pub async fn rename(&self, from: &str, to: &str) -> RdsyncResult<Metadata> {
        if from == to {
            return Err(RdsyncError::AlreadyExists(to.to_string()));
        }
        // Fixed lock order keeps two opposing renames from deadlocking.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let _first = self.storage.lock_file(first).await;
        let _second = self.storage.lock_file(second).await;

        let previous = self.live_metadata(from).await?;
        if let Some(existing) = self.storage.get_metadata(to).await? {
            if !is_tombstone(&existing) {
                return Err(RdsyncError::AlreadyExists(to.to_string()));
            }
        }
        let content = self
            .storage
            .read_content(from)
            .await?
            .ok_or_else(|| RdsyncError::FileNotFound(from.to_string()))?;

        let mut moved = previous.clone();
        moved.remove(DELETED);
        moved.remove(RENAME);
        let version = history::bump(Some(&previous), &mut moved, &self.server_id, self.history_limit)?;
        moved.insert(ETAG, new_etag());

        let mut tombstone = moved.clone();
        tombstone.insert(RENAME, to);

        self.storage.write_content(to, content).await?;
        self.storage.set_metadata(to, &moved).await?;
        self.storage.delete_content(from).await?;
        self.storage.set_metadata(from, &tombstone).await?;
        info!(from, to, version = %version, "file renamed");
        Ok(moved)
    }

    /// Remove content and leave a delete tombstone.
    pub async fn delete(&self, name: &str) -> RdsyncResult<()> {
        let _guard = self.storage.lock_file(name).await;
        let previous = self.live_metadata(name).await?;

        let mut tombstone = previous.clone();
        let version = history::bump(Some(&previous), &mut tombstone, &self.server_id, self.history_limit)?;
        tombstone.insert(DELETED, "true");
        tombstone.insert(ETAG, new_etag());

        self.storage.delete_content(name).await?;
        self.storage.set_metadata(name, &tombstone).await?;
        info!(file = name, version = %version, "file deleted");
        Ok(())
    }
}
