//! Destination side of a synchronization.
//!
//! Each handler takes the file lock, decides the push against the local
//! ledger (`conflict::check_incoming`) and applies it in one critical
//! section, so version checks and writes cannot interleave with other
//! mutations of the same file. The resulting report is stored under
//! `syncResult-<file>` and returned to the source.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use rdsync_core::metadata::{CONTENT_HASH, DELETED, ETAG, RENAME};
use rdsync_core::{
    Metadata, NeedType, RdsyncError, RdsyncResult, ServerInfo, SynchronizationAction,
    SynchronizationDirection, SynchronizationReport, SynchronizationType,
};
use rdsync_storage::config_ext::set_config_value;
use tracing::{debug, error, info, warn};

use crate::conflict::{self, IncomingDecision};
use crate::engine::{sync_result_config_name, SyncEngine};
use crate::files::{content_hash, is_tombstone, new_etag};
use crate::history;
use crate::multipart::PartReader;
use crate::state::{Attempt, SyncState};

fn apply_error(message: impl Into<String>) -> RdsyncError {
    RdsyncError::Transfer {
        message: message.into(),
        source: None,
    }
}

/// Consume what is left of a push that will not be applied.
async fn drain(parts: &mut dyn PartReader) {
    loop {
        match parts.next_part().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!("discarding rest of refused push: {e}");
                break;
            }
        }
    }
}

/// Metadata the destination stores for an accepted push: the source's user
/// entries and ledger on top of `base`, a fresh ETag, no conflict flag.
fn incoming_metadata_for(base: Metadata, incoming: &Metadata) -> RdsyncResult<Metadata> {
    let mut meta = base;
    meta.replace_user_entries(incoming);
    history::adopt(&mut meta, incoming)?;
    meta.remove(DELETED);
    meta.remove(RENAME);
    meta.insert(ETAG, new_etag());
    Ok(meta)
}

impl SyncEngine {
    /// Raw local metadata, tombstones included.
    pub async fn metadata(&self, file: &str) -> RdsyncResult<Option<Metadata>> {
        let _guard = self.storage().lock_file(file).await;
        self.storage().get_metadata(file).await
    }

    /// Signature of the local content; empty when there is none.
    pub async fn local_signature(&self, file: &str) -> RdsyncResult<Vec<u8>> {
        let _guard = self.storage().lock_file(file).await;
        match self.storage().get_metadata(file).await? {
            Some(meta) if !is_tombstone(&meta) => {}
            _ => return Ok(Vec::new()),
        }
        match self.storage().read_content(file).await? {
            Some(content) => self.signatures.compute(&mut Cursor::new(content)).await,
            None => Ok(Vec::new()),
        }
    }

    fn begin_incoming(&self, source: &ServerInfo, file: &str, sync_type: SynchronizationType) -> Attempt {
        let attempt = self.active.begin(
            file,
            &source.url,
            SynchronizationDirection::Incoming,
            SyncState::Transferring,
        );
        attempt.set_type(sync_type);
        attempt
    }

    async fn finish_incoming(
        &self,
        file: &str,
        sync_type: SynchronizationType,
        mut attempt: Attempt,
        outcome: RdsyncResult<SynchronizationReport>,
    ) -> SynchronizationReport {
        let report = match outcome {
            Ok(report) => {
                let state = if report.is_conflicted() {
                    SyncState::Conflicted
                } else {
                    SyncState::Completed
                };
                if let Err(e) = attempt.transition(state) {
                    warn!(file, "{e}");
                }
                report
            }
            Err(e) => {
                attempt.fail();
                error!(file, error = %e.chain_message(), "incoming synchronization failed");
                SynchronizationReport::failed(file, sync_type, &e)
            }
        };

        if let Err(e) = set_config_value(self.storage().as_ref(), &sync_result_config_name(file), &report).await {
            warn!(file, "storing synchronization report failed: {e}");
        }
        self.publish(file, SynchronizationAction::Finish, sync_type, SynchronizationDirection::Incoming)
            .await;
        report
    }

    /// Apply a content push, rebuilding the file from the local seed and the
    /// received parts.
    pub async fn incoming_content(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        parts: &mut dyn PartReader,
    ) -> SynchronizationReport {
        let sync_type = SynchronizationType::ContentUpdate;
        let mut attempt = self.begin_incoming(source, file, sync_type);
        self.publish(file, SynchronizationAction::Start, sync_type, SynchronizationDirection::Incoming)
            .await;
        let outcome = self.apply_content(source, file, metadata, parts, &mut attempt).await;
        self.finish_incoming(file, sync_type, attempt, outcome).await
    }

    async fn apply_content(
        &self,
        source: &ServerInfo,
        file: &str,
        incoming: &Metadata,
        parts: &mut dyn PartReader,
        attempt: &mut Attempt,
    ) -> RdsyncResult<SynchronizationReport> {
        let storage = self.storage().as_ref();
        let _guard = storage.lock_file(file).await;
        let local = storage.get_metadata(file).await?;

        let resolved = match conflict::check_incoming(storage, file, local.as_ref(), source, incoming).await? {
            IncomingDecision::Conflict(item) => {
                drain(parts).await;
                attempt.transition(SyncState::ApplyingOnDestination)?;
                return Ok(SynchronizationReport::conflicted(
                    SynchronizationType::ContentUpdate,
                    item,
                ));
            }
            IncomingDecision::UpToDate => {
                drain(parts).await;
                attempt.transition(SyncState::ApplyingOnDestination)?;
                debug!(file, "content already up to date");
                let mut report = SynchronizationReport::new(file, SynchronizationType::ContentUpdate);
                report.bytes_copied = self.held_length(file, local.as_ref()).await?;
                report.file_etag = local.as_ref().and_then(|m| m.get(ETAG)).map(str::to_string);
                return Ok(report);
            }
            IncomingDecision::Accept { resolved } => resolved,
        };

        let seed = match &local {
            Some(meta) if !is_tombstone(meta) => storage.read_content(file).await?.unwrap_or_default(),
            _ => Bytes::new(),
        };

        let mut rebuilt = BytesMut::new();
        let mut report = SynchronizationReport::new(file, SynchronizationType::ContentUpdate);
        while let Some(part) = parts.next_part().await? {
            let need = part.need;
            if need.file_offset != rebuilt.len() as u64 {
                return Err(apply_error(format!(
                    "part at offset {} does not continue the file at {}",
                    need.file_offset,
                    rebuilt.len()
                )));
            }
            match need.block_type {
                NeedType::FromSeed => {
                    let start = usize::try_from(need.seed_offset).unwrap_or(usize::MAX);
                    let end = start.saturating_add(usize::try_from(need.block_length).unwrap_or(usize::MAX));
                    if end > seed.len() {
                        return Err(apply_error(format!(
                            "seed block {}+{} is outside the local copy of {} bytes",
                            need.seed_offset,
                            need.block_length,
                            seed.len()
                        )));
                    }
                    rebuilt.extend_from_slice(&seed[start..end]);
                    report.bytes_copied += need.block_length;
                }
                NeedType::FromSource => {
                    if part.data.len() as u64 != need.block_length {
                        return Err(apply_error(format!(
                            "source part at {} carries {} bytes, expected {}",
                            need.file_offset,
                            part.data.len(),
                            need.block_length
                        )));
                    }
                    rebuilt.extend_from_slice(&part.data);
                    report.bytes_transferred += need.block_length;
                }
            }
        }
        attempt.transition(SyncState::ApplyingOnDestination)?;

        let content = rebuilt.freeze();
        let hash = content_hash(&content);
        if let Some(expected) = incoming.content_hash() {
            if expected != hash {
                return Err(apply_error(format!(
                    "rebuilt content hash {hash} does not match {expected}"
                )));
            }
        }

        let mut meta = incoming_metadata_for(Metadata::new(), incoming)?;
        meta.insert(CONTENT_HASH, hash);
        if resolved || local.as_ref().is_some_and(Metadata::is_conflicted) {
            conflict::clear(storage, file, &mut meta).await?;
        }
        let size = content.len();
        storage.write_content(file, content).await?;
        storage.set_metadata(file, &meta).await?;

        report.file_etag = meta.get(ETAG).map(str::to_string);
        info!(
            file,
            source = %source.url,
            bytes = size,
            bytes_copied = report.bytes_copied,
            bytes_transferred = report.bytes_transferred,
            "content synchronized"
        );
        Ok(report)
    }

    /// Apply a metadata-only push. Content stays as it is.
    pub async fn incoming_metadata(&self, source: &ServerInfo, file: &str, metadata: &Metadata) -> SynchronizationReport {
        let sync_type = SynchronizationType::MetadataUpdate;
        let attempt = self.begin_incoming(source, file, sync_type);
        self.publish(file, SynchronizationAction::Start, sync_type, SynchronizationDirection::Incoming)
            .await;
        let outcome = self.apply_metadata(source, file, metadata).await;
        self.finish_applied(file, sync_type, attempt, outcome).await
    }

    async fn apply_metadata(&self, source: &ServerInfo, file: &str, incoming: &Metadata) -> RdsyncResult<SynchronizationReport> {
        let sync_type = SynchronizationType::MetadataUpdate;
        let storage = self.storage().as_ref();
        let _guard = storage.lock_file(file).await;
        let local = storage.get_metadata(file).await?;

        let resolved = match self.decide(source, file, local.as_ref(), incoming, sync_type).await? {
            Ok(resolved) => resolved,
            Err(refused) => return Ok(refused),
        };
        let local = local
            .filter(|m| !is_tombstone(m))
            .ok_or_else(|| RdsyncError::FileNotFound(file.to_string()))?;

        let was_conflicted = local.is_conflicted();
        let mut meta = incoming_metadata_for(local, incoming)?;
        if resolved || was_conflicted {
            conflict::clear(storage, file, &mut meta).await?;
        }
        storage.set_metadata(file, &meta).await?;

        let mut report = SynchronizationReport::new(file, sync_type);
        report.file_etag = meta.get(ETAG).map(str::to_string);
        report.bytes_copied = self.held_length(file, Some(&meta)).await?;
        info!(file, source = %source.url, "metadata synchronized");
        Ok(report)
    }

    /// Apply a rename push. `metadata` is the source's tombstone for `file`.
    pub async fn incoming_rename(&self, source: &ServerInfo, file: &str, metadata: &Metadata) -> SynchronizationReport {
        let sync_type = SynchronizationType::Rename;
        let attempt = self.begin_incoming(source, file, sync_type);
        self.publish(file, SynchronizationAction::Start, sync_type, SynchronizationDirection::Incoming)
            .await;
        let outcome = self.apply_rename(source, file, metadata).await;
        self.finish_applied(file, sync_type, attempt, outcome).await
    }

    async fn apply_rename(&self, source: &ServerInfo, file: &str, incoming: &Metadata) -> RdsyncResult<SynchronizationReport> {
        let sync_type = SynchronizationType::Rename;
        let target = incoming
            .rename_target()
            .filter(|t| !t.is_empty() && *t != file)
            .ok_or_else(|| apply_error(format!("rename of {file} carries no target")))?
            .to_string();

        let storage = self.storage().as_ref();
        let (first, second) = if file < target.as_str() { (file, target.as_str()) } else { (target.as_str(), file) };
        let _first = storage.lock_file(first).await;
        let _second = storage.lock_file(second).await;
        let local = storage.get_metadata(file).await?;

        let resolved = match self.decide(source, file, local.as_ref(), incoming, sync_type).await? {
            Ok(resolved) => resolved,
            Err(refused) => return Ok(refused),
        };
        let local = local
            .filter(|m| !is_tombstone(m))
            .ok_or_else(|| RdsyncError::FileNotFound(file.to_string()))?;
        if let Some(existing) = storage.get_metadata(&target).await? {
            if !is_tombstone(&existing) {
                return Err(RdsyncError::AlreadyExists(target));
            }
        }
        let content = storage
            .read_content(file)
            .await?
            .ok_or_else(|| RdsyncError::FileNotFound(file.to_string()))?;

        let was_conflicted = local.is_conflicted();
        let mut moved = incoming_metadata_for(local, incoming)?;
        if resolved || was_conflicted {
            conflict::clear(storage, file, &mut moved).await?;
        }
        let mut tombstone = moved.clone();
        tombstone.insert(RENAME, target.as_str());

        storage.write_content(&target, content).await?;
        storage.set_metadata(&target, &moved).await?;
        storage.delete_content(file).await?;
        storage.set_metadata(file, &tombstone).await?;

        let mut report = SynchronizationReport::new(file, sync_type);
        report.file_etag = moved.get(ETAG).map(str::to_string);
        info!(from = file, to = %target, source = %source.url, "rename synchronized");
        Ok(report)
    }

    /// Apply a delete push, leaving a tombstone.
    pub async fn incoming_delete(&self, source: &ServerInfo, file: &str, metadata: &Metadata) -> SynchronizationReport {
        let sync_type = SynchronizationType::Delete;
        let attempt = self.begin_incoming(source, file, sync_type);
        self.publish(file, SynchronizationAction::Start, sync_type, SynchronizationDirection::Incoming)
            .await;
        let outcome = self.apply_delete(source, file, metadata).await;
        self.finish_applied(file, sync_type, attempt, outcome).await
    }

    async fn apply_delete(&self, source: &ServerInfo, file: &str, incoming: &Metadata) -> RdsyncResult<SynchronizationReport> {
        let sync_type = SynchronizationType::Delete;
        let storage = self.storage().as_ref();
        let _guard = storage.lock_file(file).await;
        let local = storage.get_metadata(file).await?;

        let resolved = match self.decide(source, file, local.as_ref(), incoming, sync_type).await? {
            Ok(resolved) => resolved,
            Err(refused) => return Ok(refused),
        };

        let was_conflicted = local.as_ref().is_some_and(Metadata::is_conflicted);
        let mut tombstone = incoming_metadata_for(local.unwrap_or_default(), incoming)?;
        tombstone.insert(DELETED, "true");
        if resolved || was_conflicted {
            conflict::clear(storage, file, &mut tombstone).await?;
        }
        storage.delete_content(file).await?;
        storage.set_metadata(file, &tombstone).await?;

        info!(file, source = %source.url, "delete synchronized");
        Ok(SynchronizationReport::new(file, sync_type))
    }

    /// `Ok(resolved)` when the push may be applied, `Err(report)` when it is
    /// refused as conflicting or already known.
    async fn decide(
        &self,
        source: &ServerInfo,
        file: &str,
        local: Option<&Metadata>,
        incoming: &Metadata,
        sync_type: SynchronizationType,
    ) -> RdsyncResult<Result<bool, SynchronizationReport>> {
        let storage = self.storage().as_ref();
        Ok(match conflict::check_incoming(storage, file, local, source, incoming).await? {
            IncomingDecision::Accept { resolved } => Ok(resolved),
            IncomingDecision::Conflict(item) => {
                Err(SynchronizationReport::conflicted(sync_type, item))
            }
            IncomingDecision::UpToDate => {
                debug!(file, sync_type = sync_type.as_str(), "already up to date");
                let mut report = SynchronizationReport::new(file, sync_type);
                report.file_etag = local.and_then(|m| m.get(ETAG)).map(str::to_string);
                if sync_type == SynchronizationType::MetadataUpdate {
                    report.bytes_copied = self.held_length(file, local).await?;
                }
                Err(report)
            }
        })
    }

    /// Length of the content already stored for `file`. A push that needs
    /// none of the source's bytes reports all of it as copied from the seed.
    async fn held_length(&self, file: &str, local: Option<&Metadata>) -> RdsyncResult<u64> {
        match local {
            Some(meta) if !is_tombstone(meta) => Ok(self
                .storage()
                .read_content(file)
                .await?
                .map_or(0, |content| content.len() as u64)),
            _ => Ok(0),
        }
    }

    /// Finish a push that carried no parts: the attempt passes through
    /// ApplyingOnDestination before its terminal state.
    async fn finish_applied(
        &self,
        file: &str,
        sync_type: SynchronizationType,
        mut attempt: Attempt,
        outcome: RdsyncResult<SynchronizationReport>,
    ) -> SynchronizationReport {
        if outcome.is_ok() {
            if let Err(e) = attempt.transition(SyncState::ApplyingOnDestination) {
                warn!(file, "{e}");
            }
        }
        self.finish_incoming(file, sync_type, attempt, outcome).await
    }
}
