//! Synchronization orchestrator.
//!
//! `SyncEngine::synchronize_to` drives one outgoing attempt for a
//! (file, destination) pair:
//!
//!   1. load local metadata and the destination's view of the file
//!   2. pick the synchronization type (content, metadata, rename, delete)
//!   3. for content: fetch the destination's signature as seed, compute the
//!      local one as source, build the need list
//!   4. push to the destination and map its report onto the attempt state
//!
//! The incoming half (what a destination does with a push) lives in
//! `incoming.rs`. Both halves publish Start/Finish updates through the
//! injected `NotificationSink`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rdsync_chunks::{
    MemorySignatureRepository, NeedListGenerator, NeedListOptions, SignatureProvider,
    SignatureRepository,
};
use rdsync_core::config::RdsyncConfig;
use rdsync_core::{
    ConflictItem, ConflictResolutionStrategy, Metadata, Need, RdsyncError, RdsyncResult,
    ServerInfo, SynchronizationAction, SynchronizationDirection, SynchronizationReport,
    SynchronizationType, SynchronizationUpdate,
};
use rdsync_storage::config_ext::config_values_with_prefix;
use rdsync_storage::StorageAccessor;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conflict;
use crate::destination::{with_cancel, Destination};
use crate::files::{is_tombstone, FileStore};
use crate::notify::NotificationSink;
use crate::state::{ActiveSync, ActiveSyncs, Attempt, SyncState};

/// Config prefix of the stored report of each file's last incoming attempt.
pub const SYNC_RESULT_PREFIX: &str = "syncResult-";

pub fn sync_result_config_name(file_name: &str) -> String {
    format!("{SYNC_RESULT_PREFIX}{file_name}")
}

/// Decide what an outgoing attempt has to push.
pub fn synchronization_type(local: &Metadata, remote: Option<&Metadata>) -> SynchronizationType {
    if local.is_deleted() {
        return SynchronizationType::Delete;
    }
    if local.rename_target().is_some() {
        return SynchronizationType::Rename;
    }
    match (local.content_hash(), remote.filter(|r| !is_tombstone(r))) {
        (Some(ours), Some(remote)) if remote.content_hash() == Some(ours) => {
            SynchronizationType::MetadataUpdate
        }
        _ => SynchronizationType::ContentUpdate,
    }
}

pub struct SyncEngine {
    pub(crate) files: FileStore,
    pub(crate) server: ServerInfo,
    pub(crate) signatures: SignatureProvider,
    need_options: NeedListOptions,
    notifier: Arc<dyn NotificationSink>,
    pub(crate) active: Arc<ActiveSyncs>,
    pair_locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    permits: Semaphore,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<dyn StorageAccessor>,
        server: ServerInfo,
        config: &RdsyncConfig,
        notifier: Arc<dyn NotificationSink>,
    ) -> RdsyncResult<Self> {
        let signatures = SignatureProvider::new(config.signature.into())?;
        Ok(SyncEngine {
            files: FileStore::new(storage, server.id.clone(), config.sync.history_bound()),
            server,
            signatures,
            need_options: config.sync.clone().into(),
            notifier,
            active: ActiveSyncs::new(),
            pair_locks: Mutex::new(HashMap::new()),
            permits: Semaphore::new(config.sync.max_concurrent_syncs.max(1)),
        })
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn storage(&self) -> &Arc<dyn StorageAccessor> {
        self.files.storage()
    }

    /// Attempts currently running, both directions.
    pub fn active(&self) -> Vec<ActiveSync> {
        self.active.snapshot()
    }

    /// Reports of the last incoming attempt per file, ordered by file name.
    pub async fn finished(&self, skip: usize, take: usize) -> RdsyncResult<Vec<SynchronizationReport>> {
        config_values_with_prefix(self.storage().as_ref(), SYNC_RESULT_PREFIX, skip, take).await
    }

    pub async fn conflicts(&self, skip: usize, take: usize) -> RdsyncResult<Vec<ConflictItem>> {
        conflict::list(self.storage().as_ref(), skip, take).await
    }

    pub async fn resolve_conflict(
        &self,
        file: &str,
        strategy: ConflictResolutionStrategy,
        remote_server_url: Option<&str>,
    ) -> RdsyncResult<ConflictItem> {
        conflict::resolve(
            self.storage().as_ref(),
            file,
            strategy,
            remote_server_url,
            self.files.history_limit(),
        )
        .await
    }

    pub async fn apply_conflict(
        &self,
        file: &str,
        remote_version: u64,
        remote_server_id: &str,
    ) -> RdsyncResult<ConflictItem> {
        conflict::apply(self.storage().as_ref(), file, remote_version, remote_server_id).await
    }

    pub(crate) async fn publish(
        &self,
        file: &str,
        action: SynchronizationAction,
        sync_type: SynchronizationType,
        direction: SynchronizationDirection,
    ) {
        self.notifier
            .publish(SynchronizationUpdate {
                file_name: file.to_string(),
                server_id: self.server.id.clone(),
                action,
                sync_type,
                direction,
            })
            .await;
    }

    async fn lock_pair(&self, file: &str, destination: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.pair_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() > 1024 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry((file.to_string(), destination.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Synchronize `file` to `destination`.
    ///
    /// Attempts for the same pair queue behind each other; at most
    /// `max_concurrent_syncs` attempts run at once. Failures are returned in
    /// the report, never as an error.
    pub async fn synchronize_to(
        &self,
        file: &str,
        destination: &dyn Destination,
        cancel: &CancellationToken,
    ) -> SynchronizationReport {
        let _pair = self.lock_pair(file, destination.url()).await;
        let mut attempt = self.active.begin(
            file,
            destination.url(),
            SynchronizationDirection::Outgoing,
            SyncState::Idle,
        );
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = RdsyncError::Other(anyhow::anyhow!("synchronization permits closed: {e}"));
                return self.fail_outgoing(file, None, &mut attempt, &err).await;
            }
        };

        let mut sync_type = None;
        match self
            .run_outgoing(file, destination, cancel, &mut attempt, &mut sync_type)
            .await
        {
            Ok(report) => {
                let final_state = if report.is_conflicted() {
                    SyncState::Conflicted
                } else if report.is_success() {
                    SyncState::Completed
                } else {
                    SyncState::Failed
                };
                if let Err(e) = attempt.transition(final_state) {
                    warn!(file, "{e}");
                }
                match final_state {
                    SyncState::Completed => info!(
                        file,
                        destination = destination.url(),
                        sync_type = report.sync_type.as_str(),
                        bytes_copied = report.bytes_copied,
                        bytes_transferred = report.bytes_transferred,
                        "synchronization completed"
                    ),
                    SyncState::Conflicted => warn!(
                        file,
                        destination = destination.url(),
                        "synchronization ended in conflict"
                    ),
                    _ => error!(
                        file,
                        destination = destination.url(),
                        exception = report.exception.as_deref().unwrap_or_default(),
                        "destination failed to apply synchronization"
                    ),
                }
                self.publish(
                    file,
                    SynchronizationAction::Finish,
                    report.sync_type,
                    SynchronizationDirection::Outgoing,
                )
                .await;
                report
            }
            Err(e) => self.fail_outgoing(file, sync_type, &mut attempt, &e).await,
        }
    }

    async fn fail_outgoing(
        &self,
        file: &str,
        sync_type: Option<SynchronizationType>,
        attempt: &mut Attempt,
        err: &RdsyncError,
    ) -> SynchronizationReport {
        attempt.fail();
        error!(file, error = %err.chain_message(), "synchronization failed");
        // Every attempt shows a Start before its Finish, even one that failed
        // before its type was known.
        let sync_type = match sync_type {
            Some(t) => t,
            None => {
                let t = SynchronizationType::ContentUpdate;
                self.publish(file, SynchronizationAction::Start, t, SynchronizationDirection::Outgoing)
                    .await;
                t
            }
        };
        self.publish(file, SynchronizationAction::Finish, sync_type, SynchronizationDirection::Outgoing)
            .await;
        SynchronizationReport::failed(file, sync_type, err)
    }

    async fn run_outgoing(
        &self,
        file: &str,
        destination: &dyn Destination,
        cancel: &CancellationToken,
        attempt: &mut Attempt,
        sync_type: &mut Option<SynchronizationType>,
    ) -> RdsyncResult<SynchronizationReport> {
        attempt.transition(SyncState::ComputingDelta)?;

        let local = self
            .storage()
            .get_metadata(file)
            .await?
            .ok_or_else(|| RdsyncError::FileNotFound(file.to_string()))?;
        if local.is_conflicted() {
            return Err(RdsyncError::Conflicted(file.to_string()));
        }

        let remote = with_cancel(cancel, destination.metadata(file)).await?;
        let kind = synchronization_type(&local, remote.as_ref());
        *sync_type = Some(kind);
        attempt.set_type(kind);
        self.publish(file, SynchronizationAction::Start, kind, SynchronizationDirection::Outgoing)
            .await;
        debug!(file, destination = destination.url(), sync_type = kind.as_str(), "synchronization started");

        let report = match kind {
            SynchronizationType::ContentUpdate => {
                let needs = self.compute_needs(file, destination, cancel).await?;
                attempt.transition(SyncState::Transferring)?;
                // An edit racing this push fails the destination's Content-Hash check.
                let content = self.storage().content_for_reading(file).await?;
                destination
                    .push_content(&self.server, file, &local, content, needs, cancel)
                    .await?
            }
            SynchronizationType::MetadataUpdate => {
                attempt.transition(SyncState::Transferring)?;
                destination.push_metadata(&self.server, file, &local, cancel).await?
            }
            SynchronizationType::Rename => {
                attempt.transition(SyncState::Transferring)?;
                destination.push_rename(&self.server, file, &local, cancel).await?
            }
            SynchronizationType::Delete => {
                attempt.transition(SyncState::Transferring)?;
                destination.push_delete(&self.server, file, &local, cancel).await?
            }
        };

        attempt.transition(SyncState::ApplyingOnDestination)?;
        Ok(report)
    }

    /// Need list turning the destination's copy (seed) into ours (source).
    async fn compute_needs(
        &self,
        file: &str,
        destination: &dyn Destination,
        cancel: &CancellationToken,
    ) -> RdsyncResult<Vec<Need>> {
        let seed_bytes = with_cancel(cancel, destination.signature(file)).await?;

        let seed_repository: Arc<dyn SignatureRepository> = Arc::new(MemorySignatureRepository::new());
        let seed = seed_repository.store(&format!("{file}.seed"), seed_bytes).await?;

        let source_repository: Arc<dyn SignatureRepository> = Arc::new(MemorySignatureRepository::new());
        let mut content = self.storage().content_for_reading(file).await?;
        let source = self
            .signatures
            .generate(&format!("{file}.source"), &mut content, &source_repository)
            .await?;

        let generator = NeedListGenerator::new(seed_repository, source_repository, self.need_options);
        with_cancel(cancel, generator.create_need_list(&seed, &source)).await
    }
}
