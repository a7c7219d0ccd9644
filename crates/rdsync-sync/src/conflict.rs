//! Conflict detection, persistence and resolution.
//!
//! A conflict is recorded as a `ConflictItem` in config under
//! `conflict-config-for-file:<name>` together with the `Sync-Conflict` flag
//! in the file's metadata. While both are present the file refuses incoming
//! synchronizations, except from the peer an operator chose with `Theirs`.

use rdsync_core::metadata::CONFLICT;
use rdsync_core::{
    ConflictItem, ConflictResolutionStrategy, FileVersion, Metadata, RdsyncError, RdsyncResult,
    ServerInfo,
};
use rdsync_storage::config_ext::{config_values_with_prefix, set_config_value, try_get_config_value};
use rdsync_storage::StorageAccessor;
use tracing::{info, warn};

use crate::history::{self, Ancestry};

pub const CONFLICT_CONFIG_PREFIX: &str = "conflict-config-for-file:";

pub fn conflict_config_name(file_name: &str) -> String {
    format!("{CONFLICT_CONFIG_PREFIX}{file_name}")
}

pub async fn load(storage: &dyn StorageAccessor, file_name: &str) -> RdsyncResult<Option<ConflictItem>> {
    try_get_config_value(storage, &conflict_config_name(file_name)).await
}

pub async fn list(
    storage: &dyn StorageAccessor,
    skip: usize,
    take: usize,
) -> RdsyncResult<Vec<ConflictItem>> {
    config_values_with_prefix(storage, CONFLICT_CONFIG_PREFIX, skip, take).await
}

/// Persist `item` and flag the file. `meta` is the file's current metadata
/// and is written back with the flag set; content is never touched.
pub async fn record(
    storage: &dyn StorageAccessor,
    meta: &mut Metadata,
    item: &ConflictItem,
) -> RdsyncResult<()> {
    set_config_value(storage, &conflict_config_name(&item.file_name), item).await?;
    meta.insert(CONFLICT, "true");
    storage.set_metadata(&item.file_name, meta).await?;
    warn!(
        file = %item.file_name,
        ours = %item.ours,
        theirs = %item.theirs,
        "conflict recorded"
    );
    Ok(())
}

/// Drop the conflict entry and the flag. The caller persists `meta`.
pub async fn clear(storage: &dyn StorageAccessor, file_name: &str, meta: &mut Metadata) -> RdsyncResult<()> {
    meta.remove(CONFLICT);
    storage.delete_config(&conflict_config_name(file_name)).await
}

/// Mark a file conflicted by hand with an arbitrary remote version.
pub async fn apply(
    storage: &dyn StorageAccessor,
    file_name: &str,
    remote_version: u64,
    remote_server_id: &str,
) -> RdsyncResult<ConflictItem> {
    let _guard = storage.lock_file(file_name).await;
    let mut meta = storage
        .get_metadata(file_name)
        .await?
        .ok_or_else(|| RdsyncError::FileNotFound(file_name.to_string()))?;

    let item = ConflictItem {
        file_name: file_name.to_string(),
        ours: history::file_version(&meta),
        theirs: FileVersion::new(remote_version, remote_server_id),
        remote_server_url: None,
        resolution: None,
    };
    record(storage, &mut meta, &item).await?;
    Ok(item)
}

/// What the destination should do with an incoming synchronization.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingDecision {
    /// Apply it. `resolved` is set when it settles a `Theirs` resolution.
    Accept { resolved: bool },
    /// Nothing to apply: the destination already has this version.
    UpToDate,
    /// Refuse it and leave the local copy untouched.
    Conflict(ConflictItem),
}

/// Decide an incoming synchronization against local state and, for a new
/// fork, record the conflict. Must run under the file's lock.
pub async fn check_incoming(
    storage: &dyn StorageAccessor,
    file_name: &str,
    local: Option<&Metadata>,
    source: &ServerInfo,
    incoming: &Metadata,
) -> RdsyncResult<IncomingDecision> {
    let Some(local) = local else {
        return Ok(IncomingDecision::Accept { resolved: false });
    };
    let theirs = history::file_version(incoming);

    if local.is_conflicted() {
        if let Some(mut item) = load(storage, file_name).await? {
            if item.resolution == Some(ConflictResolutionStrategy::Theirs) && accepts(&item, source) {
                info!(file = file_name, source = %source.url, "accepting resolved conflict");
                return Ok(IncomingDecision::Accept { resolved: true });
            }
            // An unresolved conflict tracks the latest remote version; a
            // resolved one stays pinned to the peer the operator chose.
            if item.resolution.is_none() {
                item.theirs = theirs;
                item.remote_server_url = Some(source.url.clone());
                let mut meta = local.clone();
                record(storage, &mut meta, &item).await?;
            }
            return Ok(IncomingDecision::Conflict(item));
        }
        warn!(file = file_name, "conflict flag without a conflict entry; ignoring flag");
    }

    let ours = history::file_version(local);
    match history::ancestry(&ours, &history::history(local)?, &theirs, &history::history(incoming)?) {
        Ancestry::Descendant => Ok(IncomingDecision::Accept { resolved: false }),
        Ancestry::AlreadyKnown => Ok(IncomingDecision::UpToDate),
        Ancestry::Diverged => {
            let item = ConflictItem {
                file_name: file_name.to_string(),
                ours,
                theirs,
                remote_server_url: Some(source.url.clone()),
                resolution: None,
            };
            let mut meta = local.clone();
            record(storage, &mut meta, &item).await?;
            Ok(IncomingDecision::Conflict(item))
        }
    }
}

fn accepts(item: &ConflictItem, source: &ServerInfo) -> bool {
    match &item.remote_server_url {
        Some(url) => same_url(url, &source.url),
        None => item.theirs.server_id == source.id,
    }
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Resolve a recorded conflict.
///
/// `Theirs` keeps the conflict but lets the next synchronization from the
/// remote through. `Ours` keeps local content, adds the remote version to the
/// local history so later pushes in either direction see common ancestry,
/// and clears the conflict.
pub async fn resolve(
    storage: &dyn StorageAccessor,
    file_name: &str,
    strategy: ConflictResolutionStrategy,
    remote_server_url: Option<&str>,
    history_limit: Option<usize>,
) -> RdsyncResult<ConflictItem> {
    let _guard = storage.lock_file(file_name).await;
    let mut item = load(storage, file_name)
        .await?
        .ok_or_else(|| RdsyncError::NotConflicted(file_name.to_string()))?;
    let mut meta = storage
        .get_metadata(file_name)
        .await?
        .ok_or_else(|| RdsyncError::FileNotFound(file_name.to_string()))?;

    if let Some(url) = remote_server_url {
        item.remote_server_url = Some(url.to_string());
    }

    match strategy {
        ConflictResolutionStrategy::Theirs => {
            item.resolution = Some(ConflictResolutionStrategy::Theirs);
            set_config_value(storage, &conflict_config_name(file_name), &item).await?;
        }
        ConflictResolutionStrategy::Ours => {
            history::acknowledge(&mut meta, &item.theirs, history_limit)?;
            clear(storage, file_name, &mut meta).await?;
            storage.set_metadata(file_name, &meta).await?;
            item.resolution = Some(ConflictResolutionStrategy::Ours);
        }
    }

    info!(file = file_name, strategy = ?strategy, theirs = %item.theirs, "conflict resolved");
    Ok(item)
}
