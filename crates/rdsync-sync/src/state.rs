//! Per-attempt synchronization state machine and the registry of attempts
//! currently running.
//!
//! ```text
//! Idle -> ComputingDelta -> Transferring -> ApplyingOnDestination -> Completed
//!                                                                 -> Conflicted
//! any non-terminal state -> Failed
//! ```
//!
//! An attempt is registered by `ActiveSyncs::begin` and stays visible until
//! its `Attempt` handle is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rdsync_core::{RdsyncError, RdsyncResult, SynchronizationDirection, SynchronizationType};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    ComputingDelta,
    Transferring,
    ApplyingOnDestination,
    Completed,
    Conflicted,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncState::Completed | SyncState::Conflicted | SyncState::Failed
        )
    }

    pub fn can_transition(self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, ComputingDelta)
            | (ComputingDelta, Transferring)
            | (Transferring, ApplyingOnDestination)
            | (ApplyingOnDestination, Completed)
            | (ApplyingOnDestination, Conflicted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::ComputingDelta => "computing_delta",
            SyncState::Transferring => "transferring",
            SyncState::ApplyingOnDestination => "applying_on_destination",
            SyncState::Completed => "completed",
            SyncState::Conflicted => "conflicted",
            SyncState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one running attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSync {
    pub id: Uuid,
    pub file_name: String,
    /// Destination URL for outgoing attempts, source URL for incoming ones
    pub peer: String,
    pub direction: SynchronizationDirection,
    #[serde(rename = "type")]
    pub sync_type: Option<SynchronizationType>,
    pub state: SyncState,
    /// Unix timestamp (seconds) the attempt began
    pub started_at: u64,
}

#[derive(Debug, Default)]
pub struct ActiveSyncs {
    entries: Mutex<HashMap<Uuid, ActiveSync>>,
}

impl ActiveSyncs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveSync>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn begin(
        self: &Arc<Self>,
        file_name: &str,
        peer: &str,
        direction: SynchronizationDirection,
        initial: SyncState,
    ) -> Attempt {
        let id = Uuid::new_v4();
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.entries().insert(
            id,
            ActiveSync {
                id,
                file_name: file_name.to_string(),
                peer: peer.to_string(),
                direction,
                sync_type: None,
                state: initial,
                started_at,
            },
        );
        Attempt {
            registry: Arc::clone(self),
            id,
            state: initial,
        }
    }

    /// Running attempts, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveSync> {
        let mut all: Vec<ActiveSync> = self.entries().values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.file_name.cmp(&b.file_name)));
        all
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Handle to a registered attempt; deregisters on drop.
#[derive(Debug)]
pub struct Attempt {
    registry: Arc<ActiveSyncs>,
    id: Uuid,
    state: SyncState,
}

impl Attempt {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn transition(&mut self, next: SyncState) -> RdsyncResult<()> {
        if !self.state.can_transition(next) {
            return Err(RdsyncError::Other(anyhow::anyhow!(
                "invalid synchronization state transition {} -> {next}",
                self.state
            )));
        }
        trace!(attempt = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
        if let Some(entry) = self.registry.entries().get_mut(&self.id) {
            entry.state = next;
        }
        Ok(())
    }

    /// Move to `Failed` unless the attempt already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            let _ = self.transition(SyncState::Failed);
        }
    }

    pub fn set_type(&self, sync_type: SynchronizationType) {
        if let Some(entry) = self.registry.entries().get_mut(&self.id) {
            entry.sync_type = Some(sync_type);
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.registry.entries().remove(&self.id);
    }
}
