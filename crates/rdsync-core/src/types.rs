use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RdsyncError;

/// Origin of the bytes for one segment of a reconstruction plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedType {
    /// Reuse bytes the destination already holds in its seed copy
    FromSeed,
    /// Bytes must be sent from the source
    FromSource,
}

impl NeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeedType::FromSeed => "seed",
            NeedType::FromSource => "source",
        }
    }
}

impl fmt::Display for NeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NeedType {
    type Err = RdsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed" => Ok(NeedType::FromSeed),
            "source" => Ok(NeedType::FromSource),
            other => Err(RdsyncError::UnsupportedNeedType(other.to_string())),
        }
    }
}

/// One instruction in a file reconstruction plan.
///
/// `file_offset` is the position in the target (source) file. For
/// `FromSeed` blocks `seed_offset` is where the same bytes sit in the
/// destination's seed copy; it is zero and ignored for `FromSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Need {
    pub block_type: NeedType,
    pub file_offset: u64,
    pub block_length: u64,
    #[serde(default)]
    pub seed_offset: u64,
}

impl Need {
    pub fn from_seed(file_offset: u64, seed_offset: u64, block_length: u64) -> Self {
        Need {
            block_type: NeedType::FromSeed,
            file_offset,
            block_length,
            seed_offset,
        }
    }

    pub fn from_source(file_offset: u64, block_length: u64) -> Self {
        Need {
            block_type: NeedType::FromSource,
            file_offset,
            block_length,
            seed_offset: 0,
        }
    }

    /// First target offset after this block
    pub fn end(&self) -> u64 {
        self.file_offset + self.block_length
    }
}

/// Byte totals of a need list: (from seed, from source).
pub fn need_totals(needs: &[Need]) -> (u64, u64) {
    needs.iter().fold((0, 0), |(seed, source), n| match n.block_type {
        NeedType::FromSeed => (seed + n.block_length, source),
        NeedType::FromSource => (seed, source + n.block_length),
    })
}

/// Names one signature artifact in a signature repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub name: String,
    pub length: u64,
}

/// Per-file version state
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub version: u64,
    pub server_id: String,
}

impl FileVersion {
    pub fn new(version: u64, server_id: impl Into<String>) -> Self {
        FileVersion {
            version,
            server_id: server_id.into(),
        }
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.version, self.server_id)
    }
}

/// A prior (version, serverId) pair recorded before a mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub version: u64,
    pub server_id: String,
}

impl From<FileVersion> for HistoryItem {
    fn from(v: FileVersion) -> Self {
        HistoryItem {
            version: v.version,
            server_id: v.server_id,
        }
    }
}

impl From<&FileVersion> for HistoryItem {
    fn from(v: &FileVersion) -> Self {
        v.clone().into()
    }
}

impl HistoryItem {
    pub fn matches(&self, v: &FileVersion) -> bool {
        self.version == v.version && self.server_id == v.server_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    /// Keep local content; acknowledge the remote version as superseded
    Ours,
    /// Accept the remote version on the next incoming synchronization
    Theirs,
}

impl FromStr for ConflictResolutionStrategy {
    type Err = RdsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(ConflictResolutionStrategy::Ours),
            "theirs" => Ok(ConflictResolutionStrategy::Theirs),
            other => Err(RdsyncError::Config(format!(
                "unknown conflict resolution strategy: {other}"
            ))),
        }
    }
}

/// Persisted when a synchronization finds two independently advanced copies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    pub file_name: String,
    pub ours: FileVersion,
    pub theirs: FileVersion,
    /// URL of the peer that pushed `theirs`, when known
    #[serde(default)]
    pub remote_server_url: Option<String>,
    /// Set once an operator picked a strategy that needs a later sync
    #[serde(default)]
    pub resolution: Option<ConflictResolutionStrategy>,
}

/// Identity of a peer, carried in the `SourceServerInfo` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizationType {
    ContentUpdate,
    MetadataUpdate,
    Rename,
    Delete,
}

impl SynchronizationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchronizationType::ContentUpdate => "content_update",
            SynchronizationType::MetadataUpdate => "metadata_update",
            SynchronizationType::Rename => "rename",
            SynchronizationType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizationAction {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizationDirection {
    Incoming,
    Outgoing,
}

impl SynchronizationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchronizationDirection::Incoming => "incoming",
            SynchronizationDirection::Outgoing => "outgoing",
        }
    }
}

/// Notification published on every Start/Finish of a synchronization attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationUpdate {
    pub file_name: String,
    pub server_id: String,
    pub action: SynchronizationAction,
    #[serde(rename = "type")]
    pub sync_type: SynchronizationType,
    pub direction: SynchronizationDirection,
}

/// Outcome of one synchronization attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationReport {
    pub file_name: String,
    #[serde(rename = "type")]
    pub sync_type: SynchronizationType,
    #[serde(default)]
    pub file_etag: Option<String>,
    /// Bytes satisfied from the destination's seed copy
    pub bytes_copied: u64,
    /// Bytes sent over the wire from the source
    pub bytes_transferred: u64,
    #[serde(default)]
    pub exception: Option<String>,
    /// Populated when the attempt ended in the conflicted state
    #[serde(default)]
    pub conflict: Option<ConflictItem>,
}

impl SynchronizationReport {
    pub fn new(file_name: impl Into<String>, sync_type: SynchronizationType) -> Self {
        SynchronizationReport {
            file_name: file_name.into(),
            sync_type,
            file_etag: None,
            bytes_copied: 0,
            bytes_transferred: 0,
            exception: None,
            conflict: None,
        }
    }

    pub fn failed(
        file_name: impl Into<String>,
        sync_type: SynchronizationType,
        err: &RdsyncError,
    ) -> Self {
        let mut report = Self::new(file_name, sync_type);
        report.exception = Some(err.chain_message());
        report
    }

    pub fn conflicted(sync_type: SynchronizationType, conflict: ConflictItem) -> Self {
        let mut report = Self::new(conflict.file_name.clone(), sync_type);
        report.exception = Some(RdsyncError::Conflicted(conflict.file_name.clone()).to_string());
        report.conflict = Some(conflict);
        report
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflict.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_type_parses_wire_names() {
        assert_eq!("seed".parse::<NeedType>().unwrap(), NeedType::FromSeed);
        assert_eq!("source".parse::<NeedType>().unwrap(), NeedType::FromSource);
        match "target".parse::<NeedType>() {
            Err(RdsyncError::UnsupportedNeedType(t)) => assert_eq!(t, "target"),
            other => panic!("expected UnsupportedNeedType, got {other:?}"),
        }
    }

    #[test]
    fn need_totals_split_by_origin() {
        let needs = vec![
            Need::from_source(0, 17),
            Need::from_seed(17, 0, 400),
            Need::from_source(417, 3),
        ];
        assert_eq!(need_totals(&needs), (400, 20));
    }

    #[test]
    fn conflicted_report_carries_exception() {
        let item = ConflictItem {
            file_name: "test.bin".into(),
            ours: FileVersion::new(1, "a"),
            theirs: FileVersion::new(1, "b"),
            remote_server_url: None,
            resolution: None,
        };
        let report = SynchronizationReport::conflicted(SynchronizationType::ContentUpdate, item);
        assert!(report.is_conflicted());
        assert!(!report.is_success());
        assert_eq!(report.exception.as_deref(), Some("file test.bin is conflicted"));
    }

    #[test]
    fn strategy_parse_is_case_insensitive() {
        assert_eq!(
            "Theirs".parse::<ConflictResolutionStrategy>().unwrap(),
            ConflictResolutionStrategy::Theirs
        );
        assert!("mine".parse::<ConflictResolutionStrategy>().is_err());
    }

    #[test]
    fn report_json_uses_camel_case() {
        let mut report = SynchronizationReport::new("a.txt", SynchronizationType::ContentUpdate);
        report.bytes_copied = 10;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["fileName"], "a.txt");
        assert_eq!(json["bytesCopied"], 10);
        assert_eq!(json["type"], "content_update");
    }
}
