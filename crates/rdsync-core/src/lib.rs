pub mod config;
pub mod error;
pub mod metadata;
pub mod types;

pub use error::{BoxError, RdsyncError, RdsyncResult};
pub use metadata::Metadata;
pub use types::{
    need_totals, ConflictItem, ConflictResolutionStrategy, FileVersion, HistoryItem, Need,
    NeedType, ServerInfo, SignatureInfo, SynchronizationAction, SynchronizationDirection,
    SynchronizationReport, SynchronizationType, SynchronizationUpdate,
};
