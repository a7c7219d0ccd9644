//! rdsync-storage: the storage collaborator
//!
//! File content, per-file metadata and named config entries, all kept in an
//! OpenDAL operator (in-memory or local filesystem).

pub mod accessor;
pub mod config_ext;
pub mod health;
pub mod operator;

pub use accessor::{ConfigMap, OpendalAccessor, StorageAccessor};
pub use health::{check_health, is_healthy};
pub use operator::build_operator;
