//! rdsyncd: the rdsync daemon
//!
//! One axum router serves local file operations (`files`), the
//! synchronization protocol and its operator endpoints (`synchronization`),
//! server-sent update notifications (`notifications`) and the ops routes
//! (`metrics`). `server` wires storage, identity and the sync engine together.

pub mod error;
pub mod files;
pub mod metrics;
pub mod notifications;
pub mod parts;
pub mod server;
pub mod synchronization;

pub use server::{build_state, router, run, AppState};
