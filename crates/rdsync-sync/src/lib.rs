//! rdsync-sync: file synchronization between peers
//!
//! - `history`: per-file version ledger and ancestry rules
//! - `conflict`: conflict detection, persistence and resolution
//! - `files`: local mutations (upload, metadata, rename, delete)
//! - `multipart`: wire format of a content push
//! - `destination` / `client`: peers a file can be pushed to
//! - `state`: per-attempt state machine and the active-attempt registry
//! - `notify`: Start/Finish update sinks
//! - `engine` / `incoming`: the orchestrator, outgoing and incoming halves

pub mod client;
pub mod conflict;
pub mod destination;
pub mod engine;
pub mod files;
pub mod history;
mod incoming;
pub mod multipart;
pub mod notify;
pub mod state;

pub use client::HttpDestination;
pub use conflict::IncomingDecision;
pub use destination::{Destination, InProcessDestination};
pub use engine::SyncEngine;
pub use files::FileStore;
pub use notify::{BroadcastPublisher, FanoutPublisher, NotificationSink, TracingPublisher};
pub use state::{ActiveSync, SyncState};

#[cfg(feature = "nats")]
pub use notify::NatsPublisher;
