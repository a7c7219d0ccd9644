//! Two in-process peers backed by OpenDAL memory storage.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use rdsync_core::config::{RdsyncConfig, StorageConfig};
use rdsync_core::{Metadata, ServerInfo, SynchronizationReport};
use rdsync_storage::{OpendalAccessor, StorageAccessor};
use rdsync_sync::{BroadcastPublisher, InProcessDestination, SyncEngine};
use tokio_util::sync::CancellationToken;

pub struct Peer {
    pub engine: Arc<SyncEngine>,
    pub events: BroadcastPublisher,
}

impl Peer {
    pub fn new(id: &str) -> Self {
        Self::with_config(id, &RdsyncConfig::default())
    }

    pub fn with_config(id: &str, config: &RdsyncConfig) -> Self {
        Self::with_storage(id, config, Arc::new(memory_storage()))
    }

    pub fn with_storage(id: &str, config: &RdsyncConfig, storage: Arc<dyn StorageAccessor>) -> Self {
        let events = BroadcastPublisher::new(256);
        let server = ServerInfo {
            url: format!("http://{id}.test:9090"),
            id: id.to_string(),
        };
        let engine = SyncEngine::new(
            storage,
            server,
            config,
            Arc::new(events.clone()),
        )
        .unwrap();
        Peer {
            engine: Arc::new(engine),
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.engine.server().url
    }

    pub async fn upload(&self, name: &str, metadata: &Metadata, content: &[u8]) {
        self.engine
            .files()
            .upload(name, metadata, Bytes::copy_from_slice(content))
            .await
            .unwrap();
    }

    pub async fn content(&self, name: &str) -> Vec<u8> {
        self.engine.files().download(name).await.unwrap().1.to_vec()
    }

    pub async fn metadata(&self, name: &str) -> Metadata {
        self.engine.files().live_metadata(name).await.unwrap()
    }

    /// Push `name` from this peer to `to`.
    pub async fn push(&self, name: &str, to: &Peer) -> SynchronizationReport {
        let destination = InProcessDestination::new(Arc::clone(&to.engine));
        self.engine
            .synchronize_to(name, &destination, &CancellationToken::new())
            .await
    }
}

pub fn memory_storage() -> OpendalAccessor {
    OpendalAccessor::new(rdsync_storage::build_operator(&StorageConfig::default()).unwrap())
}

pub fn user(key: &str, value: &str) -> Metadata {
    [(key, value)].into_iter().collect()
}

/// `lines` lines of pseudo-random text, each prefixed by its number.
pub fn source_content(lines: usize) -> Vec<u8> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut out = Vec::with_capacity(lines * 101);
    for i in 1..=lines {
        out.extend_from_slice(format!("{i:04}").as_bytes());
        for _ in 0..96 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.push(b'a' + (state % 26) as u8);
        }
        out.push(b'\n');
    }
    out
}

pub fn with_prefix(prefix: &str, content: &[u8]) -> Vec<u8> {
    let mut out = prefix.as_bytes().to_vec();
    out.extend_from_slice(content);
    out
}
