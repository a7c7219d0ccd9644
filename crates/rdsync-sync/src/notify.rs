//! Synchronization update notifications.
//!
//! The orchestrator publishes a Start and a Finish `SynchronizationUpdate`
//! per attempt through a `NotificationSink` handed to it at construction.
//!
//! Sinks:
//!   BroadcastPublisher  in-process tokio broadcast channel (SSE, tests)
//!   TracingPublisher    structured log line per update
//!   FanoutPublisher     forwards to several sinks in order
//!   NatsPublisher       JetStream subjects `SYNC.{direction}.{type}` (feature `nats`)
//!
//! Publishing never fails the attempt: sinks log delivery problems.

use std::sync::Arc;

use async_trait::async_trait;
use rdsync_core::SynchronizationUpdate;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[cfg(feature = "nats")]
pub use nats::NatsPublisher;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, update: SynchronizationUpdate);
}

/// NATS subject for an update.
pub fn subject(update: &SynchronizationUpdate) -> String {
    format!(
        "SYNC.{}.{}",
        update.direction.as_str(),
        update.sync_type.as_str()
    )
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<SynchronizationUpdate>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastPublisher { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SynchronizationUpdate> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationSink for BroadcastPublisher {
    async fn publish(&self, update: SynchronizationUpdate) {
        // No receivers is normal when nobody listens.
        if self.tx.send(update).is_err() {
            debug!("no notification subscribers");
        }
    }
}

// ── Tracing ───────────────────────────────────────────────────────────────────

pub struct TracingPublisher;

#[async_trait]
impl NotificationSink for TracingPublisher {
    async fn publish(&self, update: SynchronizationUpdate) {
        info!(
            file = %update.file_name,
            server = %update.server_id,
            action = ?update.action,
            sync_type = update.sync_type.as_str(),
            direction = update.direction.as_str(),
            "synchronization update"
        );
    }
}

// ── Fanout ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for FanoutPublisher {
    async fn publish(&self, update: SynchronizationUpdate) {
        for sink in &self.sinks {
            sink.publish(update.clone()).await;
        }
    }
}

// ── NATS ──────────────────────────────────────────────────────────────────────

#[cfg(feature = "nats")]
mod nats {
    use anyhow::{Context, Result};
    use async_nats::jetstream::{self, stream};
    use async_trait::async_trait;
    use rdsync_core::SynchronizationUpdate;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    use super::{subject, NotificationSink};

    pub const STREAM_SYNC_UPDATES: &str = "SYNC_UPDATES";

    /// Publishes updates to JetStream; one subject per direction and type.
    pub struct NatsPublisher {
        js: jetstream::Context,
    }

    impl NatsPublisher {
        /// Connect and make sure the stream exists (idempotent).
        pub async fn connect(url: &str) -> Result<Self> {
            let client = async_nats::connect(url)
                .await
                .with_context(|| format!("connecting to NATS at {url}"))?;
            info!("NATS: connected to {url}");
            let js = jetstream::new(client);
            js.get_or_create_stream(stream::Config {
                name: STREAM_SYNC_UPDATES.to_string(),
                subjects: vec!["SYNC.>".to_string()],
                max_messages: 500_000,
                max_age: Duration::from_secs(7 * 24 * 3600),
                retention: stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .context("ensuring SYNC_UPDATES stream")?;
            Ok(NatsPublisher { js })
        }

        async fn send(&self, update: &SynchronizationUpdate) -> Result<()> {
            let payload = serde_json::to_vec(update).context("serializing update")?;
            self.js
                .publish(subject(update), payload.into())
                .await
                .context("publishing update")?
                .await
                .context("awaiting publish ack")?;
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationSink for NatsPublisher {
        async fn publish(&self, update: SynchronizationUpdate) {
            match self.send(&update).await {
                Ok(()) => debug!(subject = %subject(&update), "update published"),
                Err(e) => warn!(file = %update.file_name, "NATS publish failed: {e:#}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdsync_core::{SynchronizationAction, SynchronizationDirection, SynchronizationType};

    fn update(action: SynchronizationAction) -> SynchronizationUpdate {
        SynchronizationUpdate {
            file_name: "test.bin".into(),
            server_id: "a".into(),
            action,
            sync_type: SynchronizationType::ContentUpdate,
            direction: SynchronizationDirection::Outgoing,
        }
    }

    #[test]
    fn subject_hierarchy() {
        assert_eq!(
            subject(&update(SynchronizationAction::Start)),
            "SYNC.outgoing.content_update"
        );
    }

    #[tokio::test]
    async fn broadcast_delivers_in_order() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        let fanout = FanoutPublisher::new()
            .with(Arc::new(TracingPublisher))
            .with(Arc::new(publisher.clone()));

        fanout.publish(update(SynchronizationAction::Start)).await;
        fanout.publish(update(SynchronizationAction::Finish)).await;

        assert_eq!(rx.recv().await.unwrap().action, SynchronizationAction::Start);
        assert_eq!(rx.recv().await.unwrap().action, SynchronizationAction::Finish);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        BroadcastPublisher::default()
            .publish(update(SynchronizationAction::Start))
            .await;
    }
}
