//! Destination peers as seen by the orchestrator.
//!
//! `HttpDestination` (in `client`) talks to a remote daemon;
//! `InProcessDestination` hands parts straight to another engine in the same
//! process, which is what embedded setups and the integration tests use.
//!
//! Either way the destination applies a push on its own task: the source's
//! cancellation token stops the transfer, never a commit halfway through.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rdsync_core::{Metadata, Need, RdsyncError, RdsyncResult, ServerInfo, SynchronizationReport};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::engine::SyncEngine;
use crate::multipart::{IncomingPart, NeedPartReader, PartReader};

pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Destination: Send + Sync {
    fn url(&self) -> &str;

    /// The destination's metadata for `file`, tombstones included.
    async fn metadata(&self, file: &str) -> RdsyncResult<Option<Metadata>>;

    /// The destination's signature of `file`; empty when it has no content.
    async fn signature(&self, file: &str) -> RdsyncResult<Vec<u8>>;

    async fn push_content(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        content: ContentStream,
        needs: Vec<Need>,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport>;

    async fn push_metadata(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport>;

    /// `metadata` is the rename tombstone; its `Sync-Rename` names the target.
    async fn push_rename(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport>;

    async fn push_delete(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport>;
}

/// Run `fut` unless `cancel` fires first.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> RdsyncResult<T>
where
    F: Future<Output = RdsyncResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RdsyncError::OperationCanceled),
        result = fut => result,
    }
}

/// Run an incoming push on its own task. Once started it reaches its commit
/// and its Finish update even if the caller goes away.
pub async fn detached<F>(apply: F) -> RdsyncResult<SynchronizationReport>
where
    F: Future<Output = SynchronizationReport> + Send + 'static,
{
    tokio::spawn(apply)
        .await
        .map_err(|e| RdsyncError::transfer("incoming synchronization task", e))
}

/// Parts that end with `OperationCanceled` once `cancel` fires. Cancelling
/// stops the transfer; a push whose parts were all read still commits.
struct CancellableParts<P> {
    inner: P,
    cancel: CancellationToken,
}

#[async_trait]
impl<P: PartReader> PartReader for CancellableParts<P> {
    async fn next_part(&mut self) -> RdsyncResult<Option<IncomingPart>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RdsyncError::OperationCanceled),
            part = self.inner.next_part() => part,
        }
    }
}

/// A destination report seen through the source's token: a push that failed
/// after cancellation was asked for counts as cancelled.
fn through_cancel(cancel: &CancellationToken, report: SynchronizationReport) -> RdsyncResult<SynchronizationReport> {
    if cancel.is_cancelled() && !report.is_success() && !report.is_conflicted() {
        return Err(RdsyncError::OperationCanceled);
    }
    Ok(report)
}

pub struct InProcessDestination {
    engine: Arc<SyncEngine>,
    url: String,
}

impl InProcessDestination {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let url = engine.server().url.clone();
        InProcessDestination { engine, url }
    }
}

#[async_trait]
impl Destination for InProcessDestination {
    fn url(&self) -> &str {
        &self.url
    }

    async fn metadata(&self, file: &str) -> RdsyncResult<Option<Metadata>> {
        self.engine.metadata(file).await
    }

    async fn signature(&self, file: &str) -> RdsyncResult<Vec<u8>> {
        self.engine.local_signature(file).await
    }

    async fn push_content(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        content: ContentStream,
        needs: Vec<Need>,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        if cancel.is_cancelled() {
            return Err(RdsyncError::OperationCanceled);
        }
        let engine = self.engine.clone();
        let (source, file, metadata) = (source.clone(), file.to_string(), metadata.clone());
        let mut parts = CancellableParts {
            inner: NeedPartReader::new(needs, content),
            cancel: cancel.clone(),
        };
        let report = detached(async move {
            engine
                .incoming_content(&source, &file, &metadata, &mut parts)
                .await
        })
        .await?;
        through_cancel(cancel, report)
    }

    async fn push_metadata(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        if cancel.is_cancelled() {
            return Err(RdsyncError::OperationCanceled);
        }
        let engine = self.engine.clone();
        let (source, file, metadata) = (source.clone(), file.to_string(), metadata.clone());
        detached(async move { engine.incoming_metadata(&source, &file, &metadata).await }).await
    }

    async fn push_rename(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        if cancel.is_cancelled() {
            return Err(RdsyncError::OperationCanceled);
        }
        let engine = self.engine.clone();
        let (source, file, metadata) = (source.clone(), file.to_string(), metadata.clone());
        detached(async move { engine.incoming_rename(&source, &file, &metadata).await }).await
    }

    async fn push_delete(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        if cancel.is_cancelled() {
            return Err(RdsyncError::OperationCanceled);
        }
        let engine = self.engine.clone();
        let (source, file, metadata) = (source.clone(), file.to_string(), metadata.clone());
        detached(async move { engine.incoming_delete(&source, &file, &metadata).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_parts_stop_before_the_next_part() {
        let content: ContentStream = Box::new(std::io::Cursor::new(b"abcdef".to_vec()));
        let needs = vec![Need::from_source(0, 3), Need::from_source(3, 3)];
        let cancel = CancellationToken::new();
        let mut parts = CancellableParts {
            inner: NeedPartReader::new(needs, content),
            cancel: cancel.clone(),
        };

        let first = parts.next_part().await.unwrap().unwrap();
        assert_eq!(first.data.as_ref(), b"abc");
        cancel.cancel();
        assert!(matches!(parts.next_part().await, Err(RdsyncError::OperationCanceled)));
    }

    #[tokio::test]
    async fn failed_report_after_cancel_is_cancellation() {
        let cancel = CancellationToken::new();
        let failed = SynchronizationReport::failed(
            "a",
            rdsync_core::SynchronizationType::ContentUpdate,
            &RdsyncError::OperationCanceled,
        );
        assert!(through_cancel(&cancel, failed.clone()).is_ok());
        cancel.cancel();
        assert!(matches!(through_cancel(&cancel, failed), Err(RdsyncError::OperationCanceled)));

        let ok = SynchronizationReport::new("a", rdsync_core::SynchronizationType::ContentUpdate);
        assert!(through_cancel(&cancel, ok).is_ok());
    }
}
