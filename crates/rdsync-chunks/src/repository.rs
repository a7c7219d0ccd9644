//! Named storage for signature artifacts

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use rdsync_core::{RdsyncError, RdsyncResult, SignatureInfo};
use tokio::io::AsyncRead;

/// Stores signature artifacts by name and hands them back as byte streams.
#[async_trait]
pub trait SignatureRepository: Send + Sync {
    /// Open the named signature for sequential reading.
    async fn content_for_reading(&self, name: &str)
        -> RdsyncResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// Store (or replace) the named signature.
    async fn store(&self, name: &str, content: Vec<u8>) -> RdsyncResult<SignatureInfo>;

    /// Drop the named signature if present.
    async fn remove(&self, name: &str) -> RdsyncResult<()>;
}

/// Process-local repository, used for signatures computed per attempt.
#[derive(Debug, Default)]
pub struct MemorySignatureRepository {
    signatures: Mutex<HashMap<String, Bytes>>,
}

impl MemorySignatureRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RdsyncResult<std::sync::MutexGuard<'_, HashMap<String, Bytes>>> {
        self.signatures
            .lock()
            .map_err(|_| RdsyncError::Signature("signature repository lock poisoned".into()))
    }
}

#[async_trait]
impl SignatureRepository for MemorySignatureRepository {
    async fn content_for_reading(
        &self,
        name: &str,
    ) -> RdsyncResult<Box<dyn AsyncRead + Send + Unpin>> {
        let bytes = self
            .lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| RdsyncError::Signature(format!("signature not found: {name}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn store(&self, name: &str, content: Vec<u8>) -> RdsyncResult<SignatureInfo> {
        let length = content.len() as u64;
        self.lock()?.insert(name.to_string(), Bytes::from(content));
        Ok(SignatureInfo {
            name: name.to_string(),
            length,
        })
    }

    async fn remove(&self, name: &str) -> RdsyncResult<()> {
        self.lock()?.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn store_read_remove() {
        let repo = MemorySignatureRepository::new();
        let info = repo.store("a.sig", vec![1, 2, 3]).await.unwrap();
        assert_eq!(info.length, 3);

        let mut out = Vec::new();
        repo.content_for_reading("a.sig")
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);

        repo.remove("a.sig").await.unwrap();
        assert!(matches!(
            repo.content_for_reading("a.sig").await,
            Err(RdsyncError::Signature(_))
        ));
    }
}
