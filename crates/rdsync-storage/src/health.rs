//! Storage health check, backing `/readyz`

use anyhow::Result;
use opendal::Operator;

/// Probe the backend with a root listing.
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}
