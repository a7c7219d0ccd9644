//! Reads the parts of a received content push out of an axum `Multipart`.

use async_trait::async_trait;
use axum::extract::Multipart;
use rdsync_core::{NeedType, RdsyncError, RdsyncResult};
use rdsync_sync::multipart::{parse_part_need, IncomingPart, PartReader};
use tracing::trace;

pub struct MultipartParts {
    inner: Multipart,
}

impl MultipartParts {
    pub fn new(inner: Multipart) -> Self {
        MultipartParts { inner }
    }
}

#[async_trait]
impl PartReader for MultipartParts {
    async fn next_part(&mut self) -> RdsyncResult<Option<IncomingPart>> {
        let Some(field) = self
            .inner
            .next_field()
            .await
            .map_err(|e| RdsyncError::transfer("reading multipart body", e))?
        else {
            return Ok(None);
        };
        let need = parse_part_need(field.headers(), field.name())?;
        let data = field
            .bytes()
            .await
            .map_err(|e| RdsyncError::transfer(format!("reading part at {}", need.file_offset), e))?;
        if need.block_type == NeedType::FromSeed && !data.is_empty() {
            trace!(offset = need.file_offset, "ignoring payload of a seed part");
        }
        Ok(Some(IncomingPart { need, data }))
    }
}
