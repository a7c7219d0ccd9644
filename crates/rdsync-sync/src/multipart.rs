//! Multipart synchronization wire format.
//!
//! A content push is a `multipart/form-data` body with boundary `syncing`,
//! one part per Need, in need-list order:
//!
//! ```text
//! --syncing
//! Content-Disposition: form-data; name="seed"
//! Sync-Need-Type: seed
//! Sync-Offset: 17
//! Sync-Length: 400
//! Sync-Seed-Offset: 0
//!
//! (no payload)
//! --syncing
//! Content-Disposition: form-data; name="source"
//! Content-Type: application/octet-stream
//! Sync-Need-Type: source
//! ...
//!
//! <exactly Sync-Length bytes>
//! --syncing--
//! ```
//!
//! Source bytes are pulled from the live content stream through a
//! `NarrowedReader`, so FromSource needs must arrive in non-decreasing
//! offset order. Peer identity (`SourceServerInfo`), file name (`FileName`)
//! and metadata travel as request headers.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rdsync_core::{Metadata, Need, NeedType, RdsyncError, RdsyncResult, ServerInfo};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

pub const BOUNDARY: &str = "syncing";
// Header names are matched case-insensitively; the constants are lowercase
// so they can be used directly as `HeaderName`s.
pub const FILE_NAME_HEADER: &str = "filename";
pub const SOURCE_SERVER_INFO_HEADER: &str = "sourceserverinfo";
pub const NEED_TYPE_HEADER: &str = "sync-need-type";
pub const OFFSET_HEADER: &str = "sync-offset";
pub const LENGTH_HEADER: &str = "sync-length";
pub const SEED_OFFSET_HEADER: &str = "sync-seed-offset";

/// Request headers that never become file metadata.
const TRANSPORT_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "transfer-encoding",
    "host",
    "accept",
    "accept-encoding",
    "user-agent",
    "connection",
    "expect",
    FILE_NAME_HEADER,
    SOURCE_SERVER_INFO_HEADER,
];

pub fn content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

/// One received part: the need it satisfies and, for FromSource, its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPart {
    pub need: Need,
    pub data: Bytes,
}

/// Ordered source of parts on the destination side.
#[async_trait]
pub trait PartReader: Send {
    async fn next_part(&mut self) -> RdsyncResult<Option<IncomingPart>>;
}

fn protocol_error(message: impl Into<String>) -> RdsyncError {
    RdsyncError::Transfer {
        message: message.into(),
        source: None,
    }
}

// ── Source side ───────────────────────────────────────────────────────────────

/// Windowed view over a forward-only content stream.
pub struct NarrowedReader<R> {
    inner: R,
    position: u64,
}

impl<R: AsyncRead + Unpin + Send> NarrowedReader<R> {
    pub fn new(inner: R) -> Self {
        NarrowedReader { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read `[offset, offset + length)`, skipping forward as needed.
    pub async fn read_window(&mut self, offset: u64, length: u64) -> RdsyncResult<Bytes> {
        if offset < self.position {
            return Err(protocol_error(format!(
                "source window at {offset} is behind stream position {}",
                self.position
            )));
        }
        let skip = offset - self.position;
        if skip > 0 {
            let skipped = tokio::io::copy(&mut (&mut self.inner).take(skip), &mut tokio::io::sink())
                .await
                .map_err(|e| RdsyncError::transfer("skipping source content", e))?;
            if skipped != skip {
                return Err(protocol_error(format!(
                    "source content ended at {} before window {offset}",
                    self.position + skipped
                )));
            }
        }
        let len = usize::try_from(length)
            .map_err(|_| protocol_error(format!("window of {length} bytes is too large")))?;
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| RdsyncError::transfer(format!("reading source window {offset}+{length}"), e))?;
        self.position = offset + length;
        Ok(Bytes::from(buf))
    }
}

/// Parts produced straight from a need list and the source content.
pub struct NeedPartReader<R> {
    needs: VecDeque<Need>,
    source: NarrowedReader<R>,
}

impl<R: AsyncRead + Unpin + Send> NeedPartReader<R> {
    pub fn new(needs: Vec<Need>, source: R) -> Self {
        NeedPartReader {
            needs: needs.into(),
            source: NarrowedReader::new(source),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PartReader for NeedPartReader<R> {
    async fn next_part(&mut self) -> RdsyncResult<Option<IncomingPart>> {
        let Some(need) = self.needs.pop_front() else {
            return Ok(None);
        };
        let data = match need.block_type {
            NeedType::FromSeed => Bytes::new(),
            NeedType::FromSource => {
                self.source
                    .read_window(need.file_offset, need.block_length)
                    .await?
            }
        };
        Ok(Some(IncomingPart { need, data }))
    }
}

fn encode_part(part: &IncomingPart) -> Bytes {
    let need = &part.need;
    let mut head = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{kind}\"\r\n",
        kind = need.block_type
    );
    if need.block_type == NeedType::FromSource {
        head.push_str("Content-Type: application/octet-stream\r\n");
    }
    head.push_str(&format!(
        "Sync-Need-Type: {}\r\nSync-Offset: {}\r\nSync-Length: {}\r\nSync-Seed-Offset: {}\r\n\r\n",
        need.block_type, need.file_offset, need.block_length, need.seed_offset
    ));

    let mut out = BytesMut::with_capacity(head.len() + part.data.len() + 2);
    out.put_slice(head.as_bytes());
    out.put_slice(&part.data);
    out.put_slice(b"\r\n");
    out.freeze()
}

/// Stream the multipart body for `parts`. Parts are produced by a background
/// task and handed over through a small bounded channel, so at most a few
/// windows are held in memory. Dropping the stream stops the producer.
pub fn multipart_body<P>(mut parts: P) -> ReceiverStream<RdsyncResult<Bytes>>
where
    P: PartReader + 'static,
{
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut count = 0usize;
        loop {
            let chunk = match parts.next_part().await {
                Ok(Some(part)) => {
                    count += 1;
                    trace!(offset = part.need.file_offset, length = part.need.block_length, "encoding part");
                    Ok(encode_part(&part))
                }
                Ok(None) => {
                    let _ = tx.send(Ok(Bytes::from(format!("--{BOUNDARY}--\r\n")))).await;
                    debug!(parts = count, "multipart body complete");
                    return;
                }
                Err(e) => Err(e),
            };
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

// ── Destination side ──────────────────────────────────────────────────────────

fn header_u64(headers: &HeaderMap, name: &str) -> RdsyncResult<Option<u64>> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| protocol_error(format!("invalid {name} part header"))),
    }
}

/// Decode the Need a received part stands for. The need type comes from the
/// `Sync-Need-Type` header, falling back to the form field name.
pub fn parse_part_need(headers: &HeaderMap, field_name: Option<&str>) -> RdsyncResult<Need> {
    let tag = headers
        .get(NEED_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(field_name)
        .ok_or_else(|| protocol_error("part carries no need type"))?;
    let block_type: NeedType = tag.trim().parse()?;
    let file_offset = header_u64(headers, OFFSET_HEADER)?
        .ok_or_else(|| protocol_error(format!("part is missing {OFFSET_HEADER}")))?;
    let block_length = header_u64(headers, LENGTH_HEADER)?
        .ok_or_else(|| protocol_error(format!("part is missing {LENGTH_HEADER}")))?;
    let seed_offset = header_u64(headers, SEED_OFFSET_HEADER)?.unwrap_or(file_offset);
    Ok(Need {
        block_type,
        file_offset,
        block_length,
        seed_offset: if block_type == NeedType::FromSeed { seed_offset } else { 0 },
    })
}

/// Every metadata entry as a request header.
pub fn metadata_to_headers(metadata: &Metadata) -> RdsyncResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in metadata.iter() {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            RdsyncError::Other(anyhow::anyhow!("metadata key {key} is not a valid header: {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            RdsyncError::Other(anyhow::anyhow!("metadata {key} is not a valid header value: {e}"))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Metadata carried by request headers, transport headers excluded.
pub fn headers_to_metadata(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter(|(name, _)| !TRANSPORT_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

pub fn server_info_header(info: &ServerInfo) -> RdsyncResult<HeaderValue> {
    let json = serde_json::to_string(info)
        .map_err(|e| RdsyncError::Other(anyhow::anyhow!("encoding server info: {e}")))?;
    HeaderValue::from_str(&json)
        .map_err(|e| RdsyncError::Other(anyhow::anyhow!("server info is not a valid header: {e}")))
}

pub fn parse_server_info(headers: &HeaderMap) -> RdsyncResult<ServerInfo> {
    let raw = headers
        .get(SOURCE_SERVER_INFO_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| protocol_error(format!("missing {SOURCE_SERVER_INFO_HEADER} header")))?;
    serde_json::from_str(raw)
        .map_err(|e| RdsyncError::transfer(format!("invalid {SOURCE_SERVER_INFO_HEADER} header"), e))
}

pub fn parse_file_name(headers: &HeaderMap) -> RdsyncResult<String> {
    headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| protocol_error(format!("missing {FILE_NAME_HEADER} header")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Cursor;

    async fn collect_body<P: PartReader + 'static>(parts: P) -> Vec<u8> {
        let mut body = multipart_body(parts);
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn narrowed_reader_skips_forward() {
        let mut reader = NarrowedReader::new(Cursor::new(b"0123456789".to_vec()));
        assert_eq!(&reader.read_window(2, 3).await.unwrap()[..], b"234");
        assert_eq!(&reader.read_window(7, 2).await.unwrap()[..], b"78");
        assert_eq!(reader.position(), 9);
        assert!(matches!(
            reader.read_window(0, 1).await,
            Err(RdsyncError::Transfer { .. })
        ));
    }

    #[tokio::test]
    async fn narrowed_reader_short_source_is_transfer_error() {
        let mut reader = NarrowedReader::new(Cursor::new(b"abc".to_vec()));
        assert!(matches!(
            reader.read_window(1, 5).await,
            Err(RdsyncError::Transfer { .. })
        ));
    }

    #[tokio::test]
    async fn body_mirrors_need_list() {
        let needs = vec![
            Need::from_source(0, 4),
            Need::from_seed(4, 10, 6),
            Need::from_source(10, 2),
        ];
        let source = Cursor::new(b"ABCDxxxxxxYZ".to_vec());
        let body = collect_body(NeedPartReader::new(needs, source)).await;
        let text = String::from_utf8(body).unwrap();

        let parts: Vec<&str> = text.split("--syncing").collect();
        // leading empty piece, three parts, closing "--\r\n"
        assert_eq!(parts.len(), 5);
        assert!(parts[1].contains("name=\"source\""));
        assert!(parts[1].ends_with("\r\n\r\nABCD\r\n"));
        assert!(parts[2].contains("Sync-Need-Type: seed"));
        assert!(parts[2].contains("Sync-Seed-Offset: 10"));
        assert!(parts[2].ends_with("\r\n\r\n\r\n"));
        assert!(parts[3].ends_with("\r\n\r\nYZ\r\n"));
        assert_eq!(parts[4], "--\r\n");
    }

    #[tokio::test]
    async fn empty_need_list_is_just_the_terminator() {
        let body = collect_body(NeedPartReader::new(Vec::new(), Cursor::new(Vec::new()))).await;
        assert_eq!(body, b"--syncing--\r\n");
    }

    #[tokio::test]
    async fn body_stops_on_source_error() {
        let needs = vec![Need::from_source(0, 100)];
        let mut body = multipart_body(NeedPartReader::new(needs, Cursor::new(b"short".to_vec())));
        assert!(body.next().await.unwrap().is_err());
        assert!(body.next().await.is_none());
    }

    #[test]
    fn part_headers_decode() {
        let mut headers = HeaderMap::new();
        headers.insert("sync-need-type", HeaderValue::from_static("seed"));
        headers.insert("sync-offset", HeaderValue::from_static("17"));
        headers.insert("sync-length", HeaderValue::from_static("400"));
        headers.insert("sync-seed-offset", HeaderValue::from_static("3"));
        assert_eq!(parse_part_need(&headers, None).unwrap(), Need::from_seed(17, 3, 400));

        headers.remove(NEED_TYPE_HEADER);
        let need = parse_part_need(&headers, Some("source")).unwrap();
        assert_eq!(need, Need::from_source(17, 400));

        headers.insert("sync-need-type", HeaderValue::from_static("target"));
        assert!(matches!(
            parse_part_need(&headers, None),
            Err(RdsyncError::UnsupportedNeedType(_))
        ));
    }

    #[test]
    fn metadata_survives_headers_without_transport_noise() {
        let meta: Metadata = [("Owner", "alice"), ("sync-version", "3")].into_iter().collect();
        let mut headers = metadata_to_headers(&meta).unwrap();
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("filename", HeaderValue::from_static("a.txt"));
        assert_eq!(headers_to_metadata(&headers), meta);
        assert_eq!(parse_file_name(&headers).unwrap(), "a.txt");
    }

    #[test]
    fn server_info_header_roundtrip() {
        let info = ServerInfo {
            url: "http://a:9090".into(),
            id: "a".into(),
        };
        let mut headers = HeaderMap::new();
        headers.insert("sourceserverinfo", server_info_header(&info).unwrap());
        assert_eq!(parse_server_info(&headers).unwrap(), info);
    }
}
