//! HTTP client side of the synchronization protocol.

use std::time::Duration;

use async_trait::async_trait;
use rdsync_core::{Metadata, Need, RdsyncError, RdsyncResult, ServerInfo, SynchronizationReport};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::destination::{with_cancel, ContentStream, Destination};
use crate::multipart::{
    self, metadata_to_headers, multipart_body, server_info_header, NeedPartReader,
    FILE_NAME_HEADER, SOURCE_SERVER_INFO_HEADER,
};

/// A remote daemon reached over HTTP.
pub struct HttpDestination {
    client: Client,
    url: String,
}

impl HttpDestination {
    pub fn new(url: impl Into<String>, timeout: Duration) -> RdsyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RdsyncError::transfer("building HTTP client", e))?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        HttpDestination { client, url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    fn push_headers(&self, source: &ServerInfo, file: &str, metadata: &Metadata) -> RdsyncResult<HeaderMap> {
        let mut headers = metadata_to_headers(metadata)?;
        headers.insert(SOURCE_SERVER_INFO_HEADER, server_info_header(source)?);
        let name = HeaderValue::from_str(file).map_err(|e| {
            RdsyncError::Other(anyhow::anyhow!("file name {file} cannot be sent as a header: {e}"))
        })?;
        headers.insert(FILE_NAME_HEADER, name);
        Ok(headers)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> RdsyncResult<Response> {
        request
            .send()
            .await
            .map_err(|e| RdsyncError::transfer(format!("{what} at {}", self.url), e))
    }

    async fn post_report(
        &self,
        path: &str,
        headers: HeaderMap,
        body: Option<Body>,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        let mut request = self.client.post(self.endpoint(path)).headers(headers);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, multipart::content_type()).body(body);
        }
        // Dropping the in-flight request on cancel closes the connection.
        with_cancel(cancel, async {
            let response = self.send(request, path).await?;
            read_report(response, &self.url).await
        })
        .await
    }
}

async fn error_for_status(response: Response, url: &str) -> RdsyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RdsyncError::Transfer {
        message: format!("{url} answered {status}: {body}"),
        source: None,
    })
}

async fn read_report(response: Response, url: &str) -> RdsyncResult<SynchronizationReport> {
    let response = error_for_status(response, url).await?;
    let report: SynchronizationReport = response
        .json()
        .await
        .map_err(|e| RdsyncError::transfer(format!("decoding report from {url}"), e))?;
    debug!(file = %report.file_name, destination = url, success = report.is_success(), "report received");
    Ok(report)
}

#[async_trait]
impl Destination for HttpDestination {
    fn url(&self) -> &str {
        &self.url
    }

    async fn metadata(&self, file: &str) -> RdsyncResult<Option<Metadata>> {
        let request = self
            .client
            .get(self.endpoint("/synchronization/metadata"))
            .query(&[("fileName", file)]);
        let response = self.send(request, "fetching metadata").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response, &self.url).await?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| RdsyncError::transfer(format!("decoding metadata of {file}"), e))
    }

    async fn signature(&self, file: &str) -> RdsyncResult<Vec<u8>> {
        let request = self
            .client
            .get(self.endpoint("/rdc/signature"))
            .query(&[("fileName", file)]);
        let response = self.send(request, "fetching signature").await?;
        let response = error_for_status(response, &self.url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RdsyncError::transfer(format!("reading signature of {file}"), e))?;
        Ok(bytes.to_vec())
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
        let headers = self.push_headers(source, file, metadata)?;
        let body = Body::wrap_stream(multipart_body(NeedPartReader::new(needs, content)));
        self.post_report("/synchronization/MultipartProceed", headers, Some(body), cancel)
            .await
    }

    async fn push_metadata(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        let headers = self.push_headers(source, file, metadata)?;
        self.post_report("/synchronization/UpdateMetadata", headers, None, cancel)
            .await
    }

    async fn push_rename(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        let headers = self.push_headers(source, file, metadata)?;
        self.post_report("/synchronization/rename", headers, None, cancel)
            .await
    }

    async fn push_delete(
        &self,
        source: &ServerInfo,
        file: &str,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> RdsyncResult<SynchronizationReport> {
        let headers = self.push_headers(source, file, metadata)?;
        self.post_report("/synchronization/delete", headers, None, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_dropped() {
        let dest = HttpDestination::new("http://peer:9090/", Duration::from_secs(5)).unwrap();
        assert_eq!(dest.url(), "http://peer:9090");
        assert_eq!(
            dest.endpoint("/synchronization/MultipartProceed"),
            "http://peer:9090/synchronization/MultipartProceed"
        );
    }

    #[test]
    fn push_headers_carry_identity_and_metadata() {
        let dest = HttpDestination::new("http://peer:9090", Duration::from_secs(5)).unwrap();
        let source = ServerInfo {
            url: "http://me:9090".into(),
            id: "me".into(),
        };
        let meta: Metadata = [("owner", "alice")].into_iter().collect();
        let headers = dest.push_headers(&source, "test.bin", &meta).unwrap();
        assert_eq!(headers.get("filename").unwrap(), "test.bin");
        assert_eq!(headers.get("owner").unwrap(), "alice");
        assert_eq!(multipart::parse_server_info(&headers).unwrap(), source);
    }

    #[tokio::test]
    async fn unreachable_peer_is_transfer_error() {
        let dest = HttpDestination::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = dest.metadata("a").await.unwrap_err();
        assert!(matches!(err, RdsyncError::Transfer { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn cancelled_push_is_operation_canceled() {
        let dest = HttpDestination::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dest
            .push_metadata(
                &ServerInfo {
                    url: "http://me".into(),
                    id: "me".into(),
                },
                "a",
                &Metadata::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RdsyncError::OperationCanceled));
    }
}
