//! Reqwest-backed implementation of the remote API contract.
//!
//! Talks to a Drive-style REST surface: paginated `files` listing with a
//! parent query, `alt=media` ranged content reads, and `files/{id}/export`
//! for native documents. The base URL is injectable so tests can point the
//! client at a local mock server. Credential acquisition happens elsewhere;
//! this client is handed an already-valid bearer token.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{ByteStream, CloudClient, Entry, FileList, PAGE_SIZE};
use crate::errors::{SyncError, classify_status};

/// Production API endpoint.
const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3/";

/// Connect timeout for all requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Total deadline for a listing page request.
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total deadline for a single-entry metadata request.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry fields requested from the remote.
const ENTRY_FIELDS: &str = "id,name,mimeType,size,md5Checksum,modifiedTime,parents";

/// Remote client over a Drive-style REST API.
#[derive(Debug, Clone)]
pub struct DriveClient {
    client: Client,
    base_url: Url,
    token: String,
}

/// Error body shape returned by the remote on failures.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    errors: Vec<ErrorItem>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

impl DriveClient {
    /// Creates a client against the production endpoint.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error if the HTTP client cannot be built.
    pub fn new(token: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    /// Creates a client against an explicit base URL (tests point this at
    /// a mock server). The URL must end with a trailing slash so relative
    /// joins keep the path prefix.
    ///
    /// # Errors
    ///
    /// Returns a config-kind error for an unparseable base URL or an HTTP
    /// client build failure.
    pub fn with_base_url(
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::config(format!("invalid API base URL: {e}")))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::config(format!("invalid API path {path}: {e}")))
    }

    /// Maps a non-success response into the error taxonomy, consuming the
    /// body to extract the upstream reason string when one is present.
    async fn error_from_response(response: Response) -> SyncError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (reason, message) = parse_error_body(&body);
        let kind = classify_status(status, reason.as_deref());
        let detail = if message.is_empty() {
            format!("remote returned HTTP {status}")
        } else {
            format!("remote returned HTTP {status}: {message}")
        };
        SyncError::new(kind, detail)
    }

    async fn check(response: Response) -> Result<Response, SyncError> {
        if response.status().is_success() || response.status() == StatusCode::PARTIAL_CONTENT {
            Ok(response)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }

    fn stream_body(response: Response) -> ByteStream {
        Box::pin(
            response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(|e| SyncError::network(format!("body read failed: {e}")).with_source(e)),
        )
    }
}

/// Best-effort extraction of (reason, message) from a remote error body.
fn parse_error_body(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error: Some(detail) }) => {
            let reason = detail
                .errors
                .into_iter()
                .map(|e| e.reason)
                .find(|r| !r.is_empty());
            (reason, detail.message)
        }
        _ => (None, String::new()),
    }
}

#[async_trait]
impl CloudClient for DriveClient {
    #[instrument(skip(self), fields(folder_id = %folder_id))]
    async fn list(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, SyncError> {
        let url = self.endpoint("files")?;
        let query = format!("'{folder_id}' in parents and trashed = false");
        let fields = format!("nextPageToken,files({ENTRY_FIELDS})");

        let mut request = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .timeout(LIST_TIMEOUT)
            .query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("orderBy", "name"),
            ])
            .query(&[("pageSize", PAGE_SIZE)]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::network(format!("listing request failed: {e}")).with_source(e))?;
        let response = Self::check(response).await?;
        let list: FileList = response
            .json()
            .await
            .map_err(|e| SyncError::api(format!("invalid listing body: {e}")).with_source(e))?;

        debug!(entries = list.entries.len(), has_next = list.next_page_token.is_some(), "listed page");
        Ok(list)
    }

    #[instrument(skip(self), fields(file_id = %file_id))]
    async fn metadata(&self, file_id: &str) -> Result<Entry, SyncError> {
        let url = self.endpoint(&format!("files/{file_id}"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .timeout(METADATA_TIMEOUT)
            .query(&[("fields", ENTRY_FIELDS)])
            .send()
            .await
            .map_err(|e| SyncError::network(format!("metadata request failed: {e}")).with_source(e))?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::api(format!("invalid metadata body: {e}")).with_source(e))
    }

    #[instrument(skip(self), fields(file_id = %file_id, start, end))]
    async fn download_range(
        &self,
        file_id: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, SyncError> {
        let url = self.endpoint(&format!("files/{file_id}"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .header(RANGE, format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| SyncError::network(format!("range request failed: {e}")).with_source(e))?;
        let response = Self::check(response).await?;
        Ok(Self::stream_body(response))
    }

    #[instrument(skip(self), fields(file_id = %file_id, target = %target_content_type))]
    async fn export(
        &self,
        file_id: &str,
        target_content_type: &str,
    ) -> Result<ByteStream, SyncError> {
        let url = self.endpoint(&format!("files/{file_id}/export"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("mimeType", target_content_type)])
            .send()
            .await
            .map_err(|e| SyncError::network(format!("export request failed: {e}")).with_source(e))?;
        let response = Self::check(response).await?;
        Ok(Self::stream_body(response))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::SyncErrorKind;

    #[test]
    fn test_with_base_url_rejects_garbage() {
        let result = DriveClient::with_base_url("not a url", "tok");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, SyncErrorKind::Config);
    }

    #[test]
    fn test_endpoint_preserves_base_path_prefix() {
        let client = DriveClient::with_base_url("http://localhost:1234/drive/v3/", "tok").unwrap();
        let url = client.endpoint("files/abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:1234/drive/v3/files/abc");
    }

    #[test]
    fn test_parse_error_body_extracts_reason_and_message() {
        let body = r#"{
            "error": {
                "errors": [{"reason": "userRateLimitExceeded"}],
                "code": 403,
                "message": "User rate limit exceeded"
            }
        }"#;
        let (reason, message) = parse_error_body(body);
        assert_eq!(reason.as_deref(), Some("userRateLimitExceeded"));
        assert_eq!(message, "User rate limit exceeded");
    }

    #[test]
    fn test_parse_error_body_tolerates_non_json() {
        let (reason, message) = parse_error_body("<html>oops</html>");
        assert!(reason.is_none());
        assert!(message.is_empty());
    }
}
