//! Remote session operations.
//!
//! This module defines the `FusionApi` trait wrapping the three calls the
//! workflow makes against a fusion session (upload a file, start processing,
//! query status), a reqwest-backed implementation and a recording mock.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tracing::instrument;
use url::Url;

use crate::config::Config;
use crate::errors::{Error, Result, ValidationError};
use crate::types::{
    FileCandidate, ImageKind, ProcessResponse, SessionId, SessionStatus, StatusResponse, UploadReceipt, UploadResponse,
    UploadedImage,
};

pub mod mock;

pub use mock::{MockCall, MockFusionApi};

/// Successful start-processing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    /// Where the fused result can be viewed; the caller navigates here.
    pub result_location: Url,
}

/// The three remote operations against a single fusion session.
///
/// Each call is independent at the transport level. Callers are responsible
/// for the business rules around them: `start_processing` must not be issued
/// twice for the same session while a call is outstanding (see
/// [`crate::controller::ProcessingController`]).
#[async_trait]
pub trait FusionApi: Send + Sync {
    /// Transfer one file into the session. Safe to call concurrently for
    /// distinct files.
    async fn upload(&self, session_id: &SessionId, file: &FileCandidate) -> Result<UploadReceipt>;

    /// Run the fusion for the session.
    async fn start_processing(&self, session_id: &SessionId) -> Result<ProcessingResult>;

    /// Read-only status lookup.
    async fn query_status(&self, session_id: &SessionId) -> Result<SessionStatus>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Client for the fusion server's JSON routes.
#[derive(Clone)]
pub struct ReqwestFusionClient {
    client: reqwest::Client,
    base_url: Url,
    processing_timeout: Duration,
}

impl ReqwestFusionClient {
    pub fn new(base_url: Url, request_timeout: Duration, processing_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            processing_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.base_url.clone(), config.request_timeout, config.processing_timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `{base}/{route}/{session}`, escaping the session id as a path segment.
    fn endpoint(&self, route: &str, session_id: &SessionId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config {
                message: format!("base URL {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .push(route)
            .push(session_id.as_str());
        Ok(url)
    }

    /// Resolve a server-provided location (usually a path) against the base URL.
    fn resolve_location(&self, location: &str) -> Result<Url> {
        self.base_url.join(location).map_err(|e| Error::TransportMessage {
            operation: "processing",
            message: format!("invalid result location '{location}': {e}"),
        })
    }

    async fn send(&self, operation: &'static str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| {
            tracing::error!(operation, error = %e, "HTTP request failed");
            Error::Transport { operation, source: e }
        })
    }
}

/// Decode a JSON body regardless of HTTP status; the server reports business
/// failures as JSON with 4xx/5xx codes.
async fn decode_body<T: DeserializeOwned>(operation: &'static str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Transport { operation, source: e })?;

    tracing::debug!(operation, status = status.as_u16(), body_len = body.len(), "Received response");

    match serde_json::from_str::<T>(&body) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            tracing::error!(operation, status = status.as_u16(), error = %e, "Failed to parse response body");
            let message = if status.is_success() {
                format!("error decoding response body: {e}")
            } else {
                format!("server returned {status}")
            };
            Err(Error::TransportMessage { operation, message })
        }
    }
}

#[async_trait]
impl FusionApi for ReqwestFusionClient {
    #[instrument(skip(self, file), fields(session_id = %session_id, file = %file.name, size_bytes = file.size_bytes()))]
    async fn upload(&self, session_id: &SessionId, file: &FileCandidate) -> Result<UploadReceipt> {
        let kind = ImageKind::from_mime(&file.mime_type).ok_or_else(|| ValidationError::UnsupportedType {
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
        })?;

        let url = self.endpoint("upload_file", session_id)?;
        let part = Part::stream_with_length(reqwest::Body::from(file.data.clone()), file.size_bytes())
            .file_name(file.name.clone())
            .mime_str(kind.mime_type())
            .map_err(|e| Error::Transport {
                operation: "upload",
                source: e,
            })?;
        let form = Form::new().part("file", part);

        let response = self.send("upload", self.client.post(url).multipart(form)).await?;
        let body: UploadResponse = decode_body("upload", response).await?;

        if !body.success {
            return Err(Error::Processing {
                operation: "upload",
                message: body.error.unwrap_or_else(|| "Error uploading file".to_string()),
            });
        }

        let storage_name = body.filename.ok_or_else(|| Error::TransportMessage {
            operation: "upload",
            message: "response did not include a stored filename".to_string(),
        })?;

        tracing::info!(storage_name = %storage_name, current_count = ?body.current_count, "Upload accepted");

        Ok(UploadReceipt {
            image: UploadedImage {
                storage_name,
                original_name: body.original_filename.unwrap_or_else(|| file.name.clone()),
                size_bytes: file.size_bytes(),
                kind,
                uploaded_at: chrono::Utc::now(),
            },
            server_count: body.current_count,
            total_needed: body.total_needed,
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn start_processing(&self, session_id: &SessionId) -> Result<ProcessingResult> {
        let url = self.endpoint("process_fusion", session_id)?;
        let request = self.client.post(url).timeout(self.processing_timeout);

        let response = self.send("processing", request).await?;
        let body: ProcessResponse = decode_body("processing", response).await?;

        if !body.success {
            return Err(Error::Processing {
                operation: "processing",
                message: body.error.unwrap_or_else(|| "Fusion processing failed".to_string()),
            });
        }

        let location = body.result_url.ok_or_else(|| Error::TransportMessage {
            operation: "processing",
            message: "response did not include a result location".to_string(),
        })?;
        let result_location = self.resolve_location(&location)?;

        tracing::info!(result_location = %result_location, "Processing finished");
        Ok(ProcessingResult { result_location })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn query_status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        let url = self.endpoint("status", session_id)?;
        let response = self.send("status query", self.client.get(url)).await?;

        if !response.status().is_success() {
            return Err(Error::TransportMessage {
                operation: "status query",
                message: format!("server returned {}", response.status()),
            });
        }

        let body: StatusResponse = decode_body("status query", response).await?;
        tracing::trace!(status = %body.status, "Status queried");
        Ok(body.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ReqwestFusionClient {
        ReqwestFusionClient::new(
            Url::parse(&server.uri()).unwrap(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn jpeg(name: &str) -> FileCandidate {
        FileCandidate::new(name, "image/jpeg", vec![0xFFu8, 0xD8, 0xFF, 0xE0])
    }

    #[tokio::test]
    async fn test_upload_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload_file/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "filename": "3f2a.jpg",
                "original_filename": "left.jpg",
                "current_count": 1,
                "total_needed": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = client_for(&server).upload(&"42".into(), &jpeg("left.jpg")).await.unwrap();
        assert_eq!(receipt.image.storage_name, "3f2a.jpg");
        assert_eq!(receipt.image.original_name, "left.jpg");
        assert_eq!(receipt.image.kind, ImageKind::Jpeg);
        assert_eq!(receipt.image.size_bytes, 4);
        assert_eq!(receipt.server_count, Some(1));
        assert_eq!(receipt.total_needed, Some(2));
    }

    #[tokio::test]
    async fn test_upload_rejected_with_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload_file/42"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "Maximum number of images reached"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).upload(&"42".into(), &jpeg("third.jpg")).await.unwrap_err();
        match err {
            Error::Processing { operation, message } => {
                assert_eq!(operation, "upload");
                assert_eq!(message, "Maximum number of images reached");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_unsupported_type_never_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

        let gif = FileCandidate::new("cat.gif", "image/gif", vec![1u8, 2, 3]);
        let err = client_for(&server).upload(&"42".into(), &gif).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnsupportedType { .. })));
    }

    #[tokio::test]
    async fn test_start_processing_resolves_result_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process_fusion/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result_url": "/result/42"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server).start_processing(&"42".into()).await.unwrap();
        assert_eq!(result.result_location.path(), "/result/42");
        assert!(result.result_location.as_str().starts_with(&server.uri()));
    }

    #[tokio::test]
    async fn test_start_processing_failure_is_processing_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process_fusion/42"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "Fusion processing failed"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).start_processing(&"42".into()).await.unwrap_err();
        assert!(matches!(err, Error::Processing { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_non_json_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process_fusion/42"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).start_processing(&"42".into()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_query_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "completed"})))
            .mount(&server)
            .await;

        let status = client_for(&server).query_status(&"42".into()).await.unwrap();
        assert_eq!(status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let client = ReqwestFusionClient::new(
            Url::parse("http://127.0.0.1:1").unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = client.query_status(&"42".into()).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn test_endpoint_escapes_session_id() {
        let client = ReqwestFusionClient::new(
            Url::parse("https://fusion.example.com/app/").unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        let url = client.endpoint("status", &"a/b".into()).unwrap();
        assert_eq!(url.as_str(), "https://fusion.example.com/app/status/a%2Fb");
    }
}
