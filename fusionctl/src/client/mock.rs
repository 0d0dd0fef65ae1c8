//! Test/mock implementation of [`FusionApi`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use super::{FusionApi, ProcessingResult};
use crate::errors::{Error, Result};
use crate::types::{FileCandidate, ImageKind, SessionId, SessionStatus, UploadReceipt, UploadedImage};

/// Record of a call made to the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Upload { session_id: SessionId, file_name: String },
    StartProcessing { session_id: SessionId },
    QueryStatus { session_id: SessionId },
}

/// Mock fusion API for testing.
///
/// Responses are queued per operation and returned in FIFO order; upload
/// responses are keyed by the candidate's file name so concurrent uploads
/// resolve independently. Calls with nothing queued fail.
///
/// # Example
/// ```ignore
/// let mock = MockFusionApi::new();
/// mock.accept_upload("left.jpg", "3f2a.jpg");
/// mock.add_processing_response(Ok(ProcessingResult { result_location }));
/// ```
#[derive(Clone, Default)]
pub struct MockFusionApi {
    uploads: Arc<Mutex<HashMap<String, VecDeque<Result<UploadReceipt>>>>>,
    processing: Arc<Mutex<VecDeque<Result<ProcessingResult>>>>,
    statuses: Arc<Mutex<VecDeque<Result<SessionStatus>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    upload_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    processing_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    status_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MockFusionApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_upload_response(&self, file_name: &str, response: Result<UploadReceipt>) {
        self.uploads
            .lock()
            .entry(file_name.to_string())
            .or_default()
            .push_back(response);
    }

    /// Queue a successful upload of `file_name`, stored as `storage_name`.
    pub fn accept_upload(&self, file_name: &str, storage_name: &str) {
        let kind = match storage_name.rsplit('.').next() {
            Some("png") => ImageKind::Png,
            Some("tif") | Some("tiff") => ImageKind::Tiff,
            _ => ImageKind::Jpeg,
        };
        self.add_upload_response(
            file_name,
            Ok(UploadReceipt {
                image: UploadedImage {
                    storage_name: storage_name.to_string(),
                    original_name: file_name.to_string(),
                    size_bytes: 0,
                    kind,
                    uploaded_at: chrono::Utc::now(),
                },
                server_count: None,
                total_needed: None,
            }),
        );
    }

    pub fn add_processing_response(&self, response: Result<ProcessingResult>) {
        self.processing.lock().push_back(response);
    }

    /// Queue a successful processing run pointing at `location`.
    pub fn succeed_processing(&self, location: &str) {
        let result = Url::parse(location)
            .map(|result_location| ProcessingResult { result_location })
            .map_err(|e| Error::Other(anyhow::anyhow!("bad mock location: {e}")));
        self.add_processing_response(result);
    }

    pub fn add_status_response(&self, response: Result<SessionStatus>) {
        self.statuses.lock().push_back(response);
    }

    pub fn add_statuses(&self, statuses: impl IntoIterator<Item = SessionStatus>) {
        let mut queue = self.statuses.lock();
        queue.extend(statuses.into_iter().map(Ok));
    }

    /// Hold every subsequent upload open until permits are added to the
    /// returned semaphore (one permit releases one call).
    pub fn hold_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.upload_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold every subsequent start-processing call open until released.
    pub fn hold_processing(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.processing_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold every subsequent status query open until released.
    pub fn hold_statuses(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.status_gate.lock() = Some(gate.clone());
        gate
    }

    /// Stop holding status queries; calls already parked stay parked.
    pub fn release_statuses(&self) {
        *self.status_gate.lock() = None;
    }

    /// Get all calls that have been made to this mock.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn upload_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Upload { .. }))
    }

    pub fn processing_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::StartProcessing { .. }))
    }

    pub fn status_calls(&self) -> usize {
        self.count(|c| matches!(c, MockCall::QueryStatus { .. }))
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl FusionApi for MockFusionApi {
    async fn upload(&self, session_id: &SessionId, file: &FileCandidate) -> Result<UploadReceipt> {
        self.calls.lock().push(MockCall::Upload {
            session_id: session_id.clone(),
            file_name: file.name.clone(),
        });

        Self::pass_gate(&self.upload_gate).await;

        let next = self.uploads.lock().get_mut(&file.name).and_then(|q| q.pop_front());
        next.unwrap_or_else(|| {
            Err(Error::Other(anyhow::anyhow!(
                "No mock upload response configured for {}",
                file.name
            )))
        })
    }

    async fn start_processing(&self, session_id: &SessionId) -> Result<ProcessingResult> {
        self.calls.lock().push(MockCall::StartProcessing {
            session_id: session_id.clone(),
        });

        Self::pass_gate(&self.processing_gate).await;

        let next = self.processing.lock().pop_front();
        next.unwrap_or_else(|| Err(Error::Other(anyhow::anyhow!("No mock processing response configured"))))
    }

    async fn query_status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        self.calls.lock().push(MockCall::QueryStatus {
            session_id: session_id.clone(),
        });

        Self::pass_gate(&self.status_gate).await;

        let next = self.statuses.lock().pop_front();
        next.unwrap_or_else(|| Err(Error::Other(anyhow::anyhow!("No mock status response configured"))))
    }
}
