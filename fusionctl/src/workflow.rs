//! The client-facing surface over one fusion session.
//!
//! [`FusionWorkflow`] wires an [`UploadTracker`], a [`ProcessingController`] and
//! a [`StatusPoller`] around a shared [`Session`]. Callers drive it with
//! `submit_files`, `remove_image`, `start_processing` and `poll_status`, and
//! render from the read accessors or the subscriptions.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::client::{FusionApi, ReqwestFusionClient};
use crate::config::Config;
use crate::controller::{ProcessingController, ProcessingState, StartOutcome};
use crate::errors::Result;
use crate::notify::{Notifier, TracingNotifier};
use crate::poller::{PollHandle, StatusPoller};
use crate::session::{ReadinessChange, Session, UploadProgress};
use crate::tracker::{UploadOutcome, UploadTracker};
use crate::types::{FileCandidate, SessionId, SessionStatus, UploadedImage};

pub struct FusionWorkflow<A: FusionApi> {
    session: Arc<Session>,
    tracker: UploadTracker<A>,
    controller: ProcessingController<A>,
    poller: StatusPoller<A>,
}

impl FusionWorkflow<ReqwestFusionClient> {
    /// Build a workflow talking to the configured server, reporting notices to the log.
    pub fn connect(config: &Config, session_id: impl Into<SessionId>, required_images: usize) -> Result<Self> {
        let api = Arc::new(ReqwestFusionClient::from_config(config)?);
        let session = Arc::new(Session::new(session_id, required_images)?);
        Ok(Self::new(session, api, Arc::new(TracingNotifier), config))
    }
}

impl<A: FusionApi + 'static> FusionWorkflow<A> {
    pub fn new(session: Arc<Session>, api: Arc<A>, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self {
            tracker: UploadTracker::new(session.clone(), api.clone(), notifier.clone(), config.uploads.clone()),
            controller: ProcessingController::new(session.clone(), api.clone(), notifier),
            poller: StatusPoller::new(api, &config.polling),
            session,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn tracker(&self) -> &UploadTracker<A> {
        &self.tracker
    }

    pub fn controller(&self) -> &ProcessingController<A> {
        &self.controller
    }

    /// Validate and upload a batch; invalid files are reported and skipped.
    pub async fn submit_files(&self, files: Vec<FileCandidate>) -> Vec<UploadOutcome> {
        self.tracker.submit_files(files).await
    }

    pub fn remove_image(&self, storage_name: &str) -> Result<UploadProgress> {
        self.tracker.remove(storage_name)
    }

    pub async fn start_processing(&self) -> StartOutcome {
        self.controller.start().await
    }

    /// Poll any session's status. Polling this workflow's own session also
    /// applies what is observed to it.
    pub fn poll_status(&self, session_id: impl Into<SessionId>) -> PollHandle {
        let session_id = session_id.into();
        if &session_id == self.session.id() {
            self.poller.poll_session(self.session.clone())
        } else {
            self.poller.poll(session_id)
        }
    }

    /// Start one independent poll per session.
    pub fn poll_sessions<I, S>(&self, session_ids: I) -> Vec<PollHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        session_ids.into_iter().map(|id| self.poll_status(id)).collect()
    }

    pub fn progress(&self) -> UploadProgress {
        self.tracker.progress()
    }

    pub fn images(&self) -> Vec<UploadedImage> {
        self.session.images()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn state(&self) -> ProcessingState {
        self.controller.state()
    }

    pub fn is_processing_available(&self) -> bool {
        self.controller.is_available()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<UploadProgress> {
        self.session.subscribe_progress()
    }

    pub fn subscribe_readiness(&self) -> broadcast::Receiver<ReadinessChange> {
        self.tracker.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessingState> {
        self.controller.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockCall, MockFusionApi};
    use crate::notify::RecordingNotifier;

    #[tokio::test(start_paused = true)]
    async fn test_poll_own_session_updates_status() {
        let api = Arc::new(MockFusionApi::new());
        let session = Arc::new(Session::new("s1", 1).unwrap());
        let workflow = FusionWorkflow::new(session, api.clone(), Arc::new(RecordingNotifier::new()), &Config::default());

        api.accept_upload("a.png", "a1.png");
        workflow
            .submit_files(vec![FileCandidate::new("a.png", "image/png", vec![1u8; 8])])
            .await;
        workflow.session().begin_processing().unwrap();

        api.add_statuses([SessionStatus::Complete]);
        let settled = workflow.poll_status("s1").settled().await.unwrap();
        assert_eq!(settled, Some(SessionStatus::Complete));
        assert_eq!(workflow.status(), SessionStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sessions_queries_each_id() {
        let api = Arc::new(MockFusionApi::new());
        let session = Arc::new(Session::new("current", 1).unwrap());
        let workflow = FusionWorkflow::new(session, api.clone(), Arc::new(RecordingNotifier::new()), &Config::default());

        api.add_statuses([SessionStatus::Complete, SessionStatus::Failed]);
        let handles = workflow.poll_sessions(["old-1", "old-2"]);
        assert_eq!(handles.len(), 2);
        for handle in handles {
            assert!(handle.settled().await.unwrap().is_some());
        }

        let mut polled: Vec<_> = api
            .get_calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::QueryStatus { session_id } => Some(session_id.to_string()),
                _ => None,
            })
            .collect();
        polled.sort();
        assert_eq!(polled, vec!["old-1".to_string(), "old-2".to_string()]);
        // Other sessions never touch the local one
        assert_eq!(workflow.status(), SessionStatus::Collecting);
    }
}
