//! Background status polling.
//!
//! A [`StatusPoller`] queries a session's status on a fixed interval until the
//! server reports anything other than `processing`. Each tick issues its query
//! on its own task, so a slow response never delays the next tick. Failed
//! queries are logged and retried on the following tick.
//!
//! Every poll is owned by a [`PollHandle`]. Dropping the handle (or calling
//! [`PollHandle::stop`]) cancels the loop and any queries still in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::client::FusionApi;
use crate::config::PollingConfig;
use crate::errors::{Error, Result};
use crate::session::Session;
use crate::types::{SessionId, SessionStatus};

pub struct StatusPoller<A: FusionApi> {
    api: Arc<A>,
    interval: Duration,
}

impl<A: FusionApi> Clone for StatusPoller<A> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            interval: self.interval,
        }
    }
}

/// Owner of one running poll loop.
pub struct PollHandle {
    session_id: SessionId,
    token: CancellationToken,
    _drop_guard: DropGuard,
    latest: watch::Receiver<Option<SessionStatus>>,
    task: JoinHandle<Option<SessionStatus>>,
}

impl PollHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Most recent status the server reported, if any query has succeeded yet.
    pub fn latest(&self) -> Option<SessionStatus> {
        *self.latest.borrow()
    }

    /// Receiver updated after every successful query.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionStatus>> {
        self.latest.clone()
    }

    /// Stop polling. Idempotent; outstanding queries are abandoned.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end. Yields the first non-`processing` status, or
    /// `None` when the poll was stopped first.
    pub async fn settled(mut self) -> Result<Option<SessionStatus>> {
        (&mut self.task)
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("status poll for {} aborted: {e}", self.session_id)))
    }
}

impl<A: FusionApi + 'static> StatusPoller<A> {
    pub fn new(api: Arc<A>, config: &PollingConfig) -> Self {
        Self {
            api,
            interval: config.interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `session_id` until it leaves `processing`.
    pub fn poll(&self, session_id: impl Into<SessionId>) -> PollHandle {
        self.spawn(session_id.into(), None)
    }

    /// Like [`poll`](Self::poll), additionally applying each observed status to
    /// the tracked session.
    pub fn poll_session(&self, session: Arc<Session>) -> PollHandle {
        self.spawn(session.id().clone(), Some(session))
    }

    fn spawn(&self, session_id: SessionId, session: Option<Arc<Session>>) -> PollHandle {
        let token = CancellationToken::new();
        let (latest_tx, latest) = watch::channel(None);
        let span = info_span!("status_poll", session_id = %session_id);

        let task = tokio::spawn(
            run_poll_loop(
                self.api.clone(),
                session_id.clone(),
                session,
                self.interval,
                latest_tx,
                token.clone(),
            )
            .instrument(span),
        );

        PollHandle {
            session_id,
            _drop_guard: token.clone().drop_guard(),
            token,
            latest,
            task,
        }
    }
}

async fn run_poll_loop<A: FusionApi + 'static>(
    api: Arc<A>,
    session_id: SessionId,
    session: Option<Arc<Session>>,
    period: Duration,
    latest_tx: watch::Sender<Option<SessionStatus>>,
    token: CancellationToken,
) -> Option<SessionStatus> {
    debug!(interval = ?period, "Starting status poll");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Dropping the set aborts whatever is still outstanding
    let mut queries: JoinSet<Result<SessionStatus>> = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Status poll stopped");
                return None;
            }
            _ = ticker.tick() => {
                let api = api.clone();
                let session_id = session_id.clone();
                queries.spawn(async move { api.query_status(&session_id).await });
            }
            Some(joined) = queries.join_next() => {
                let status = match joined {
                    Ok(Ok(status)) => status,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Status query failed, retrying on next tick");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Status query task failed");
                        continue;
                    }
                };

                latest_tx.send_replace(Some(status));
                if let Some(session) = &session {
                    if let Err(e) = session.advance(status) {
                        debug!(error = %e, "Observed status not applied to session");
                    }
                }

                match status {
                    SessionStatus::Processing => debug!("Session still processing"),
                    other => {
                        info!(status = %other, "Session left processing");
                        return Some(other);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockFusionApi;
    use crate::types::{ImageKind, UploadedImage};

    fn poller(api: &Arc<MockFusionApi>) -> StatusPoller<MockFusionApi> {
        StatusPoller::new(
            api.clone(),
            &PollingConfig {
                interval: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_first_terminal_status() {
        let api = Arc::new(MockFusionApi::new());
        api.add_statuses([
            SessionStatus::Processing,
            SessionStatus::Processing,
            SessionStatus::Complete,
        ]);

        let start = tokio::time::Instant::now();
        let handle = poller(&api).poll("s1");
        let settled = handle.settled().await.unwrap();

        assert_eq!(settled, Some(SessionStatus::Complete));
        assert_eq!(api.status_calls(), 3);
        // Third query is issued on the third tick: t=0, 5, 10
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_does_not_delay_next_tick() {
        let api = Arc::new(MockFusionApi::new());
        let _gate = api.hold_statuses();

        let start = tokio::time::Instant::now();
        let handle = poller(&api).poll("s1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        // First query is parked and never answers
        assert_eq!(api.status_calls(), 1);
        assert_eq!(handle.latest(), None);

        api.release_statuses();
        api.add_statuses([SessionStatus::Processing, SessionStatus::Complete]);

        let settled = handle.settled().await.unwrap();
        assert_eq!(settled, Some(SessionStatus::Complete));
        assert_eq!(api.status_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_does_not_end_loop() {
        let api = Arc::new(MockFusionApi::new());
        api.add_status_response(Ok(SessionStatus::Processing));
        api.add_status_response(Err(Error::TransportMessage {
            operation: "status",
            message: "connection reset".to_string(),
        }));
        api.add_status_response(Ok(SessionStatus::Failed));

        let settled = poller(&api).poll("s1").settled().await.unwrap();
        assert_eq!(settled, Some(SessionStatus::Failed));
        assert_eq!(api.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_polling() {
        let api = Arc::new(MockFusionApi::new());
        api.add_statuses(std::iter::repeat_n(SessionStatus::Processing, 10));

        let handle = poller(&api).poll("s1");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(api.status_calls(), 2);
        assert_eq!(handle.latest(), Some(SessionStatus::Processing));

        handle.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls(), 2);
        assert_eq!(handle.settled().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_polling() {
        let api = Arc::new(MockFusionApi::new());
        api.add_statuses(std::iter::repeat_n(SessionStatus::Processing, 10));

        let handle = poller(&api).poll("s1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_poll_independently() {
        let api_a = Arc::new(MockFusionApi::new());
        api_a.add_statuses([SessionStatus::Processing, SessionStatus::Complete]);
        let api_b = Arc::new(MockFusionApi::new());
        api_b.add_statuses(std::iter::repeat_n(SessionStatus::Processing, 4));
        api_b.add_status_response(Ok(SessionStatus::Failed));

        let a = poller(&api_a).poll("a");
        let b = StatusPoller::new(
            api_b.clone(),
            &PollingConfig {
                interval: Duration::from_secs(2),
            },
        )
        .poll("b");

        let (a, b) = tokio::join!(a.settled(), b.settled());
        assert_eq!(a.unwrap(), Some(SessionStatus::Complete));
        assert_eq!(b.unwrap(), Some(SessionStatus::Failed));
        assert_eq!(api_a.status_calls(), 2);
        assert_eq!(api_b.status_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_status_applied_to_session() {
        let api = Arc::new(MockFusionApi::new());
        let session = Arc::new(Session::new("s1", 1).unwrap());
        session
            .add_image(UploadedImage {
                storage_name: "a.png".to_string(),
                original_name: "a.png".to_string(),
                size_bytes: 1,
                kind: ImageKind::Png,
                uploaded_at: chrono::Utc::now(),
            })
            .unwrap();
        session.begin_processing().unwrap();
        api.add_statuses([SessionStatus::Processing, SessionStatus::Complete]);

        let settled = poller(&api).poll_session(session.clone()).settled().await.unwrap();
        assert_eq!(settled, Some(SessionStatus::Complete));
        assert_eq!(session.status(), SessionStatus::Complete);
    }
}
