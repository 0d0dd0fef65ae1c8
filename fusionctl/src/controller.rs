//! Processing state machine.
//!
//! ```text
//! idle ──start()──▶ starting ──call issued──▶ waiting_for_result ──ok──▶ done
//!   ▲                                                  │
//!   └──────────────── start() (retry) ◀── error ◀──────┘ err
//! ```
//!
//! A single guard flag is checked-and-set synchronously at the top of
//! [`ProcessingController::start`], before anything is awaited, so two rapid
//! triggers can never both issue the remote call. The guard is released on
//! every exit path, including a dropped future.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use url::Url;

use crate::client::{FusionApi, ProcessingResult};
use crate::errors::Error;
use crate::notify::{Notice, Notifier};
use crate::session::Session;
use crate::types::SessionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingState {
    Idle,
    Starting,
    WaitingForResult,
    Done { result_location: Url },
    Error { message: String },
}

impl ProcessingState {
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessingState::Starting | ProcessingState::WaitingForResult)
    }
}

/// Why a start request was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Fewer images than the session requires
    NotReady,
    /// A run is already outstanding
    InProgress,
    /// The session already produced a result
    AlreadyDone,
}

#[derive(Debug)]
pub enum StartOutcome {
    Completed(ProcessingResult),
    Failed(Error),
    Ignored(IgnoreReason),
}

pub struct ProcessingController<A: FusionApi> {
    session: Arc<Session>,
    api: Arc<A>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
    state_tx: watch::Sender<ProcessingState>,
}

impl<A: FusionApi> ProcessingController<A> {
    pub fn new(session: Arc<Session>, api: Arc<A>, notifier: Arc<dyn Notifier>) -> Self {
        let (state_tx, _) = watch::channel(ProcessingState::Idle);
        Self {
            session,
            api,
            notifier,
            running: AtomicBool::new(false),
            state_tx,
        }
    }

    pub fn state(&self) -> ProcessingState {
        self.state_tx.borrow().clone()
    }

    /// Watch state changes; the UI renders from this, never the other way round.
    pub fn subscribe(&self) -> watch::Receiver<ProcessingState> {
        self.state_tx.subscribe()
    }

    /// Whether a call to [`start`](Self::start) would issue the remote call right now.
    pub fn is_available(&self) -> bool {
        self.session.is_ready()
            && !self.session.status().is_terminal()
            && !self.running.load(Ordering::SeqCst)
            && matches!(self.state(), ProcessingState::Idle | ProcessingState::Error { .. })
    }

    /// Run the fusion once. Re-entrant calls while a run is outstanding are ignored.
    #[tracing::instrument(skip(self), fields(session_id = %self.session.id()))]
    pub async fn start(&self) -> StartOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Processing already in progress, ignoring start");
            return StartOutcome::Ignored(IgnoreReason::InProgress);
        }
        let _guard = scopeguard::guard(self, |this| {
            // An abandoned call leaves nothing outstanding
            this.state_tx.send_if_modified(|state| {
                if state.is_active() {
                    *state = ProcessingState::Idle;
                    true
                } else {
                    false
                }
            });
            this.running.store(false, Ordering::SeqCst);
        });

        if matches!(self.state(), ProcessingState::Done { .. }) {
            tracing::debug!("Processing already completed, ignoring start");
            return StartOutcome::Ignored(IgnoreReason::AlreadyDone);
        }
        if !self.session.is_ready() {
            tracing::debug!("Not enough images uploaded, ignoring start");
            return StartOutcome::Ignored(IgnoreReason::NotReady);
        }

        self.state_tx.send_replace(ProcessingState::Starting);

        if let Err(e) = self.session.begin_processing() {
            return self.fail(e);
        }

        let call = self.api.start_processing(self.session.id());
        self.state_tx.send_replace(ProcessingState::WaitingForResult);
        tracing::info!("Processing started");

        match call.await {
            Ok(result) => {
                if let Err(e) = self.session.advance(SessionStatus::Complete) {
                    // The poller may already have observed a terminal status
                    tracing::debug!(error = %e, "Session status not advanced after processing");
                }
                tracing::info!(result_location = %result.result_location, "Processing completed");
                self.state_tx.send_replace(ProcessingState::Done {
                    result_location: result.result_location.clone(),
                });
                self.notifier.notify(Notice::success("Fusion complete"));
                StartOutcome::Completed(result)
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, error: Error) -> StartOutcome {
        let message = error.user_message();
        tracing::warn!(error = %error, "Processing failed, retry permitted");
        self.state_tx.send_replace(ProcessingState::Error {
            message: message.clone(),
        });
        self.notifier.notify(Notice::error(message));
        StartOutcome::Failed(error)
    }
}
