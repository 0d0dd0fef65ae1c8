//! Session-scoped state shared by the tracker, controller and poller.
//!
//! A [`Session`] is created once per externally issued session id and handed
//! to each component as an `Arc<Session>`. All mutation happens under a short
//! synchronous lock, so every change of the image list and the readiness it
//! implies is observed as one step. Readiness edges are broadcast before that
//! lock is released, so subscribers see them in the order they happened.

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::errors::{Error, Result};
use crate::types::{SessionId, SessionStatus, UploadedImage};

/// Accepted-image count against the number the session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub current: usize,
    pub required: usize,
}

impl UploadProgress {
    /// Readiness is derived from the count, never stored separately.
    pub fn is_ready(&self) -> bool {
        self.current >= self.required
    }
}

/// Edge in readiness caused by a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessChange {
    BecameReady,
    BecameUnready,
}

impl ReadinessChange {
    fn between(before: UploadProgress, after: UploadProgress) -> Option<Self> {
        match (before.is_ready(), after.is_ready()) {
            (false, true) => Some(ReadinessChange::BecameReady),
            (true, false) => Some(ReadinessChange::BecameUnready),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    images: Vec<UploadedImage>,
    status: SessionStatus,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    required: usize,
    state: Mutex<SessionState>,
    progress_tx: watch::Sender<UploadProgress>,
    status_tx: watch::Sender<SessionStatus>,
    readiness_tx: broadcast::Sender<ReadinessChange>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, required: usize) -> Result<Self> {
        if required == 0 {
            return Err(Error::InvalidState {
                message: "A session must require at least one image".to_string(),
            });
        }

        let (progress_tx, _) = watch::channel(UploadProgress { current: 0, required });
        let (status_tx, _) = watch::channel(SessionStatus::Collecting);
        let (readiness_tx, _) = broadcast::channel(64);

        Ok(Self {
            id: id.into(),
            required,
            state: Mutex::new(SessionState {
                images: Vec::new(),
                status: SessionStatus::Collecting,
            }),
            progress_tx,
            status_tx,
            readiness_tx,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn required_image_count(&self) -> usize {
        self.required
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Snapshot of the accepted images in submission order.
    pub fn images(&self) -> Vec<UploadedImage> {
        self.state.lock().images.clone()
    }

    pub fn progress(&self) -> UploadProgress {
        let state = self.state.lock();
        UploadProgress {
            current: state.images.len(),
            required: self.required,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.progress().is_ready()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Receive an event each time readiness flips.
    pub fn subscribe_readiness(&self) -> broadcast::Receiver<ReadinessChange> {
        self.readiness_tx.subscribe()
    }

    /// Record a successful upload.
    pub fn add_image(&self, image: UploadedImage) -> Result<(UploadProgress, Option<ReadinessChange>)> {
        let mut state = self.state.lock();
        if state.status != SessionStatus::Collecting {
            return Err(Error::InvalidState {
                message: format!(
                    "Session {} is {}; {} can no longer be added",
                    self.id, state.status, image.original_name
                ),
            });
        }

        let before = self.progress_of(&state);
        state.images.push(image);
        let after = self.progress_of(&state);

        Ok((after, self.publish_locked(before, after)))
    }

    /// Drop an image from local tracking by its server-assigned name.
    pub fn remove_image(&self, storage_name: &str) -> Result<(UploadedImage, UploadProgress, Option<ReadinessChange>)> {
        let mut state = self.state.lock();
        if state.status != SessionStatus::Collecting {
            return Err(Error::InvalidState {
                message: format!("Images cannot be removed once processing has started (session {})", self.id),
            });
        }

        let Some(position) = state.images.iter().position(|img| img.storage_name == storage_name) else {
            return Err(Error::InvalidState {
                message: format!("No uploaded image named {storage_name} in session {}", self.id),
            });
        };

        let before = self.progress_of(&state);
        let removed = state.images.remove(position);
        let after = self.progress_of(&state);

        Ok((removed, after, self.publish_locked(before, after)))
    }

    /// Move into `processing`. Requires the full image count; re-entering from
    /// `processing` is allowed so a failed start can be retried.
    pub fn begin_processing(&self) -> Result<()> {
        let mut state = self.state.lock();
        let progress = self.progress_of(&state);
        if !progress.is_ready() {
            return Err(Error::InvalidState {
                message: format!(
                    "Session {} has {}/{} images; processing is unavailable",
                    self.id, progress.current, progress.required
                ),
            });
        }
        self.advance_locked(&mut state, SessionStatus::Processing)
    }

    /// Apply a status observed from the server or a processing outcome.
    pub fn advance(&self, next: SessionStatus) -> Result<()> {
        let mut state = self.state.lock();
        self.advance_locked(&mut state, next)
    }

    fn advance_locked(&self, state: &mut SessionState, next: SessionStatus) -> Result<()> {
        if !state.status.can_advance_to(next) {
            return Err(Error::InvalidState {
                message: format!("Session {} cannot move from {} to {}", self.id, state.status, next),
            });
        }
        if state.status != next {
            tracing::debug!(session_id = %self.id, from = %state.status, to = %next, "Session status changed");
            state.status = next;
            self.status_tx.send_replace(next);
        }
        Ok(())
    }

    /// Publish progress and any readiness edge. Callers hold the state lock.
    fn publish_locked(&self, before: UploadProgress, after: UploadProgress) -> Option<ReadinessChange> {
        self.progress_tx.send_replace(after);
        let change = ReadinessChange::between(before, after);
        if let Some(change) = change {
            // No subscribers is fine
            let _ = self.readiness_tx.send(change);
        }
        change
    }

    fn progress_of(&self, state: &SessionState) -> UploadProgress {
        UploadProgress {
            current: state.images.len(),
            required: self.required,
        }
    }
}
