//! Upload validation and tracking.
//!
//! The tracker validates candidate files locally, hands valid ones to the
//! [`FusionApi`] concurrently, and records each accepted image on the shared
//! [`Session`]. Readiness is recomputed from the session's image count after
//! every mutation; the session broadcasts a [`ReadinessChange`] only when that
//! value flips, so each crossing of the required count is signalled exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::FusionApi;
use crate::config::UploadConfig;
use crate::errors::{Error, Result, ValidationError};
use crate::notify::{Notice, Notifier};
use crate::session::{ReadinessChange, Session, UploadProgress};
use crate::types::{FileCandidate, ImageKind, UploadedImage};

/// What happened to one submitted file.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Stored server-side and tracked on the session
    Accepted { image: UploadedImage, progress: UploadProgress },
    /// Rejected locally, nothing was transmitted
    Rejected(ValidationError),
    /// Transfer or server-side failure; the attempt left no trace
    Failed { file_name: String, error: Error },
}

impl UploadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted { .. })
    }
}

pub struct UploadTracker<A: FusionApi> {
    session: Arc<Session>,
    api: Arc<A>,
    notifier: Arc<dyn Notifier>,
    limits: UploadConfig,
    in_flight: Arc<AtomicUsize>,
}

impl<A: FusionApi> Clone for UploadTracker<A> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            api: self.api.clone(),
            notifier: self.notifier.clone(),
            limits: self.limits.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<A: FusionApi> UploadTracker<A> {
    pub fn new(session: Arc<Session>, api: Arc<A>, notifier: Arc<dyn Notifier>, limits: UploadConfig) -> Self {
        Self {
            session,
            api,
            notifier,
            limits,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn progress(&self) -> UploadProgress {
        self.session.progress()
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// Number of transfers currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Receive an event each time readiness flips.
    pub fn subscribe(&self) -> broadcast::Receiver<ReadinessChange> {
        self.session.subscribe_readiness()
    }

    /// Check type and size against the configured limits.
    pub fn validate(&self, file: &FileCandidate) -> std::result::Result<ImageKind, ValidationError> {
        if file.name.is_empty() {
            return Err(ValidationError::Empty { name: file.name.clone() });
        }

        let kind = ImageKind::from_mime(&file.mime_type)
            .filter(|kind| self.limits.allowed_types.contains(kind))
            .ok_or_else(|| ValidationError::UnsupportedType {
                name: file.name.clone(),
                mime_type: file.mime_type.clone(),
            })?;

        if file.size_bytes() > self.limits.max_file_bytes {
            return Err(ValidationError::TooLarge {
                name: file.name.clone(),
                size_bytes: file.size_bytes(),
                max_bytes: self.limits.max_file_bytes,
            });
        }

        Ok(kind)
    }

    /// Validate and upload a single file.
    pub async fn submit(&self, file: FileCandidate) -> UploadOutcome {
        if let Err(e) = self.validate(&file) {
            tracing::info!(session_id = %self.session.id(), file = %file.name, error = %e, "Rejected file before upload");
            self.notifier.notify(Notice::error(e.to_string()));
            return UploadOutcome::Rejected(e);
        }

        self.upload(file).await
    }

    /// Validate every file independently and upload the valid ones concurrently.
    ///
    /// Returns once every transfer has resolved, with one outcome per input in
    /// submission order.
    #[tracing::instrument(skip(self, files), fields(session_id = %self.session.id(), count = files.len()))]
    pub async fn submit_files(&self, files: Vec<FileCandidate>) -> Vec<UploadOutcome> {
        let outcomes = join_all(files.into_iter().map(|file| self.submit(file))).await;

        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        tracing::info!(accepted, total = outcomes.len(), "Batch submission complete");

        outcomes
    }

    /// Remove an image from local tracking.
    pub fn remove(&self, storage_name: &str) -> Result<UploadProgress> {
        let (removed, progress, change) = self.session.remove_image(storage_name)?;

        tracing::info!(
            session_id = %self.session.id(),
            storage_name = %removed.storage_name,
            current = progress.current,
            required = progress.required,
            "Removed image"
        );

        if let Some(change) = change {
            self.report_readiness(change, progress);
        }
        Ok(progress)
    }

    async fn upload(&self, file: FileCandidate) -> UploadOutcome {
        let attempt_id = Uuid::new_v4();
        let session_id = self.session.id().clone();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        tracing::debug!(session_id = %session_id, attempt_id = %attempt_id, file = %file.name, "Starting upload");

        let receipt = match self.api.upload(&session_id, &file).await {
            Ok(receipt) => receipt,
            Err(error) => {
                tracing::warn!(session_id = %session_id, attempt_id = %attempt_id, file = %file.name, error = %error, "Upload failed");
                self.notifier.notify(Notice::error(error.user_message()));
                return UploadOutcome::Failed {
                    file_name: file.name,
                    error,
                };
            }
        };

        let image = receipt.image.clone();
        let (progress, change) = match self.session.add_image(receipt.image) {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(session_id = %session_id, attempt_id = %attempt_id, error = %error, "Discarding late upload");
                self.notifier.notify(Notice::error(error.user_message()));
                return UploadOutcome::Failed {
                    file_name: file.name,
                    error,
                };
            }
        };

        if let Some(server_count) = receipt.server_count {
            if server_count != progress.current {
                tracing::debug!(
                    session_id = %session_id,
                    server_count,
                    local_count = progress.current,
                    "Server image count differs from tracked count"
                );
            }
        }
        if let Some(total_needed) = receipt.total_needed {
            if total_needed != progress.required {
                tracing::warn!(
                    session_id = %session_id,
                    total_needed,
                    required = progress.required,
                    "Server reports a different required image count"
                );
            }
        }

        tracing::info!(
            session_id = %session_id,
            attempt_id = %attempt_id,
            storage_name = %image.storage_name,
            current = progress.current,
            required = progress.required,
            "Upload accepted"
        );

        if let Some(change) = change {
            self.report_readiness(change, progress);
        }

        UploadOutcome::Accepted { image, progress }
    }

    fn report_readiness(&self, change: ReadinessChange, progress: UploadProgress) {
        match change {
            ReadinessChange::BecameReady => {
                tracing::info!(session_id = %self.session.id(), "All required images uploaded, processing available");
                self.notifier.notify(Notice::success(format!(
                    "{}/{} images uploaded",
                    progress.current, progress.required
                )));
            }
            ReadinessChange::BecameUnready => {
                tracing::info!(session_id = %self.session.id(), "Below required image count, processing unavailable");
            }
        }
    }
}
