//! # fusionctl: client-side orchestration for image fusion sessions
//!
//! `fusionctl` drives a multi-image fusion session on a remote fusion server. The server owns the
//! actual wavelet fusion; this crate owns everything that happens before and around it on the
//! client: which files may be sent, how many have been accepted, when processing may start, and
//! when a running session has finished.
//!
//! ## Overview
//!
//! A session is created elsewhere and handed to the client as an opaque identifier together with
//! the number of images it needs. The client then moves through a fixed sequence: no images,
//! uploading, ready to process, processing, and finally done or failed. Every part of the crate
//! exists to keep that sequence honest under concurrency. Uploads complete in any order, the user
//! may remove images at any time before processing, and a double trigger must never start the
//! fusion twice.
//!
//! ### Components
//!
//! The **upload tracker** ([`tracker`]) validates candidate files locally (type and size) and
//! uploads the valid ones concurrently. Each accepted upload is recorded on the shared
//! [`Session`](session::Session), and readiness is recomputed from the recorded image count, so the
//! "ready" signal fires exactly once each time the required count is crossed.
//!
//! The **processing controller** ([`controller`]) is a small state machine
//! (`idle → starting → waiting_for_result → done | error`) guarded by a flag that is checked and set
//! before any remote call is issued. Failures release the guard so the user can retry.
//!
//! The **status poller** ([`poller`]) queries a session on a fixed interval until it leaves
//! `processing`, and hands back a [`PollHandle`](poller::PollHandle) that stops the loop when dropped.
//!
//! All three talk to the server through the [`FusionApi`](client::FusionApi) trait. Production code
//! uses the reqwest-backed [`ReqwestFusionClient`](client::ReqwestFusionClient); tests use
//! [`MockFusionApi`](client::MockFusionApi). User-facing messages go to a
//! [`Notifier`](notify::Notifier).
//!
//! [`FusionWorkflow`] bundles the pieces into the surface a UI or the `fusionctl` binary drives.
//!
//! ## Configuration
//!
//! See [`config`] for the YAML file and `FUSIONCTL_` environment overrides.

pub mod client;
pub mod config;
pub mod controller;
pub mod errors;
pub mod notify;
pub mod poller;
pub mod session;
pub mod telemetry;
pub mod tracker;
pub mod types;
pub mod workflow;

pub use config::Config;
pub use errors::{Error, Result};
pub use types::{FileCandidate, SessionId, SessionStatus, UploadedImage};
pub use workflow::FusionWorkflow;
