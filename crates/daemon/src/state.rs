//! Shared runtime state: service status, live configuration and signals.
//!
//! The worker, the scheduling loop and the broadcast receiver all run on
//! different tasks, so every piece of shared state sits behind a lock.

use crate::config::Config;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

/// Why the service stopped leasing jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused through the control handle
    Manual,
    /// The duplicate scan failed; encoding now could duplicate a library file
    DuplicateScan,
    /// An encode failed and `pause_on_encode_error` is set
    EncodeError,
    /// A leased job could not be deleted from the store
    JobDelete,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Manual => write!(f, "paused by user"),
            PauseReason::DuplicateScan => write!(f, "duplicate scan failed"),
            PauseReason::EncodeError => write!(f, "encode error"),
            PauseReason::JobDelete => write!(f, "could not delete leased job"),
        }
    }
}

/// Per-job state, cleared when the job ends.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct JobStatus {
    pub in_file: Option<PathBuf>,
    pub out_path: Option<PathBuf>,
    pub invocation: Option<String>,
    pub replacement_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ServiceStatus {
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
    /// Outside the availability window
    pub sleeping: bool,
    pub shutting_down: bool,
    pub job: JobStatus,
    /// Encoder output tail of the most recent encode, kept across jobs
    pub last_output_tail: Vec<String>,
    pub completed_jobs: u64,
    pub skipped_jobs: u64,
    pub failed_jobs: u64,
}

impl ServiceStatus {
    pub fn pause(&mut self, reason: PauseReason) {
        self.paused = true;
        self.pause_reason = Some(reason);
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.pause_reason = None;
    }

    pub fn clear_job(&mut self) {
        self.job = JobStatus::default();
    }
}

/// Status shared between the worker and the control plane
pub type SharedStatus = Arc<RwLock<ServiceStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(ServiceStatus::default()))
}

/// Configuration swapped in wholesale on every reload
pub type SharedConfig = Arc<RwLock<Arc<Config>>>;

pub fn new_shared_config(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(Arc::new(config)))
}

/// Current configuration snapshot.
pub fn current_config(shared: &SharedConfig) -> Arc<Config> {
    shared.read().clone()
}

/// Single-slot signal. Raising it while a signal is already pending is a no-op.
#[derive(Debug, Default)]
pub struct Signal {
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking; safe to call from blocking threads.
    pub fn raise(&self) {
        self.notify.notify_one();
    }

    /// Wait for the pending or next signal and consume it.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
