//! Queue status snapshot
//!
//! The engine publishes a fresh [`QueueStatus`] after every message it handles;
//! readers (the status server, the CLI) hold a `watch` receiver.

use crate::arbiter::PoolUsage;
use crate::auto_pause::{AutoPauseReason, AutoPauseState};
use crate::engine::QueueState;
use crate::job::{EncodeResult, JobId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Per-job progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub id: JobId,
    pub source_path: String,
    pub output_path: String,
    pub state: String,
    pub pass_id: Option<i32>,
    /// Fraction of the whole job's work, 0-1
    pub progress: f64,
    pub current_fps: f64,
    pub average_fps: f64,
    pub eta_secs: Option<u64>,
    /// Failed attempts so far
    pub retries: u32,
}

/// Complete queue snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    pub timestamp_unix_ms: i64,
    pub state: QueueState,
    pub jobs: Vec<JobStatus>,
    pub completed: Vec<EncodeResult>,
    pub overall_progress: f64,
    pub eta_secs: u64,
    pub elapsed_secs: u64,
    pub auto_pause_state: AutoPauseState,
    pub auto_pause_reason: Option<AutoPauseReason>,
    pub pools: Vec<PoolUsage>,
    /// The end-of-queue action asked the program to close.
    pub exit_requested: bool,
}

impl Default for QueueStatus {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            state: QueueState::Idle,
            jobs: Vec::new(),
            completed: Vec::new(),
            overall_progress: 0.0,
            eta_secs: 0,
            elapsed_secs: 0,
            auto_pause_state: AutoPauseState::NoEncode,
            auto_pause_reason: None,
            pools: Vec::new(),
            exit_requested: false,
        }
    }
}

pub type StatusSender = watch::Sender<QueueStatus>;
pub type StatusReceiver = watch::Receiver<QueueStatus>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    watch::channel(QueueStatus::default())
}
