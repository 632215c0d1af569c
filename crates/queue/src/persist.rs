//! Persisted queue state.
//!
//! The pending queue is stored as one JSON document (`queue.json` in the state
//! directory) and rewritten after every change. Writes go to a temporary file
//! that is then renamed over the old one, so a crash never leaves a truncated
//! queue behind. A file that cannot be read back is moved aside to
//! `queue.json.bad` instead of being overwritten.

use crate::job::{EncodeJob, JobId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the persisted queue inside the state directory.
pub const QUEUE_FILE_NAME: &str = "queue.json";

const QUEUE_FORMAT_VERSION: u32 = 1;

/// Error type for queue persistence
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Invalid queue file {path}: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unsupported queue file version {0}")]
    UnsupportedVersion(u32),

    #[error("Job {id} has an invalid duration ({duration_secs})")]
    InvalidJob { id: JobId, duration_secs: f64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    jobs: Vec<EncodeJob>,
}

/// Reads and writes the persisted queue.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    /// Store for `queue.json` under `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(QUEUE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the queue; a missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<EncodeJob>, PersistError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let queue: PersistedQueue =
            serde_json::from_str(&content).map_err(|source| PersistError::Format {
                path: self.path.clone(),
                source,
            })?;
        if queue.version > QUEUE_FORMAT_VERSION {
            return Err(PersistError::UnsupportedVersion(queue.version));
        }
        Ok(queue.jobs)
    }

    /// Replace the persisted queue with `jobs`, in order.
    pub fn save(&self, jobs: &[EncodeJob]) -> Result<(), PersistError> {
        // JSON has no NaN or infinity; such a job would make the file unreadable
        if let Some(job) = jobs.iter().find(|j| !j.has_valid_duration()) {
            return Err(PersistError::InvalidJob {
                id: job.id,
                duration_secs: job.duration_secs,
            });
        }

        let io_err = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let queue = PersistedQueue {
            version: QUEUE_FORMAT_VERSION,
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&queue).map_err(|source| PersistError::Format {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "Saved queue");
        Ok(())
    }

    /// Add one job to the end of the persisted queue.
    pub fn append(&self, job: EncodeJob) -> Result<usize, PersistError> {
        let mut jobs = self.load()?;
        jobs.push(job);
        self.save(&jobs)?;
        Ok(jobs.len())
    }

    /// Move an unreadable queue file to `queue.json.bad` so the next save does
    /// not destroy it. Returns the new location.
    pub fn quarantine(&self) -> Result<PathBuf, PersistError> {
        let bad = self.path.with_extension("json.bad");
        fs::rename(&self.path, &bad).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })?;
        warn!(path = %bad.display(), "Moved unreadable queue file aside");
        Ok(bad)
    }
}
