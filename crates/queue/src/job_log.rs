//! Dedicated per-job logger.
//!
//! Each started job gets its own log file; every line is also emitted as a
//! `tracing` event tagged with the job id.

use crate::job::{EncodeJob, JobId};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct LoggerInner {
    job_id: JobId,
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

/// Cloneable handle to a job's log.
#[derive(Debug, Clone)]
pub struct JobLogger {
    inner: Arc<LoggerInner>,
}

/// File name for a job log: `<timestamp> <source name> <short id>.txt`.
///
/// Sources with the same stem in different folders, or retries of the same
/// source as a new job, get separate files.
pub fn log_file_name(job: &EncodeJob) -> String {
    format!(
        "{} {} {}.txt",
        chrono::Local::now().format("%Y-%m-%d %H.%M.%S"),
        job.display_name(),
        job.id.short()
    )
}

impl JobLogger {
    /// Open a log file for the job under `log_dir`.
    ///
    /// If the file cannot be created the logger still works, emitting tracing
    /// events only.
    pub fn create(log_dir: &Path, job: &EncodeJob) -> Self {
        let path = log_dir.join(log_file_name(job));
        let file = fs::create_dir_all(log_dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

        match file {
            Ok(file) => Self {
                inner: Arc::new(LoggerInner {
                    job_id: job.id,
                    path: Some(path),
                    file: Mutex::new(Some(file)),
                }),
            },
            Err(e) => {
                warn!(job_id = %job.id, path = %path.display(), "Could not create job log: {}", e);
                Self::detached(job.id)
            }
        }
    }

    /// Logger without a file.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                job_id,
                path: None,
                file: Mutex::new(None),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn log(&self, message: &str) {
        info!(job_id = %self.inner.job_id, "{}", message);
        self.write_line("INFO", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.inner.job_id, "{}", message);
        self.write_line("ERROR", message);
    }

    /// Raw encoder output; kept in the file, traced at debug level.
    pub fn encoder_output(&self, line: &str) {
        debug!(job_id = %self.inner.job_id, "{}", line);
        self.write_line("ENC", line);
    }

    fn write_line(&self, level: &str, message: &str) {
        let mut guard = self.inner.file.lock();
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "[{}] {} {}\n",
                chrono::Local::now().format("%H:%M:%S"),
                level,
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(job_id = %self.inner.job_id, "Job log write failed, closing log: {}", e);
                *guard = None;
            }
        }
    }
}
