//! Narrow interface to the external encoder.
//!
//! The queue never encodes anything itself. It asks a proxy to start, pause,
//! resume or stop one job, and the proxy reports back through an [`EventSink`]
//! that forwards events into the engine's message channel.

use crate::job::{EncodeJob, JobId};
use crate::job_log::JobLogger;
use crate::messages::{EngineMessage, EngineSender};
use std::time::Duration;
use thiserror::Error;

/// Error type for encoder control operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder executable could not be launched
    #[error("Failed to launch encoder: {0}")]
    Spawn(std::io::Error),

    /// Control request for an encoder that is not running
    #[error("Encoder is not running")]
    NotRunning,

    /// Control request the platform cannot honour
    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    /// Sending a job-control signal failed
    #[error("Failed to signal encoder: {0}")]
    Signal(String),

    /// IO error while talking to the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One progress report from the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeProgress {
    /// -1 subtitle scan, 0 single pass, 1 first pass, 2 second pass
    pub pass_id: i32,
    /// Fraction of the current pass, 0-1
    pub fraction_complete: f64,
    pub current_fps: f64,
    pub average_fps: f64,
    /// Encoder's own estimate for the rest of the job
    pub estimated_time_left: Option<Duration>,
}

/// Events a proxy reports for its job.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// The encode actually began; pause and stop are allowed from now on.
    Started,
    Progress(EncodeProgress),
    /// The encoder exited. `error` is set when it reported a failure or crashed.
    Completed { error: bool },
}

/// Encode only a short slice of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewRequest {
    /// Start position as a percentage of the title.
    pub start_percent: u8,
    pub seconds: u32,
}

/// Everything a proxy needs to start a job.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub job: EncodeJob,
    /// Device index for hardware encoders, when more than one device is used.
    pub accelerator_index: Option<u32>,
    pub preview: Option<PreviewRequest>,
}

/// Forwards a job's encoder events into the engine channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    job_id: JobId,
    tx: EngineSender,
}

impl EventSink {
    pub fn new(job_id: JobId, tx: EngineSender) -> Self {
        Self { job_id, tx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Returns false once the engine has shut down.
    pub fn send(&self, event: EncoderEvent) -> bool {
        self.tx
            .send(EngineMessage::Encoder {
                job_id: self.job_id,
                event,
            })
            .is_ok()
    }
}

/// Control surface of one running encode.
pub trait EncoderProxy: Send {
    fn start_encode(
        &mut self,
        request: EncodeRequest,
        logger: JobLogger,
        events: EventSink,
    ) -> Result<(), EncodeError>;

    fn pause_encode(&mut self) -> Result<(), EncodeError>;

    fn resume_encode(&mut self) -> Result<(), EncodeError>;

    /// Ask the encoder to stop; completion is reported through the sink.
    fn stop_encode(&mut self) -> Result<(), EncodeError>;

    /// Stop the encoder and block until it has exited.
    fn stop_and_wait(&mut self) -> Result<(), EncodeError>;
}

/// Creates one proxy per started job.
pub trait EncoderProxyFactory: Send + Sync {
    fn create_proxy(&self) -> Box<dyn EncoderProxy>;
}
