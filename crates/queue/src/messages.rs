//! Messages consumed by the processing engine's control loop.

use crate::auto_pause::AutoPauseSignal;
use crate::encode::EncoderEvent;
use crate::end_of_queue::EndOfQueueOutcome;
use crate::engine::{QueueError, StopReason};
use crate::job::{EncodeJob, JobId};
use encode_queue_config::Config;
use tokio::sync::{mpsc, oneshot};

/// Reply channel for commands that can be rejected.
pub type Reply = oneshot::Sender<Result<(), QueueError>>;

/// User-side requests.
#[derive(Debug)]
pub enum QueueCommand {
    Queue { job: Box<EncodeJob>, reply: Reply },
    Remove { id: JobId, reply: Reply },
    Move { id: JobId, index: usize, reply: Reply },
    Start { reply: Reply },
    Pause,
    Resume,
    /// `AppExit` replies only after every encoder has exited.
    Stop { reason: StopReason, reply: Option<Reply> },
    ClearCompleted,
    UpdateConfig(Box<Config>),
}

/// Everything the control loop reacts to.
#[derive(Debug)]
pub enum EngineMessage {
    Command(QueueCommand),
    Encoder { job_id: JobId, event: EncoderEvent },
    AutoPause(AutoPauseSignal),
    /// The end-of-queue sequence finished on its blocking thread.
    EndOfQueueFinished(EndOfQueueOutcome),
}

pub type EngineSender = mpsc::UnboundedSender<EngineMessage>;
pub type EngineReceiver = mpsc::UnboundedReceiver<EngineMessage>;

/// Create the engine's message channel.
pub fn channel() -> (EngineSender, EngineReceiver) {
    mpsc::unbounded_channel()
}
