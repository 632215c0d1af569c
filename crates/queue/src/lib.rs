//! Encode Queue
//!
//! Desktop transcoding queue: runs several encodes at once under hardware
//! limits, pauses itself when the machine runs low on battery or disk, and
//! estimates how long the rest of the queue will take.

pub mod arbiter;
pub mod auto_pause;
pub mod control_server;
pub mod encode;
pub mod end_of_queue;
pub mod engine;
pub mod environment;
pub mod job;
pub mod job_log;
pub mod messages;
pub mod persist;
pub mod slots;
pub mod startup;
pub mod status;
pub mod work_tracker;

pub use encode_queue_config as config;
pub use encode_queue_config::Config;
pub use arbiter::{required_pools, AcceleratorFamily, HardwareArbiter, PoolKey, PoolUsage};
pub use auto_pause::{AutoPauseController, AutoPauseReason, AutoPauseSignal, AutoPauseState};
pub use control_server::{create_router, run_server, AddJobRequest, ApiError, ServerError, ServerState};
pub use encode::{
    EncodeError, EncodeProgress, EncodeRequest, EncoderEvent, EncoderProxy, EncoderProxyFactory,
    ProcessEncoderFactory, ProcessEncoderProxy,
};
pub use end_of_queue::{run_end_of_queue, run_post_encode, ShellSystemActions, SystemActions};
pub use engine::{EngineDeps, ProcessingEngine, QueueError, QueueHandle, QueueState, StopReason};
pub use environment::{EnvironmentProbe, PowerStatus, SystemProbe};
pub use job::{EncodeJob, EncodeProfile, EncodeResult, JobId, JobState, RangeSelection, ResultStatus, SourceType};
pub use job_log::JobLogger;
pub use persist::{PersistError, QueueStore};
pub use slots::SlotPlan;
pub use startup::{run_startup_checks, StartupError};
pub use status::{QueueStatus, StatusReceiver};
pub use work_tracker::{OverallProgress, WorkTracker};
