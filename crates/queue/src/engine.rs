//! Processing engine.
//!
//! The engine owns the ordered job list and is the only writer of queue state.
//! User commands, encoder events and auto-pause signals all arrive as
//! [`EngineMessage`]s on one channel and are handled one at a time by
//! [`ProcessingEngine::run`]. Jobs are started in queue order as the
//! [`HardwareArbiter`] grants leases; finished jobs move to the completed list.

use crate::arbiter::{AcceleratorFamily, HardwareArbiter};
use crate::auto_pause::{AutoPauseController, AutoPauseSignal};
use crate::encode::{EncodeRequest, EncoderEvent, EncoderProxy, EncoderProxyFactory, EventSink};
use crate::end_of_queue::{run_end_of_queue, run_post_encode, EndOfQueueOutcome, SystemActions};
use crate::environment::EnvironmentProbe;
use crate::job::{
    classify_output, EncodeJob, EncodeResult, JobId, JobState, JobWork, ResultStatus, SourceType,
};
use crate::job_log::JobLogger;
use crate::messages::{self, EngineMessage, EngineReceiver, EngineSender, QueueCommand, Reply};
use crate::persist::{PersistError, QueueStore};
use crate::slots::SlotPlan;
use crate::status::{status_channel, JobStatus, QueueStatus, StatusReceiver, StatusSender};
use crate::work_tracker::{QueueEntrySnapshot, WorkTracker};
use encode_queue_config::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Why the queue is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Normal drain; completions are recorded.
    Succeeded,
    /// The user stopped the queue.
    Manual,
    /// The program is exiting; encoders are stopped synchronously.
    AppExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    #[default]
    Idle,
    Encoding,
    Paused,
    /// A stop was requested and some encoders have not exited yet.
    Stopping,
}

/// Error type for queue commands
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Job {0} is already in the queue")]
    DuplicateJob(JobId),

    #[error("Job {id} has an invalid duration ({duration_secs})")]
    InvalidDuration { id: JobId, duration_secs: f64 },

    #[error("Job {0} is encoding and cannot be removed")]
    JobIsLive(JobId),

    #[error("Queue is not idle (state: {0:?})")]
    NotIdle(QueueState),

    #[error("Queue has no jobs to encode")]
    EmptyQueue,

    #[error("Failed to save queue: {0}")]
    Persist(#[from] PersistError),

    #[error("Processing engine has shut down")]
    EngineGone,
}

/// Control request deferred until the encoder confirms it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingControl {
    Pause { auto: bool },
    Stop,
}

/// A job in the queue plus its runtime state.
struct QueueEntry {
    job: EncodeJob,
    state: JobState,
    /// Failed attempts that were retried.
    retries: u32,
    pass_id: Option<i32>,
    completed_work: f64,
    current_fps: f64,
    average_fps: f64,
    eta: Option<Duration>,
    started_at: Option<Instant>,
    proxy: Option<Box<dyn EncoderProxy>>,
    logger: Option<JobLogger>,
    pending: Option<PendingControl>,
}

impl QueueEntry {
    fn new(job: EncodeJob) -> Self {
        Self {
            job,
            state: JobState::Queued,
            retries: 0,
            pass_id: None,
            completed_work: 0.0,
            current_fps: 0.0,
            average_fps: 0.0,
            eta: None,
            started_at: None,
            proxy: None,
            logger: None,
            pending: None,
        }
    }

    /// Every state change goes through here; terminal states reach the job log.
    fn set_state(&mut self, next: JobState) {
        if self.state == next {
            return;
        }
        debug!(job_id = %self.job.id, from = %self.state, to = %next, "Job state changed");
        self.state = next;
        if next.is_terminal() {
            self.log(&format!("Job {}", next));
        }
    }

    /// Back to a plain queued job, dropping the encoder.
    fn reset(&mut self) {
        self.set_state(JobState::Queued);
        self.pass_id = None;
        self.completed_work = 0.0;
        self.current_fps = 0.0;
        self.average_fps = 0.0;
        self.eta = None;
        self.started_at = None;
        self.proxy = None;
        self.pending = None;
    }

    fn log(&self, message: &str) {
        match &self.logger {
            Some(logger) => logger.log(message),
            None => info!(job_id = %self.job.id, "{}", message),
        }
    }

    fn log_error(&self, message: &str) {
        match &self.logger {
            Some(logger) => logger.log_error(message),
            None => warn!(job_id = %self.job.id, "{}", message),
        }
    }

    fn status(&self) -> JobStatus {
        let work = self.job.work();
        JobStatus {
            id: self.job.id,
            source_path: self.job.source_path.to_string_lossy().to_string(),
            output_path: self.job.output_path.to_string_lossy().to_string(),
            state: self.state.to_string(),
            pass_id: self.pass_id,
            progress: if work > 0.0 {
                (self.completed_work / work).clamp(0.0, 1.0)
            } else {
                0.0
            },
            current_fps: self.current_fps,
            average_fps: self.average_fps,
            eta_secs: self.eta.map(|d| d.as_secs()),
            retries: self.retries,
        }
    }
}

/// External collaborators of the engine.
pub struct EngineDeps {
    pub encoder: Arc<dyn EncoderProxyFactory>,
    pub probe: Arc<dyn EnvironmentProbe>,
    pub actions: Arc<dyn SystemActions>,
}

/// Owns the queue and drives every job through its lifecycle.
pub struct ProcessingEngine {
    config: Config,
    plan: SlotPlan,
    jobs: Vec<QueueEntry>,
    completed: Vec<EncodeResult>,
    state: QueueState,
    stop_reason: StopReason,
    /// A manual stop with a single job empties the queue.
    clear_on_stop: bool,
    /// The current pause came from the auto-pause controller.
    auto_paused: bool,
    arbiter: HardwareArbiter,
    tracker: WorkTracker,
    auto_pause: AutoPauseController,
    encoder: Arc<dyn EncoderProxyFactory>,
    actions: Arc<dyn SystemActions>,
    store: QueueStore,
    log_dir: PathBuf,
    tx: EngineSender,
    status_tx: StatusSender,
    next_accelerator: u32,
    run_succeeded: usize,
    run_failed: usize,
    /// Environment failures already logged this run.
    environment_failures: HashSet<&'static str>,
    exit_requested: bool,
}

impl ProcessingEngine {
    /// Build the engine, restoring the persisted queue.
    ///
    /// Returns the receiver that [`run`](Self::run) consumes. When
    /// `resume_encoding_on_restart` is set and the restored queue is not
    /// empty, encoding starts right away.
    pub fn new(config: Config, deps: EngineDeps) -> (Self, EngineReceiver) {
        let (tx, rx) = messages::channel();
        let (status_tx, _) = status_channel();
        let plan = SlotPlan::derive(&config.encoding);
        let state_dir = config.paths.resolved_state_dir();
        let store = QueueStore::new(&state_dir);

        let restored = match store.load() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Could not restore queue, starting empty: {}", e);
                // Keep the unreadable file for the user instead of saving over it
                if let Err(e) = store.quarantine() {
                    warn!("Could not move queue file aside: {}", e);
                }
                Vec::new()
            }
        };
        let restored: Vec<EncodeJob> = restored
            .into_iter()
            .filter(|job| {
                let valid = job.has_valid_duration();
                if !valid {
                    warn!(job_id = %job.id, duration_secs = job.duration_secs, "Dropping restored job with invalid duration");
                }
                valid
            })
            .collect();
        if !restored.is_empty() {
            info!(jobs = restored.len(), "Restored queue");
        }

        let mut engine = Self {
            auto_pause: AutoPauseController::new(config.auto_pause.clone(), deps.probe, tx.clone()),
            arbiter: HardwareArbiter::new(plan.slots()),
            tracker: WorkTracker::new(),
            plan,
            jobs: restored.into_iter().map(QueueEntry::new).collect(),
            completed: Vec::new(),
            state: QueueState::Idle,
            stop_reason: StopReason::Succeeded,
            clear_on_stop: false,
            auto_paused: false,
            encoder: deps.encoder,
            actions: deps.actions,
            store,
            log_dir: state_dir.join("logs"),
            tx,
            status_tx,
            next_accelerator: 0,
            run_succeeded: 0,
            run_failed: 0,
            environment_failures: HashSet::new(),
            exit_requested: false,
            config,
        };

        if engine.config.encoding.resume_encoding_on_restart && !engine.jobs.is_empty() {
            info!("Resuming encoding of restored queue");
            if let Err(e) = engine.start() {
                warn!("Could not resume encoding: {}", e);
            }
        }
        engine.publish_status();

        (engine, rx)
    }

    /// Control-side handle for this engine.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            tx: self.tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn completed(&self) -> &[EncodeResult] {
        &self.completed
    }

    /// Jobs in queue order.
    pub fn jobs(&self) -> impl Iterator<Item = (&EncodeJob, JobState)> {
        self.jobs.iter().map(|e| (&e.job, e.state))
    }

    pub fn arbiter(&self) -> &HardwareArbiter {
        &self.arbiter
    }

    /// Control loop; returns after an `AppExit` stop.
    pub async fn run(mut self, mut rx: EngineReceiver) {
        info!("Processing engine started");
        while let Some(message) = rx.recv().await {
            let exit = self.handle_message(message);
            self.publish_status();
            if exit {
                break;
            }
        }
        info!("Processing engine stopped");
    }

    /// Handle one message. Returns true when the engine should exit.
    pub fn handle_message(&mut self, message: EngineMessage) -> bool {
        match message {
            EngineMessage::Command(command) => return self.handle_command(command),
            EngineMessage::Encoder { job_id, event } => self.on_encoder_event(job_id, event),
            EngineMessage::AutoPause(signal) => self.on_auto_pause(signal),
            EngineMessage::EndOfQueueFinished(outcome) => self.on_end_of_queue_finished(outcome),
        }
        false
    }

    fn handle_command(&mut self, command: QueueCommand) -> bool {
        match command {
            QueueCommand::Queue { job, reply } => {
                let _ = reply.send(self.queue_job(*job));
            }
            QueueCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove_job(id));
            }
            QueueCommand::Move { id, index, reply } => {
                let _ = reply.send(self.move_job(id, index));
            }
            QueueCommand::Start { reply } => {
                let _ = reply.send(self.start());
            }
            QueueCommand::Pause => self.pause(),
            QueueCommand::Resume => self.resume(),
            QueueCommand::Stop { reason, reply } => {
                self.stop(reason);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return reason == StopReason::AppExit;
            }
            QueueCommand::ClearCompleted => self.clear_completed(),
            QueueCommand::UpdateConfig(config) => self.update_config(*config),
        }
        false
    }

    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|e| e.job.id == id)
    }

    fn is_running(&self) -> bool {
        matches!(self.state, QueueState::Encoding | QueueState::Paused)
    }

    /// Add a job to the end of the queue.
    pub fn queue_job(&mut self, job: EncodeJob) -> Result<(), QueueError> {
        if self.position(job.id).is_some() {
            return Err(QueueError::DuplicateJob(job.id));
        }
        if !job.has_valid_duration() {
            return Err(QueueError::InvalidDuration {
                id: job.id,
                duration_secs: job.duration_secs,
            });
        }
        info!(job_id = %job.id, source = %job.source_path.display(), "Queued job");
        if self.is_running() {
            self.tracker.report_added_to_queue(job.job_work());
        }
        self.jobs.push(QueueEntry::new(job));
        self.top_up();
        self.persist()
    }

    /// Remove a job that is not encoding.
    pub fn remove_job(&mut self, id: JobId) -> Result<(), QueueError> {
        let index = self.position(id).ok_or(QueueError::UnknownJob(id))?;
        if self.jobs[index].state.is_live() {
            return Err(QueueError::JobIsLive(id));
        }
        let mut entry = self.jobs.remove(index);
        entry.set_state(JobState::Canceled);
        info!(job_id = %id, "Removed job");
        if self.is_running() {
            self.tracker.report_removed_from_queue(entry.job.job_work());
        }
        self.check_drained();
        self.persist()
    }

    /// Move a job to `new_index` (clamped to the end of the queue).
    pub fn move_job(&mut self, id: JobId, new_index: usize) -> Result<(), QueueError> {
        let index = self.position(id).ok_or(QueueError::UnknownJob(id))?;
        let entry = self.jobs.remove(index);
        let new_index = new_index.min(self.jobs.len());
        self.jobs.insert(new_index, entry);
        debug!(job_id = %id, from = index, to = new_index, "Moved job");
        self.persist()
    }

    /// Start encoding the queue.
    pub fn start(&mut self) -> Result<(), QueueError> {
        if self.state != QueueState::Idle {
            return Err(QueueError::NotIdle(self.state));
        }
        if !self.jobs.iter().any(|e| e.state == JobState::Queued) {
            return Err(QueueError::EmptyQueue);
        }

        let initial_work: Vec<JobWork> = self.jobs.iter().map(|e| e.job.job_work()).collect();
        info!(jobs = self.jobs.len(), slots = self.plan.slots(), "Starting encode queue");

        self.state = QueueState::Encoding;
        self.stop_reason = StopReason::Succeeded;
        self.clear_on_stop = false;
        self.auto_paused = false;
        self.run_succeeded = 0;
        self.run_failed = 0;
        self.environment_failures.clear();
        self.exit_requested = false;
        self.tracker.report_encode_start(&initial_work, self.plan.slots());
        self.auto_pause.report_start();
        self.top_up();
        Ok(())
    }

    /// Start queued jobs while capacity allows, in queue order.
    fn top_up(&mut self) {
        while self.state == QueueState::Encoding {
            let live = self.jobs.iter().filter(|e| e.state.is_live()).count();
            if live >= self.plan.slots() {
                break;
            }
            // Only the first waiting job is considered; later jobs never jump it
            let Some(index) = self.jobs.iter().position(|e| e.state == JobState::Queued) else {
                break;
            };
            if !self.arbiter.try_acquire_slot(&self.jobs[index].job) {
                break;
            }
            self.start_job(index);
        }
        self.update_watched_outputs();
        self.check_drained();
    }

    fn next_accelerator_index(&mut self, job: &EncodeJob) -> Option<u32> {
        if !self.plan.round_robin_accelerators()
            || AcceleratorFamily::detect(&job.profile.video_encoder).is_none()
        {
            return None;
        }
        let index = self.next_accelerator % self.plan.accelerator_devices;
        self.next_accelerator = self.next_accelerator.wrapping_add(1);
        Some(index)
    }

    fn start_job(&mut self, index: usize) {
        let job = self.jobs[index].job.clone();
        let accelerator_index = self.next_accelerator_index(&job);
        let logger = JobLogger::create(&self.log_dir, &job);
        logger.log(&format!(
            "Starting {} -> {} (attempt {})",
            job.source_path.display(),
            job.output_path.display(),
            self.jobs[index].retries + 1
        ));

        let mut proxy = self.encoder.create_proxy();
        let request = EncodeRequest {
            job: job.clone(),
            accelerator_index,
            preview: None,
        };
        let started = proxy.start_encode(request, logger.clone(), EventSink::new(job.id, self.tx.clone()));

        let entry = &mut self.jobs[index];
        entry.logger = Some(logger);
        entry.started_at = Some(Instant::now());
        match started {
            Ok(()) => {
                entry.set_state(JobState::Starting);
                entry.proxy = Some(proxy);
            }
            Err(e) => {
                entry.log_error(&format!("Encoder failed to start: {}", e));
                self.arbiter.release_slot(&job);
                self.finish_job(index, true);
            }
        }
    }

    fn on_encoder_event(&mut self, job_id: JobId, event: EncoderEvent) {
        let Some(index) = self.position(job_id) else {
            debug!(job_id = %job_id, ?event, "Event for a job no longer in the queue");
            return;
        };
        if !self.jobs[index].state.is_live() {
            debug!(job_id = %job_id, ?event, "Event for a job that is not running");
            return;
        }

        match event {
            EncoderEvent::Started => self.on_started(index),
            EncoderEvent::Progress(progress) => {
                let entry = &mut self.jobs[index];
                entry.pass_id = Some(progress.pass_id);
                entry.completed_work = entry
                    .job
                    .completed_work(progress.pass_id, progress.fraction_complete);
                entry.current_fps = progress.current_fps;
                entry.average_fps = progress.average_fps;
                entry.eta = progress.estimated_time_left;
                self.update_overall_progress();
            }
            EncoderEvent::Completed { error } => self.on_completed(index, error),
        }
    }

    fn on_started(&mut self, index: usize) {
        let entry = &mut self.jobs[index];
        if entry.state != JobState::Starting {
            return;
        }
        entry.set_state(JobState::Encoding);
        entry.log("Encode started");

        match entry.pending.take() {
            Some(PendingControl::Pause { auto }) => Self::pause_entry(entry, auto),
            Some(PendingControl::Stop) => Self::stop_entry(entry),
            None => {}
        }
    }

    fn pause_entry(entry: &mut QueueEntry, auto: bool) {
        match entry.state {
            JobState::Starting => entry.pending = Some(PendingControl::Pause { auto }),
            JobState::Encoding => {
                if let Some(proxy) = entry.proxy.as_mut() {
                    if let Err(e) = proxy.pause_encode() {
                        entry.log_error(&format!("Could not pause encoder: {}", e));
                    }
                }
                entry.set_state(JobState::Paused { auto });
            }
            JobState::Paused { .. } => entry.set_state(JobState::Paused { auto }),
            _ => {}
        }
    }

    fn resume_entry(entry: &mut QueueEntry) {
        match entry.state {
            JobState::Starting => entry.pending = None,
            JobState::Paused { .. } => {
                if let Some(proxy) = entry.proxy.as_mut() {
                    if let Err(e) = proxy.resume_encode() {
                        entry.log_error(&format!("Could not resume encoder: {}", e));
                    }
                }
                entry.set_state(JobState::Encoding);
            }
            _ => {}
        }
    }

    fn stop_entry(entry: &mut QueueEntry) {
        match entry.state {
            JobState::Starting => entry.pending = Some(PendingControl::Stop),
            JobState::Encoding | JobState::Paused { .. } => {
                entry.log("Stopping encode");
                if let Some(proxy) = entry.proxy.as_mut() {
                    if let Err(e) = proxy.stop_encode() {
                        entry.log_error(&format!("Could not stop encoder: {}", e));
                    }
                }
                entry.set_state(JobState::Stopping);
            }
            _ => {}
        }
    }

    fn on_completed(&mut self, index: usize, error: bool) {
        let job = self.jobs[index].job.clone();
        self.arbiter.release_slot(&job);
        self.jobs[index].proxy = None;

        if self.stop_reason != StopReason::Succeeded {
            self.jobs[index].log("Encode stopped");
            if self.clear_on_stop {
                self.jobs.remove(index).set_state(JobState::Canceled);
            } else {
                self.jobs[index].reset();
            }
            if !self.jobs.iter().any(|e| e.state.is_live()) {
                info!("Queue stopped");
                self.state = QueueState::Idle;
            }
            self.update_watched_outputs();
            self.persist_logged();
            return;
        }

        self.finish_job(index, error);
        self.top_up();
    }

    /// Classify a finished job and either retry it or record its result.
    fn finish_job(&mut self, index: usize, encoder_error: bool) {
        let job = self.jobs[index].job.clone();
        let (status, output_bytes, failure_reason) = classify_output(encoder_error, &job.output_path);

        if status == ResultStatus::Failed && self.jobs[index].retries < self.config.encoding.encode_retries {
            let entry = &mut self.jobs[index];
            entry.retries += 1;
            entry.log_error(&format!(
                "Encode failed ({}); retrying ({}/{})",
                failure_reason.as_deref().unwrap_or("unknown error"),
                entry.retries,
                self.config.encoding.encode_retries
            ));
            entry.reset();
            return;
        }

        let mut entry = self.jobs.remove(index);
        self.tracker.report_finished(job.job_work());
        let elapsed = entry.started_at.map_or(Duration::ZERO, |s| s.elapsed());

        match status {
            ResultStatus::Succeeded => {
                self.run_succeeded += 1;
                entry.log(&format!("Encode succeeded ({} bytes)", output_bytes));
                if self.config.encoding.preserve_modify_time_files {
                    self.preserve_modify_time(&job);
                }
                if let Err(e) = run_post_encode(&self.config.post_encode, self.actions.as_ref(), &job.output_path) {
                    entry.log_error(&format!("Post-encode program failed: {}", e));
                }
            }
            _ => {
                self.run_failed += 1;
                entry.log_error(&format!(
                    "Encode failed: {}",
                    failure_reason.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        entry.set_state(status.into());
        let log_path = entry.logger.as_ref().and_then(|l| l.path().map(PathBuf::from));
        if self.config.encoding.copy_log_to_output_folder {
            if let Some(log) = &log_path {
                self.copy_log(log, &job);
            }
        }

        self.completed.push(EncodeResult {
            job,
            status,
            output_bytes,
            elapsed,
            log_path,
            failure_reason,
        });
        self.persist_logged();
    }

    fn environment_failure(&mut self, kind: &'static str, message: String) {
        if self.environment_failures.insert(kind) {
            warn!(kind, "{}", message);
        } else {
            debug!(kind, "{}", message);
        }
    }

    fn preserve_modify_time(&mut self, job: &EncodeJob) {
        let result = fs::metadata(&job.source_path)
            .and_then(|m| m.modified())
            .and_then(|modified| {
                fs::File::options()
                    .write(true)
                    .open(&job.output_path)?
                    .set_modified(modified)
            });
        if let Err(e) = result {
            self.environment_failure(
                "modify_time",
                format!("Could not set modify time on {}: {}", job.output_path.display(), e),
            );
        }
    }

    fn copy_log(&mut self, log: &std::path::Path, job: &EncodeJob) {
        let (Some(folder), Some(name)) = (job.output_path.parent(), log.file_name()) else {
            return;
        };
        if let Err(e) = fs::copy(log, folder.join(name)) {
            self.environment_failure(
                "copy_log",
                format!("Could not copy log to {}: {}", folder.display(), e),
            );
        }
    }

    /// End the run once nothing is left to encode.
    fn check_drained(&mut self) {
        if !self.is_running() || !self.jobs.is_empty() {
            return;
        }

        info!(
            succeeded = self.run_succeeded,
            failed = self.run_failed,
            "Encode queue finished"
        );
        self.state = QueueState::Idle;
        self.auto_paused = false;
        self.tracker.report_encode_stop();
        self.auto_pause.report_stop();

        // Notifications and system actions wait on child processes
        let config = self.config.end_of_queue.clone();
        let actions = self.actions.clone();
        let (succeeded, failed) = (self.run_succeeded, self.run_failed);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tx = self.tx.clone();
                runtime.spawn_blocking(move || {
                    let outcome = run_end_of_queue(&config, actions.as_ref(), succeeded, failed);
                    let _ = tx.send(EngineMessage::EndOfQueueFinished(outcome));
                });
            }
            Err(_) => {
                let outcome = run_end_of_queue(&config, actions.as_ref(), succeeded, failed);
                self.on_end_of_queue_finished(outcome);
            }
        }
    }

    fn on_end_of_queue_finished(&mut self, outcome: EndOfQueueOutcome) {
        if !outcome.exit_requested {
            return;
        }
        if self.state == QueueState::Idle {
            self.exit_requested = true;
        } else {
            info!(state = ?self.state, "A new run started; not closing");
        }
    }

    fn update_overall_progress(&mut self) {
        let in_progress: f64 = self
            .jobs
            .iter()
            .filter(|e| e.state.is_live())
            .map(|e| e.completed_work)
            .sum();
        let snapshot: Vec<QueueEntrySnapshot> = self
            .jobs
            .iter()
            .map(|e| QueueEntrySnapshot {
                id: e.job.id,
                work: e.job.job_work().encoding(e.state.is_live()),
                completed_work: e.completed_work,
                eta: e.eta,
            })
            .collect();
        self.tracker.calculate_overall_encode_progress(in_progress, &snapshot);
    }

    fn update_watched_outputs(&self) {
        let outputs = self
            .jobs
            .iter()
            .filter(|e| e.state.is_live())
            .map(|e| e.job.output_path.clone())
            .collect();
        self.auto_pause.update_watched_outputs(outputs);
    }

    /// Pause every running job (user request).
    pub fn pause(&mut self) {
        match self.state {
            QueueState::Encoding => {
                info!("Pausing encode queue");
                self.pause_jobs(false);
                self.tracker.report_encode_pause();
                self.auto_pause.report_pause();
            }
            QueueState::Paused if self.auto_paused => {
                // Turn the auto-pause into a manual one so it is not auto-resumed
                self.pause_jobs(false);
                self.auto_pause.report_pause();
            }
            _ => debug!(state = ?self.state, "Pause ignored"),
        }
    }

    fn pause_jobs(&mut self, auto: bool) {
        for entry in self.jobs.iter_mut().filter(|e| e.state.is_live()) {
            Self::pause_entry(entry, auto);
        }
        self.state = QueueState::Paused;
        self.auto_paused = auto;
    }

    /// Resume a paused queue (user request).
    pub fn resume(&mut self) {
        if self.state != QueueState::Paused {
            debug!(state = ?self.state, "Resume ignored");
            return;
        }
        info!("Resuming encode queue");
        self.resume_jobs();
        self.auto_pause.report_resume();
        self.top_up();
    }

    fn resume_jobs(&mut self) {
        for entry in self.jobs.iter_mut().filter(|e| e.state.is_live()) {
            Self::resume_entry(entry);
        }
        self.state = QueueState::Encoding;
        self.auto_paused = false;
        self.tracker.report_encode_resume();
    }

    fn on_auto_pause(&mut self, signal: AutoPauseSignal) {
        match signal {
            AutoPauseSignal::Pause(reason) if self.state == QueueState::Encoding => {
                info!(?reason, "Auto-pausing encode queue");
                self.pause_jobs(true);
                self.tracker.report_encode_pause();
            }
            AutoPauseSignal::Resume if self.state == QueueState::Paused && self.auto_paused => {
                info!("Auto-resuming encode queue");
                self.resume_jobs();
                self.top_up();
            }
            _ => debug!(?signal, state = ?self.state, "Auto-pause signal no longer applies"),
        }
    }

    /// Stop the queue.
    pub fn stop(&mut self, reason: StopReason) {
        match reason {
            StopReason::Succeeded => debug!("Stop with reason Succeeded ignored"),
            StopReason::Manual => self.stop_manual(),
            StopReason::AppExit => self.stop_for_exit(),
        }
    }

    fn stop_manual(&mut self) {
        if !self.is_running() {
            debug!(state = ?self.state, "Stop ignored");
            return;
        }
        info!("Stopping encode queue");
        self.stop_reason = StopReason::Manual;
        self.clear_on_stop = self.jobs.len() == 1;
        self.auto_paused = false;
        self.tracker.report_encode_stop();
        self.auto_pause.report_stop();

        for entry in self.jobs.iter_mut().filter(|e| e.state.is_live()) {
            Self::stop_entry(entry);
        }
        if self.clear_on_stop {
            let (live, canceled): (Vec<_>, Vec<_>) =
                self.jobs.drain(..).partition(|e| e.state.is_live());
            self.jobs = live;
            for mut entry in canceled {
                entry.set_state(JobState::Canceled);
            }
        }

        self.state = if self.jobs.iter().any(|e| e.state.is_live()) {
            QueueState::Stopping
        } else {
            QueueState::Idle
        };
        self.persist_logged();
    }

    /// Stop every encoder and wait for it to exit. Live jobs go back to
    /// the queue so they run again after a restart.
    fn stop_for_exit(&mut self) {
        info!("Stopping all encoders for exit");
        self.stop_reason = StopReason::AppExit;

        for index in 0..self.jobs.len() {
            if !self.jobs[index].state.is_live() {
                continue;
            }
            let entry = &mut self.jobs[index];
            if let Some(proxy) = entry.proxy.as_mut() {
                if let Err(e) = proxy.stop_and_wait() {
                    entry.log_error(&format!("Could not stop encoder: {}", e));
                }
            }
            entry.log("Encode stopped for exit");
            entry.reset();
            let job = entry.job.clone();
            self.arbiter.release_slot(&job);
        }

        self.state = QueueState::Idle;
        self.auto_paused = false;
        self.tracker.report_encode_stop();
        self.auto_pause.report_stop();
        self.update_watched_outputs();
        self.persist_logged();
    }

    /// Empty the completed list, deleting sources of succeeded jobs if enabled.
    pub fn clear_completed(&mut self) {
        let delete = self.config.encoding.delete_source_files_on_clearing_completed;
        for result in self.completed.drain(..) {
            if !delete
                || result.status != ResultStatus::Succeeded
                || result.job.source_type != SourceType::File
            {
                continue;
            }
            match fs::remove_file(&result.job.source_path) {
                Ok(()) => info!(path = %result.job.source_path.display(), "Deleted source file"),
                Err(e) => warn!(
                    path = %result.job.source_path.display(),
                    "Could not delete source file: {}", e
                ),
            }
        }
    }

    /// Apply changed configuration.
    pub fn update_config(&mut self, config: Config) {
        let plan = SlotPlan::derive(&config.encoding);
        if plan != self.plan {
            info!(slots = plan.slots(), devices = plan.accelerator_devices, "Slot plan changed");
        }
        self.arbiter.set_max_simultaneous_encodes(plan.slots());
        self.tracker.set_slots(plan.slots());
        self.auto_pause.update_config(config.auto_pause.clone());
        self.plan = plan;
        self.config = config;
        self.top_up();
    }

    fn persist(&self) -> Result<(), QueueError> {
        let jobs: Vec<EncodeJob> = self.jobs.iter().map(|e| e.job.clone()).collect();
        self.store.save(&jobs)?;
        Ok(())
    }

    fn persist_logged(&mut self) {
        if let Err(e) = self.persist() {
            self.environment_failure("persist", format!("Could not save queue: {}", e));
        }
    }

    fn publish_status(&self) {
        let progress = self.tracker.progress();
        let status = QueueStatus {
            timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
            state: self.state,
            jobs: self.jobs.iter().map(QueueEntry::status).collect(),
            completed: self.completed.clone(),
            overall_progress: progress.fraction,
            eta_secs: self.tracker.displayed_eta().as_secs(),
            elapsed_secs: self.tracker.displayed_elapsed().as_secs(),
            auto_pause_state: self.auto_pause.state(),
            auto_pause_reason: self.auto_pause.reason(),
            pools: self.arbiter.usage(),
            exit_requested: self.exit_requested,
        };
        self.status_tx.send_replace(status);
    }
}

/// Cloneable control-side API of a running engine.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: EngineSender,
    status: StatusReceiver,
}

impl QueueHandle {
    fn send(&self, command: QueueCommand) -> Result<(), QueueError> {
        self.tx
            .send(EngineMessage::Command(command))
            .map_err(|_| QueueError::EngineGone)
    }

    async fn request(&self, command: impl FnOnce(Reply) -> QueueCommand) -> Result<(), QueueError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| QueueError::EngineGone)?
    }

    pub async fn queue(&self, job: EncodeJob) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Queue {
            job: Box::new(job),
            reply,
        })
        .await
    }

    pub async fn remove(&self, id: JobId) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Remove { id, reply }).await
    }

    pub async fn move_job(&self, id: JobId, index: usize) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Move { id, index, reply })
            .await
    }

    pub async fn start(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Start { reply }).await
    }

    pub fn pause(&self) -> Result<(), QueueError> {
        self.send(QueueCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), QueueError> {
        self.send(QueueCommand::Resume)
    }

    pub fn stop(&self) -> Result<(), QueueError> {
        self.send(QueueCommand::Stop {
            reason: StopReason::Manual,
            reply: None,
        })
    }

    pub fn clear_completed(&self) -> Result<(), QueueError> {
        self.send(QueueCommand::ClearCompleted)
    }

    pub fn update_config(&self, config: Config) -> Result<(), QueueError> {
        self.send(QueueCommand::UpdateConfig(Box::new(config)))
    }

    /// Stop every encoder, wait for them to exit and end the control loop.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueCommand::Stop {
            reason: StopReason::AppExit,
            reply: Some(reply),
        })
        .await
    }

    /// Latest published status.
    pub fn status(&self) -> QueueStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeError;
    use crate::end_of_queue::ActionError;
    use crate::environment::PowerStatus;
    use crate::auto_pause::{AutoPauseReason, AutoPauseState};
    use encode_queue_config::EndOfQueueAction;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Shared record of what the scripted encoders were asked to do.
    #[derive(Default)]
    struct Script {
        calls: Mutex<Vec<(JobId, &'static str)>>,
        accelerators: Mutex<Vec<Option<u32>>>,
        failing_starts: AtomicUsize,
    }

    impl Script {
        fn calls(&self, kind: &str) -> Vec<JobId> {
            self.calls
                .lock()
                .iter()
                .filter(|(_, k)| *k == kind)
                .map(|(id, _)| *id)
                .collect()
        }
    }

    struct ScriptedProxy {
        script: Arc<Script>,
        job: Option<JobId>,
    }

    impl ScriptedProxy {
        fn record(&self, kind: &'static str) -> Result<(), EncodeError> {
            let id = self.job.ok_or(EncodeError::NotRunning)?;
            self.script.calls.lock().push((id, kind));
            Ok(())
        }
    }

    impl EncoderProxy for ScriptedProxy {
        fn start_encode(
            &mut self,
            request: EncodeRequest,
            _logger: JobLogger,
            _events: EventSink,
        ) -> Result<(), EncodeError> {
            if self.script.failing_starts.load(Ordering::SeqCst) > 0 {
                self.script.failing_starts.fetch_sub(1, Ordering::SeqCst);
                return Err(EncodeError::Spawn(io::Error::new(io::ErrorKind::NotFound, "no encoder")));
            }
            self.job = Some(request.job.id);
            self.script.accelerators.lock().push(request.accelerator_index);
            self.record("start")
        }

        fn pause_encode(&mut self) -> Result<(), EncodeError> {
            self.record("pause")
        }

        fn resume_encode(&mut self) -> Result<(), EncodeError> {
            self.record("resume")
        }

        fn stop_encode(&mut self) -> Result<(), EncodeError> {
            self.record("stop")
        }

        fn stop_and_wait(&mut self) -> Result<(), EncodeError> {
            self.record("stop_and_wait")
        }
    }

    struct ScriptedFactory(Arc<Script>);

    impl EncoderProxyFactory for ScriptedFactory {
        fn create_proxy(&self) -> Box<dyn EncoderProxy> {
            Box::new(ScriptedProxy {
                script: self.0.clone(),
                job: None,
            })
        }
    }

    struct QuietProbe;

    impl EnvironmentProbe for QuietProbe {
        fn power_status(&self) -> Option<PowerStatus> {
            None
        }

        fn free_space_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(u64::MAX)
        }

        fn running_process_names(&self) -> HashSet<String> {
            HashSet::new()
        }
    }

    struct NoActions;

    impl SystemActions for NoActions {
        fn notify(&self, _title: &str, _body: &str) -> Result<(), ActionError> {
            Ok(())
        }

        fn play_sound(&self, _file: &Path) -> Result<(), ActionError> {
            Ok(())
        }

        fn confirm(&self, _action: EndOfQueueAction) -> bool {
            false
        }

        fn perform(&self, _action: EndOfQueueAction) -> Result<(), ActionError> {
            Ok(())
        }

        fn spawn_program(&self, _program: &str, _args: &[String]) -> Result<(), ActionError> {
            Ok(())
        }
    }

    struct Harness {
        dir: TempDir,
        script: Arc<Script>,
        engine: ProcessingEngine,
        _rx: EngineReceiver,
    }

    fn config_for(dir: &Path, max: u32) -> Config {
        let mut config = Config::default();
        config.paths.state_dir = Some(dir.join("state"));
        config.encoding.max_simultaneous_encodes = max;
        config.end_of_queue.notification = false;
        config
    }

    fn harness_with(dir: TempDir, config: Config) -> Harness {
        let script = Arc::new(Script::default());
        let deps = EngineDeps {
            encoder: Arc::new(ScriptedFactory(script.clone())),
            probe: Arc::new(QuietProbe),
            actions: Arc::new(NoActions),
        };
        let (engine, rx) = ProcessingEngine::new(config, deps);
        Harness {
            dir,
            script,
            engine,
            _rx: rx,
        }
    }

    fn harness(max: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = config_for(dir.path(), max);
        harness_with(dir, config)
    }

    impl Harness {
        fn job(&self, name: &str) -> EncodeJob {
            EncodeJob::new(
                self.dir.path().join(format!("{}.mkv", name)),
                self.dir.path().join(format!("{}.mp4", name)),
                60.0,
            )
        }

        fn add(&mut self, name: &str) -> JobId {
            let job = self.job(name);
            let id = job.id;
            self.engine.queue_job(job).unwrap();
            id
        }

        fn event(&mut self, id: JobId, event: EncoderEvent) {
            self.engine.handle_message(EngineMessage::Encoder { job_id: id, event });
        }

        fn live_ids(&self) -> Vec<JobId> {
            self.engine
                .jobs()
                .filter(|(_, state)| state.is_live())
                .map(|(job, _)| job.id)
                .collect()
        }

        fn state_of(&self, id: JobId) -> Option<JobState> {
            self.engine.jobs().find(|(job, _)| job.id == id).map(|(_, s)| s)
        }

        /// Contents of every log file written for `id`.
        fn log_text(&self, id: JobId) -> String {
            let short = id.short();
            fs::read_dir(self.dir.path().join("state").join("logs"))
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .filter(|path| path.to_string_lossy().contains(&short))
                .map(|path| fs::read_to_string(path).unwrap())
                .collect()
        }

        /// Finish a job, writing `bytes` to its output first.
        fn complete(&mut self, id: JobId, bytes: &[u8], error: bool) {
            let output = self
                .engine
                .jobs()
                .find(|(job, _)| job.id == id)
                .map(|(job, _)| job.output_path.clone())
                .unwrap();
            fs::write(output, bytes).unwrap();
            self.event(id, EncoderEvent::Completed { error });
        }
    }

    #[test]
    fn test_starts_up_to_slot_limit_in_order() {
        let mut h = harness(2);
        let a = h.add("a");
        let b = h.add("b");
        let c = h.add("c");
        h.engine.start().unwrap();

        assert_eq!(h.script.calls("start"), vec![a, b]);
        assert_eq!(h.state_of(c), Some(JobState::Queued));

        h.event(a, EncoderEvent::Started);
        h.complete(a, b"data", false);
        assert_eq!(h.script.calls("start"), vec![a, b, c]);
        assert_eq!(h.engine.completed()[0].status, ResultStatus::Succeeded);
    }

    #[test]
    fn test_refused_lease_does_not_skip_ahead() {
        let mut h = harness(3);
        let mut first = h.job("disc1");
        first.source_type = SourceType::Disc;
        first.source_path = PathBuf::from("/dev/sr0/title1");
        let mut second = first.clone();
        second.id = JobId::new();
        second.output_path = h.dir.path().join("disc2.mp4");
        let (first_id, second_id) = (first.id, second.id);

        h.engine.queue_job(first).unwrap();
        h.engine.queue_job(second).unwrap();
        let file_job = h.add("file");
        h.engine.start().unwrap();

        // The second disc title waits for the drive and the file job waits behind it
        assert_eq!(h.script.calls("start"), vec![first_id]);
        assert_eq!(h.state_of(second_id), Some(JobState::Queued));
        assert_eq!(h.state_of(file_job), Some(JobState::Queued));

        h.event(first_id, EncoderEvent::Started);
        h.complete(first_id, b"data", false);
        assert_eq!(h.script.calls("start"), vec![first_id, second_id, file_job]);
    }

    #[test]
    fn test_classification_of_outputs() {
        let mut h = harness(2);
        let good = h.add("good");
        let empty = h.add("empty");
        h.add("later");
        h.engine.start().unwrap();

        h.complete(good, b"video", false);
        h.complete(empty, b"", false);

        let results = h.engine.completed();
        assert_eq!(results[0].job.id, good);
        assert_eq!(results[0].status, ResultStatus::Succeeded);
        assert_eq!(results[0].output_bytes, 5);
        assert_eq!(results[1].job.id, empty);
        assert_eq!(results[1].status, ResultStatus::Failed);
        assert!(results[1].failure_reason.is_some());
    }

    #[test]
    fn test_failed_job_is_retried_then_recorded() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.encoding.encode_retries = 1;
        let mut h = harness_with(dir, config);
        let a = h.add("a");
        h.engine.start().unwrap();

        h.complete(a, b"partial", true);
        assert!(h.engine.completed().is_empty());
        assert_eq!(h.script.calls("start"), vec![a, a]);

        h.complete(a, b"partial", true);
        assert_eq!(h.engine.completed().len(), 1);
        assert_eq!(h.engine.completed()[0].status, ResultStatus::Failed);
        assert_eq!(h.engine.state(), QueueState::Idle);
    }

    #[test]
    fn test_start_failure_fails_job_and_continues() {
        let mut h = harness(1);
        let a = h.add("a");
        let b = h.add("b");
        h.script.failing_starts.store(1, Ordering::SeqCst);
        h.engine.start().unwrap();

        assert_eq!(h.engine.completed()[0].job.id, a);
        assert_eq!(h.engine.completed()[0].status, ResultStatus::Failed);
        assert_eq!(h.script.calls("start"), vec![b]);
        assert!(h.engine.arbiter().holds_slot(b));
        assert!(!h.engine.arbiter().holds_slot(a));
    }

    #[test]
    fn test_manual_stop_with_single_job_clears_queue() {
        let mut h = harness(2);
        let a = h.add("a");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);

        h.engine.stop(StopReason::Manual);
        assert_eq!(h.engine.state(), QueueState::Stopping);
        assert_eq!(h.script.calls("stop"), vec![a]);

        h.event(a, EncoderEvent::Completed { error: true });
        assert_eq!(h.engine.state(), QueueState::Idle);
        assert_eq!(h.engine.jobs().count(), 0);
        assert!(h.engine.completed().is_empty());
        assert_eq!(h.engine.arbiter().total_holders(), 0);
        assert!(h.log_text(a).contains("INFO Job canceled"));
    }

    #[test]
    fn test_manual_stop_with_several_jobs_keeps_them_queued() {
        let mut h = harness(1);
        let a = h.add("a");
        let b = h.add("b");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);

        h.engine.stop(StopReason::Manual);
        h.event(a, EncoderEvent::Completed { error: true });

        assert_eq!(h.engine.state(), QueueState::Idle);
        assert_eq!(h.state_of(a), Some(JobState::Queued));
        assert_eq!(h.state_of(b), Some(JobState::Queued));
        assert!(h.engine.completed().is_empty());

        let persisted = QueueStore::new(&h.dir.path().join("state")).load().unwrap();
        assert_eq!(persisted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_control_is_deferred_until_started() {
        let mut h = harness(1);
        let a = h.add("a");
        h.engine.start().unwrap();

        h.engine.pause();
        assert!(h.script.calls("pause").is_empty());
        assert_eq!(h.state_of(a), Some(JobState::Starting));

        h.event(a, EncoderEvent::Started);
        assert_eq!(h.script.calls("pause"), vec![a]);
        assert_eq!(h.state_of(a), Some(JobState::Paused { auto: false }));

        h.engine.resume();
        assert_eq!(h.script.calls("resume"), vec![a]);
        h.engine.stop(StopReason::Manual);
        assert_eq!(h.script.calls("stop"), vec![a]);
    }

    #[test]
    fn test_stop_while_starting_is_applied_on_start() {
        let mut h = harness(1);
        let a = h.add("a");
        h.add("b");
        h.engine.start().unwrap();
        h.engine.stop(StopReason::Manual);
        assert!(h.script.calls("stop").is_empty());

        h.event(a, EncoderEvent::Started);
        assert_eq!(h.script.calls("stop"), vec![a]);
        h.event(a, EncoderEvent::Completed { error: true });
        assert_eq!(h.engine.state(), QueueState::Idle);
        assert_eq!(h.engine.arbiter().total_holders(), 0);
    }

    #[test]
    fn test_auto_pause_signals_only_apply_to_matching_state() {
        let mut h = harness(1);
        let a = h.add("a");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);

        // Resume while encoding is stale
        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Resume));
        assert!(h.script.calls("resume").is_empty());

        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Pause(
            AutoPauseReason::LowBattery,
        )));
        assert_eq!(h.engine.state(), QueueState::Paused);
        assert_eq!(h.state_of(a), Some(JobState::Paused { auto: true }));

        // Second pause is a no-op
        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Pause(
            AutoPauseReason::LowBattery,
        )));
        assert_eq!(h.script.calls("pause"), vec![a]);

        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Resume));
        assert_eq!(h.engine.state(), QueueState::Encoding);
        assert_eq!(h.script.calls("resume"), vec![a]);
    }

    #[test]
    fn test_auto_resume_does_not_undo_manual_pause() {
        let mut h = harness(1);
        let a = h.add("a");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);

        h.engine.pause();
        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Resume));
        assert_eq!(h.engine.state(), QueueState::Paused);
        assert!(h.script.calls("resume").is_empty());
        assert_eq!(h.engine.auto_pause.state(), AutoPauseState::ManuallyPaused);
    }

    #[test]
    fn test_app_exit_waits_and_requeues_live_jobs() {
        let mut h = harness(2);
        let a = h.add("a");
        let b = h.add("b");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);

        let (reply, mut rx) = oneshot::channel();
        let exit = h.engine.handle_message(EngineMessage::Command(QueueCommand::Stop {
            reason: StopReason::AppExit,
            reply: Some(reply),
        }));

        assert!(exit);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert_eq!(h.script.calls("stop_and_wait"), vec![a, b]);
        assert_eq!(h.engine.state(), QueueState::Idle);
        assert_eq!(h.engine.arbiter().total_holders(), 0);
        assert_eq!(h.state_of(a), Some(JobState::Queued));
        assert_eq!(
            QueueStore::new(&h.dir.path().join("state")).load().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_restored_queue_resumes_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.encoding.resume_encoding_on_restart = true;
        let job = EncodeJob::new(dir.path().join("a.mkv"), dir.path().join("a.mp4"), 30.0);
        QueueStore::new(&dir.path().join("state"))
            .save(&[job.clone()])
            .unwrap();

        let h = harness_with(dir, config);
        assert_eq!(h.engine.state(), QueueState::Encoding);
        assert_eq!(h.script.calls("start"), vec![job.id]);
    }

    #[test]
    fn test_round_robin_accelerator_devices() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 3);
        config.encoding.accelerator_devices = 2;
        let mut h = harness_with(dir, config);
        for name in ["a", "b", "c"] {
            let mut job = h.job(name);
            job.profile.video_encoder = "nvenc_h265".to_string();
            h.engine.queue_job(job).unwrap();
        }
        h.engine.start().unwrap();
        assert_eq!(*h.script.accelerators.lock(), vec![Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn test_remove_and_move() {
        let mut h = harness(1);
        let a = h.add("a");
        let b = h.add("b");
        let c = h.add("c");
        h.engine.start().unwrap();

        assert!(matches!(h.engine.remove_job(a), Err(QueueError::JobIsLive(_))));
        assert!(matches!(
            h.engine.remove_job(JobId::new()),
            Err(QueueError::UnknownJob(_))
        ));

        h.engine.move_job(c, 0).unwrap();
        h.engine.remove_job(b).unwrap();
        let order: Vec<JobId> = h.engine.jobs().map(|(job, _)| job.id).collect();
        assert_eq!(order, vec![c, a]);
    }

    #[test]
    fn test_start_requires_idle_and_jobs() {
        let mut h = harness(1);
        assert!(matches!(h.engine.start(), Err(QueueError::EmptyQueue)));
        h.add("a");
        h.engine.start().unwrap();
        assert!(matches!(h.engine.start(), Err(QueueError::NotIdle(QueueState::Encoding))));
    }

    #[test]
    fn test_close_program_requests_exit_when_drained() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.end_of_queue.action = EndOfQueueAction::CloseProgram;
        let mut h = harness_with(dir, config);
        let status = h.engine.subscribe();
        let a = h.add("a");
        h.engine.start().unwrap();

        h.complete(a, b"data", false);
        h.engine.publish_status();
        assert_eq!(h.engine.state(), QueueState::Idle);
        assert!(status.borrow().exit_requested);
    }

    #[test]
    fn test_clear_completed_deletes_sources_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.encoding.delete_source_files_on_clearing_completed = true;
        let mut h = harness_with(dir, config);
        let a = h.add("a");
        let source = h.dir.path().join("a.mkv");
        fs::write(&source, b"source").unwrap();
        h.engine.start().unwrap();
        h.complete(a, b"data", false);

        h.engine.clear_completed();
        assert!(h.engine.completed().is_empty());
        assert!(!source.exists());
    }

    #[test]
    fn test_progress_reaches_status() {
        let mut h = harness(1);
        let a = h.add("a");
        h.engine.start().unwrap();
        h.event(a, EncoderEvent::Started);
        h.event(
            a,
            EncoderEvent::Progress(crate::encode::EncodeProgress {
                pass_id: crate::job::PASS_SINGLE,
                fraction_complete: 0.5,
                current_fps: 30.0,
                average_fps: 28.0,
                estimated_time_left: Some(Duration::from_secs(40)),
            }),
        );
        h.engine.publish_status();

        let status = h.engine.subscribe().borrow().clone();
        assert_eq!(status.state, QueueState::Encoding);
        assert!((status.jobs[0].progress - 0.5).abs() < 1e-9);
        assert_eq!(status.jobs[0].eta_secs, Some(40));
        assert!((status.overall_progress - 0.5).abs() < 1e-9);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Start,
        Stop,
        Pause,
        Resume,
        StartedFirst,
        CompleteFirst(bool),
        AutoPause,
        AutoResume,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Pause),
            Just(Op::Resume),
            Just(Op::StartedFirst),
            any::<bool>().prop_map(Op::CompleteFirst),
            Just(Op::AutoPause),
            Just(Op::AutoResume),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_no_slot_leak_once_idle(ops in prop::collection::vec(op_strategy(), 1..40), max in 1u32..4) {
            let mut h = harness(max);
            for op in ops {
                match op {
                    Op::Add => {
                        let name = format!("job{}", JobId::new());
                        h.add(&name);
                    }
                    Op::Start => {
                        let _ = h.engine.start();
                    }
                    Op::Stop => h.engine.stop(StopReason::Manual),
                    Op::Pause => h.engine.pause(),
                    Op::Resume => h.engine.resume(),
                    Op::StartedFirst => {
                        if let Some(id) = h.live_ids().first().copied() {
                            h.event(id, EncoderEvent::Started);
                        }
                    }
                    Op::CompleteFirst(ok) => {
                        if let Some(id) = h.live_ids().first().copied() {
                            h.complete(id, if ok { b"data" } else { b"" }, !ok);
                        }
                    }
                    Op::AutoPause => {
                        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Pause(
                            AutoPauseReason::ProcessPresent,
                        )));
                    }
                    Op::AutoResume => {
                        h.engine.handle_message(EngineMessage::AutoPause(AutoPauseSignal::Resume));
                    }
                }
                prop_assert!(h.live_ids().len() <= max as usize);
            }

            // Drain: stop, then let every encoder report completion
            h.engine.stop(StopReason::Manual);
            for id in h.live_ids() {
                h.event(id, EncoderEvent::Started);
                h.event(id, EncoderEvent::Completed { error: true });
            }

            prop_assert_eq!(h.engine.state(), QueueState::Idle);
            prop_assert_eq!(h.engine.arbiter().total_holders(), 0);
        }
    }

    #[tokio::test]
    async fn test_handle_drives_engine() {
        let Harness {
            dir,
            script,
            engine,
            _rx: rx,
        } = harness(1);
        let handle = engine.handle();
        let task = tokio::spawn(engine.run(rx));

        let first = EncodeJob::new(dir.path().join("a.mkv"), dir.path().join("a.mp4"), 60.0);
        let second = EncodeJob::new(dir.path().join("b.mkv"), dir.path().join("b.mp4"), 60.0);
        let id = first.id;
        handle.queue(first.clone()).await.unwrap();
        assert!(matches!(handle.queue(first).await, Err(QueueError::DuplicateJob(_))));
        handle.queue(second).await.unwrap();

        handle.start().await.unwrap();
        assert!(matches!(handle.start().await, Err(QueueError::NotIdle(_))));
        assert_eq!(handle.status().jobs.len(), 2);

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(script.calls("start"), vec![id]);
        assert_eq!(script.calls("stop_and_wait"), vec![id]);
        assert!(matches!(handle.start().await, Err(QueueError::EngineGone)));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let mut h = harness(1);
        let a = h.add("a");
        for duration in [f64::NAN, f64::INFINITY, -1.0] {
            let mut bad = h.job("bad");
            bad.duration_secs = duration;
            assert!(matches!(
                h.engine.queue_job(bad),
                Err(QueueError::InvalidDuration { .. })
            ));
        }

        let persisted = QueueStore::new(&h.dir.path().join("state")).load().unwrap();
        assert_eq!(persisted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_unreadable_queue_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        fs::create_dir_all(&state).unwrap();
        let broken = r#"{"version": 1, "jobs": [{"duration_secs": null}]}"#;
        fs::write(state.join("queue.json"), broken).unwrap();

        let config = config_for(dir.path(), 1);
        let mut h = harness_with(dir, config);
        assert_eq!(h.engine.jobs().count(), 0);

        // Saving the new queue leaves the old file for the user
        h.add("a");
        let bad = h.dir.path().join("state").join("queue.json.bad");
        assert_eq!(fs::read_to_string(bad).unwrap(), broken);
        assert_eq!(QueueStore::new(&h.dir.path().join("state")).load().unwrap().len(), 1);
    }

    #[test]
    fn test_terminal_states_reach_the_job_log() {
        let mut h = harness(2);
        let a = h.add("a");
        let b = h.add("b");
        h.engine.start().unwrap();

        h.complete(a, b"data", false);
        h.complete(b, b"", false);
        assert!(h.log_text(a).contains("INFO Job succeeded"));
        assert!(h.log_text(b).contains("INFO Job failed"));
    }

    #[test]
    fn test_config_update_resizes_slots_live() {
        let mut h = harness(1);
        let a = h.add("a");
        let b = h.add("b");
        let c = h.add("c");
        let d = h.add("d");
        h.engine.start().unwrap();
        assert_eq!(h.live_ids(), vec![a]);

        let mut config = config_for(h.dir.path(), 3);
        h.engine.update_config(config.clone());
        assert_eq!(h.live_ids(), vec![a, b, c]);

        // Shrinking keeps running encodes; nothing starts until below the limit
        config.encoding.max_simultaneous_encodes = 1;
        h.engine.update_config(config);
        assert_eq!(h.live_ids(), vec![a, b, c]);

        h.complete(a, b"data", false);
        assert_eq!(h.live_ids(), vec![b, c]);
        h.complete(b, b"data", false);
        assert_eq!(h.live_ids(), vec![c]);
        h.complete(c, b"data", false);
        assert_eq!(h.live_ids(), vec![d]);
        assert_eq!(h.engine.arbiter().total_holders(), 1);
    }

    #[test]
    fn test_output_keeps_source_modify_time_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.encoding.preserve_modify_time_files = true;
        let mut h = harness_with(dir, config);
        let a = h.add("a");

        let source = h.dir.path().join("a.mkv");
        fs::write(&source, b"source").unwrap();
        let stamp = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        fs::File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(stamp)
            .unwrap();

        h.engine.start().unwrap();
        h.complete(a, b"data", false);

        let modified = fs::metadata(h.dir.path().join("a.mp4")).unwrap().modified().unwrap();
        assert_eq!(modified, stamp);
    }

    #[test]
    fn test_log_is_copied_next_to_output_when_enabled() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.encoding.copy_log_to_output_folder = true;
        let mut h = harness_with(dir, config);
        let a = h.add("a");
        h.engine.start().unwrap();
        h.complete(a, b"data", false);

        let log = h.engine.completed()[0].log_path.clone().unwrap();
        let copy = h.dir.path().join(log.file_name().unwrap());
        assert!(fs::read_to_string(copy).unwrap().contains("Job succeeded"));
    }

    /// Encoder that writes its output and finishes as soon as it starts.
    struct InstantProxy;

    impl EncoderProxy for InstantProxy {
        fn start_encode(
            &mut self,
            request: EncodeRequest,
            _logger: JobLogger,
            events: EventSink,
        ) -> Result<(), EncodeError> {
            fs::write(&request.job.output_path, b"data")?;
            events.send(EncoderEvent::Started);
            events.send(EncoderEvent::Completed { error: false });
            Ok(())
        }

        fn pause_encode(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }

        fn resume_encode(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }

        fn stop_encode(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }

        fn stop_and_wait(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }
    }

    struct InstantFactory;

    impl EncoderProxyFactory for InstantFactory {
        fn create_proxy(&self) -> Box<dyn EncoderProxy> {
            Box::new(InstantProxy)
        }
    }

    /// System actions whose end-of-queue action blocks until released.
    struct GatedActions {
        performing: AtomicUsize,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl SystemActions for GatedActions {
        fn notify(&self, _title: &str, _body: &str) -> Result<(), ActionError> {
            Ok(())
        }

        fn play_sound(&self, _file: &Path) -> Result<(), ActionError> {
            Ok(())
        }

        fn confirm(&self, _action: EndOfQueueAction) -> bool {
            true
        }

        fn perform(&self, _action: EndOfQueueAction) -> Result<(), ActionError> {
            self.performing.fetch_add(1, Ordering::SeqCst);
            let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
            Ok(())
        }

        fn spawn_program(&self, _program: &str, _args: &[String]) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_end_of_queue_action_does_not_stall_commands() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path(), 1);
        config.end_of_queue.action = EndOfQueueAction::Eject;
        let (release, gate) = std::sync::mpsc::channel();
        let actions = Arc::new(GatedActions {
            performing: AtomicUsize::new(0),
            release: Mutex::new(gate),
        });
        let deps = EngineDeps {
            encoder: Arc::new(InstantFactory),
            probe: Arc::new(QuietProbe),
            actions: actions.clone(),
        };
        let (engine, rx) = ProcessingEngine::new(config, deps);
        let handle = engine.handle();
        let task = tokio::spawn(engine.run(rx));

        let first = EncodeJob::new(dir.path().join("a.mkv"), dir.path().join("a.mp4"), 60.0);
        handle.queue(first).await.unwrap();
        handle.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while actions.performing.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The eject is still running and the engine keeps answering
        let began = Instant::now();
        let second = EncodeJob::new(dir.path().join("b.mkv"), dir.path().join("b.mp4"), 60.0);
        let answered = tokio::time::timeout(Duration::from_secs(2), handle.queue(second)).await;
        assert!(matches!(answered, Ok(Ok(()))));
        assert!(began.elapsed() < Duration::from_secs(2));

        release.send(()).unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
