//! Auto-pause controller.
//!
//! While an encode runs, the controller polls the environment and asks the
//! engine to pause when the battery runs low, an output drive fills up or a
//! configured process starts. It resumes once every condition has cleared.
//! Signals travel as [`EngineMessage::AutoPause`]; the engine decides whether
//! they still apply.

use crate::environment::{normalize_process_name, EnvironmentProbe};
use crate::messages::{EngineMessage, EngineSender};
use encode_queue_config::AutoPauseConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPauseState {
    NoEncode,
    EncodeRunningNormally,
    /// The user resumed an auto-pause; no more auto-pausing this run.
    EncodeRunningForced,
    ManuallyPaused,
    AutoPaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPauseReason {
    LowBattery,
    LowDiskSpace,
    ProcessPresent,
}

impl AutoPauseReason {
    /// User-facing message shown when the queue pauses for this reason.
    pub fn message(self) -> &'static str {
        match self {
            AutoPauseReason::LowBattery => "Battery running low. Pausing encoding.",
            AutoPauseReason::LowDiskSpace => "Disk space running low. Pausing encoding.",
            AutoPauseReason::ProcessPresent => "A pause-on process started. Pausing encoding.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPauseSignal {
    Pause(AutoPauseReason),
    Resume,
}

#[derive(Debug)]
struct ControllerState {
    state: AutoPauseState,
    reason: Option<AutoPauseReason>,
    config: AutoPauseConfig,
    /// Processes running when the encode started; taken on the first poll.
    baseline: Option<HashSet<String>>,
    watched_outputs: Vec<PathBuf>,
    poll_task: Option<JoinHandle<()>>,
}

/// Watches the environment during a queue run.
#[derive(Clone)]
pub struct AutoPauseController {
    inner: Arc<Mutex<ControllerState>>,
    probe: Arc<dyn EnvironmentProbe>,
    tx: EngineSender,
    disk_error_logged: Arc<AtomicBool>,
}

impl std::fmt::Debug for AutoPauseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoPauseController")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl AutoPauseController {
    pub fn new(config: AutoPauseConfig, probe: Arc<dyn EnvironmentProbe>, tx: EngineSender) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ControllerState {
                state: AutoPauseState::NoEncode,
                reason: None,
                config,
                baseline: None,
                watched_outputs: Vec::new(),
                poll_task: None,
            })),
            probe,
            tx,
            disk_error_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> AutoPauseState {
        self.inner.lock().state
    }

    /// Reason of the current auto-pause, if any.
    pub fn reason(&self) -> Option<AutoPauseReason> {
        self.inner.lock().reason
    }

    pub fn is_polling(&self) -> bool {
        self.inner.lock().poll_task.is_some()
    }

    /// An encode run started: start polling and snapshot running processes.
    ///
    /// With a runtime the snapshot is taken by the poll task on a blocking
    /// thread, so this never waits on the process list.
    pub fn report_start(&self) {
        self.disk_error_logged.store(false, Ordering::Relaxed);
        let polling = {
            let mut inner = self.inner.lock();
            inner.baseline = None;
            inner.state = AutoPauseState::EncodeRunningNormally;
            inner.reason = None;
            self.start_polling(&mut inner)
        };
        if !polling {
            self.ensure_baseline();
        }
    }

    /// Snapshot the running processes unless this run already has one.
    fn ensure_baseline(&self) {
        let processes_enabled = {
            let inner = self.inner.lock();
            if inner.baseline.is_some() {
                return;
            }
            inner.config.processes_enabled
        };
        let names = if processes_enabled {
            self.probe.running_process_names()
        } else {
            HashSet::new()
        };
        let mut inner = self.inner.lock();
        if inner.baseline.is_none() {
            inner.baseline = Some(names);
        }
    }

    /// The user paused; a manual pause is never auto-resumed.
    pub fn report_pause(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            AutoPauseState::EncodeRunningNormally
            | AutoPauseState::EncodeRunningForced
            | AutoPauseState::AutoPaused => {
                inner.state = AutoPauseState::ManuallyPaused;
                inner.reason = None;
                Self::stop_polling(&mut inner);
            }
            _ => {}
        }
    }

    /// The user resumed.
    pub fn report_resume(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            AutoPauseState::AutoPaused => {
                info!("Auto-pause overridden; auto-pause disabled for the rest of this run");
                inner.state = AutoPauseState::EncodeRunningForced;
                inner.reason = None;
                Self::stop_polling(&mut inner);
            }
            AutoPauseState::ManuallyPaused => {
                inner.state = AutoPauseState::EncodeRunningNormally;
                self.start_polling(&mut inner);
            }
            _ => {}
        }
    }

    pub fn report_stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = AutoPauseState::NoEncode;
        inner.reason = None;
        inner.watched_outputs.clear();
        Self::stop_polling(&mut inner);
    }

    /// Output paths of the jobs currently encoding.
    pub fn update_watched_outputs(&self, outputs: Vec<PathBuf>) {
        self.inner.lock().watched_outputs = outputs;
    }

    pub fn update_config(&self, config: AutoPauseConfig) {
        let mut inner = self.inner.lock();
        let interval_changed = inner.config.poll_interval_secs != config.poll_interval_secs;
        inner.config = config;
        if interval_changed && inner.poll_task.is_some() {
            self.start_polling(&mut inner);
        }
    }

    /// Evaluate the environment once and signal the engine on a transition.
    ///
    /// Blocks on the environment probe. Returns the signal that was sent, if
    /// any.
    pub fn tick(&self) -> Option<AutoPauseSignal> {
        if !matches!(
            self.state(),
            AutoPauseState::EncodeRunningNormally | AutoPauseState::AutoPaused
        ) {
            return None;
        }
        self.ensure_baseline();

        let (state, config, baseline, outputs) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.config.clone(),
                inner.baseline.clone().unwrap_or_default(),
                inner.watched_outputs.clone(),
            )
        };

        let reason = self.evaluate(&config, &baseline, &outputs);

        let signal = {
            let mut inner = self.inner.lock();
            // The user may have acted while the probe was running
            if inner.state != state {
                return None;
            }
            match (inner.state, reason) {
                (AutoPauseState::EncodeRunningNormally, Some(reason)) => {
                    inner.state = AutoPauseState::AutoPaused;
                    inner.reason = Some(reason);
                    warn!(reason = ?reason, "{}", reason.message());
                    Some(AutoPauseSignal::Pause(reason))
                }
                (AutoPauseState::AutoPaused, None) => {
                    inner.state = AutoPauseState::EncodeRunningNormally;
                    inner.reason = None;
                    info!("Auto-pause conditions cleared. Resuming encoding.");
                    Some(AutoPauseSignal::Resume)
                }
                _ => None,
            }
        };

        if let Some(signal) = signal {
            let _ = self.tx.send(EngineMessage::AutoPause(signal));
        }
        signal
    }

    /// First condition that calls for a pause, in priority order.
    fn evaluate(
        &self,
        config: &AutoPauseConfig,
        baseline: &HashSet<String>,
        outputs: &[PathBuf],
    ) -> Option<AutoPauseReason> {
        if config.low_battery {
            if let Some(power) = self.probe.power_status() {
                if power.on_battery && power.percent < config.low_battery_percent {
                    return Some(AutoPauseReason::LowBattery);
                }
            }
        }

        if config.low_disk_space && self.disk_space_low(config, outputs) {
            return Some(AutoPauseReason::LowDiskSpace);
        }

        if config.processes_enabled && !config.processes.is_empty() {
            let running = self.probe.running_process_names();
            let found = config
                .processes
                .iter()
                .map(|name| normalize_process_name(name))
                .find(|name| running.contains(name) && !baseline.contains(name));
            if let Some(name) = found {
                info!(process = %name, "Pause-on process is running");
                return Some(AutoPauseReason::ProcessPresent);
            }
        }

        None
    }

    fn disk_space_low(&self, config: &AutoPauseConfig, outputs: &[PathBuf]) -> bool {
        let threshold = u64::from(config.low_disk_space_gb) * BYTES_PER_GB;
        let folders: BTreeSet<PathBuf> = outputs
            .iter()
            .map(|output| match output.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => output.clone(),
            })
            .collect();

        for folder in folders {
            match self.probe.free_space_bytes(&folder) {
                Ok(free) if free < threshold => {
                    info!(folder = %folder.display(), free_bytes = free, "Output drive is low on space");
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.disk_error_logged.swap(true, Ordering::Relaxed) {
                        warn!(folder = %folder.display(), "Could not read free disk space: {}", e);
                    }
                }
            }
        }
        false
    }

    /// Returns false when there is no runtime to poll on.
    fn start_polling(&self, inner: &mut ControllerState) -> bool {
        Self::stop_polling(inner);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available; auto-pause polling disabled");
                return false;
            }
        };

        let period = Duration::from_secs(inner.config.poll_interval_secs.max(1));
        let controller = self.clone();
        // Probes read sysfs and the process table; keep them off the async workers
        inner.poll_task = Some(runtime.spawn(async move {
            let snapshot = controller.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || snapshot.ensure_baseline()).await {
                warn!("Process snapshot failed: {}", e);
            }

            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let check = controller.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || check.tick()).await {
                    warn!("Auto-pause check failed: {}", e);
                }
            }
        }));
        true
    }

    fn stop_polling(inner: &mut ControllerState) {
        if let Some(task) = inner.poll_task.take() {
            task.abort();
        }
    }
}
