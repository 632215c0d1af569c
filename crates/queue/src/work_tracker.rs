//! Queue-wide progress accounting and ETA estimation.
//!
//! Progress is cost-weighted: every job contributes its total work, and the
//! queue fraction is completed work over the work of every job present since
//! the run started. With several encodes in parallel the single-stream ETA is
//! corrected by simulating the running jobs plus the first few waiting ones on
//! the available slots.

use crate::job::{JobId, JobWork};
use std::time::{Duration, Instant};
use tracing::error;

/// Number of waiting jobs considered by the ETA simulation.
pub const LOOKAHEAD_WINDOW: usize = 10;

/// Displayed ETA/elapsed are refreshed on every Nth progress calculation.
pub const DISPLAY_REFRESH_INTERVAL: u64 = 5;

/// Largest plausible progress fraction; anything above is a bookkeeping error.
const MAX_VALID_FRACTION: f64 = 1.01;

/// Wall-clock timer that does not advance while paused.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

/// One entry of the live queue as seen by the ETA simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntrySnapshot {
    pub id: JobId,
    pub work: JobWork,
    /// Work completed so far (0 for jobs that have not started).
    pub completed_work: f64,
    /// Encoder-reported time left for this job, if it has measured one.
    pub eta: Option<Duration>,
}

/// Remaining time of a job that is already running, for [`simulate_makespan`].
pub type InProgressRemaining = f64;

/// List-schedule the queued jobs onto `slots` identical machines.
///
/// `in_progress` are the remaining times of jobs already occupying slots;
/// `queued` are the durations of jobs waiting, in queue order. Each time a job
/// finishes, the next queued job takes its slot. Returns the time at which the
/// last job finishes.
pub fn simulate_makespan(in_progress: &[InProgressRemaining], queued: &[f64], slots: usize) -> f64 {
    let slots = slots.max(1);
    let mut running: Vec<f64> = in_progress.iter().map(|r| r.max(0.0)).collect();
    let mut pending = queued.iter().map(|d| d.max(0.0));
    let mut now = 0.0;

    loop {
        while running.len() < slots {
            match pending.next() {
                Some(duration) => running.push(duration),
                None => break,
            }
        }

        if running.is_empty() {
            return now;
        }

        let step = running.iter().cloned().fold(f64::INFINITY, f64::min);
        now += step;
        for remaining in running.iter_mut() {
            *remaining -= step;
        }
        // Free every slot whose job just finished
        running.retain(|r| *r > 1e-9);
    }
}

/// Naive single-stream ETA in seconds.
pub fn naive_eta_secs(fraction: f64, elapsed_secs: f64) -> f64 {
    if fraction <= 0.0 {
        return 0.0;
    }
    (1.0 - fraction) * elapsed_secs / fraction
}

/// Aggregate progress of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OverallProgress {
    /// Completed fraction of the run, in `[0, 1]`.
    pub fraction: f64,
    /// Work completed per second of encode time.
    pub completion_rate: f64,
    /// Latest ETA (refreshed every call).
    pub eta: Duration,
}

/// Cost-weighted progress accounting for one queue run.
#[derive(Debug, Default)]
pub struct WorkTracker {
    stopwatch: Stopwatch,
    total_queue_cost: f64,
    completed_queue_work: f64,
    slots: usize,
    calculations: u64,
    invalid_fraction_logged: bool,
    progress: OverallProgress,
    displayed_eta: Duration,
    displayed_elapsed: Duration,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self {
            slots: 1,
            ..Default::default()
        }
    }

    /// Reset for a new run over `initial_work`.
    pub fn report_encode_start(&mut self, initial_work: &[JobWork], slots: usize) {
        self.total_queue_cost = initial_work.iter().map(|w| w.cost.max(0.0)).sum();
        self.completed_queue_work = 0.0;
        self.slots = slots.max(1);
        self.calculations = 0;
        self.invalid_fraction_logged = false;
        self.progress = OverallProgress::default();
        self.displayed_eta = Duration::ZERO;
        self.displayed_elapsed = Duration::ZERO;
        self.stopwatch.reset();
        self.stopwatch.start();
    }

    pub fn set_slots(&mut self, slots: usize) {
        self.slots = slots.max(1);
    }

    pub fn report_added_to_queue(&mut self, work: JobWork) {
        self.total_queue_cost += work.cost.max(0.0);
    }

    pub fn report_removed_from_queue(&mut self, work: JobWork) {
        self.total_queue_cost = (self.total_queue_cost - work.cost.max(0.0)).max(0.0);
    }

    /// A job finished (successfully or not); its whole cost counts as done.
    pub fn report_finished(&mut self, work: JobWork) {
        self.completed_queue_work += work.cost.max(0.0);
    }

    pub fn report_encode_pause(&mut self) {
        self.stopwatch.stop();
    }

    pub fn report_encode_resume(&mut self) {
        self.stopwatch.start();
    }

    pub fn report_encode_stop(&mut self) {
        self.stopwatch.stop();
    }

    pub fn total_queue_cost(&self) -> f64 {
        self.total_queue_cost
    }

    pub fn completed_queue_work(&self) -> f64 {
        self.completed_queue_work
    }

    pub fn progress(&self) -> OverallProgress {
        self.progress
    }

    /// ETA shown to the user; refreshed every [`DISPLAY_REFRESH_INTERVAL`] calls.
    pub fn displayed_eta(&self) -> Duration {
        self.displayed_eta
    }

    pub fn displayed_elapsed(&self) -> Duration {
        self.displayed_elapsed
    }

    /// Recalculate overall progress from the stopwatch.
    pub fn calculate_overall_encode_progress(
        &mut self,
        in_progress_completed_work: f64,
        live_queue: &[QueueEntrySnapshot],
    ) -> OverallProgress {
        let elapsed = self.stopwatch.elapsed();
        self.calculate_overall_encode_progress_at(elapsed, in_progress_completed_work, live_queue)
    }

    /// Recalculate overall progress given the encode time elapsed so far.
    pub fn calculate_overall_encode_progress_at(
        &mut self,
        elapsed: Duration,
        in_progress_completed_work: f64,
        live_queue: &[QueueEntrySnapshot],
    ) -> OverallProgress {
        self.calculations += 1;

        let done = self.completed_queue_work + in_progress_completed_work.max(0.0);
        let raw_fraction = if self.total_queue_cost > 0.0 {
            done / self.total_queue_cost
        } else {
            0.0
        };

        let elapsed_secs = elapsed.as_secs_f64();
        let valid = raw_fraction.is_finite() && (0.0..=MAX_VALID_FRACTION).contains(&raw_fraction);

        let (fraction, eta_secs, rate) = if valid {
            let fraction = raw_fraction.min(1.0);
            let rate = if elapsed_secs > 0.0 { done / elapsed_secs } else { 0.0 };
            let naive = naive_eta_secs(fraction, elapsed_secs);
            let eta = if self.slots > 1 && fraction > 0.0 {
                self.corrected_eta(naive, rate, live_queue)
            } else {
                naive
            };
            (fraction, eta, rate)
        } else {
            if !self.invalid_fraction_logged {
                self.invalid_fraction_logged = true;
                self.log_invalid_fraction(raw_fraction, in_progress_completed_work, live_queue);
            }
            let fraction = if raw_fraction.is_finite() { raw_fraction.clamp(0.0, 1.0) } else { 0.0 };
            (fraction, 0.0, 0.0)
        };

        let eta = if eta_secs.is_finite() && eta_secs >= 0.0 {
            Duration::try_from_secs_f64(eta_secs).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        self.progress = OverallProgress {
            fraction,
            completion_rate: rate,
            eta,
        };

        if (self.calculations - 1) % DISPLAY_REFRESH_INTERVAL == 0 {
            self.displayed_eta = eta;
            self.displayed_elapsed = elapsed;
        }

        self.progress
    }

    /// Apply the multi-slot correction to the naive ETA.
    ///
    /// Every encoding job is simulated wherever it sits in the queue; waiting
    /// jobs are limited to the first [`LOOKAHEAD_WINDOW`]. The result is the
    /// ETA when every waiting job fit in the window, and a floor otherwise.
    fn corrected_eta(&self, naive: f64, rate: f64, live_queue: &[QueueEntrySnapshot]) -> f64 {
        let encoding = live_queue.iter().filter(|e| e.work.is_encoding).count().max(1);
        let per_slot_rate = rate / encoding as f64;
        if per_slot_rate <= 0.0 || !per_slot_rate.is_finite() {
            return naive;
        }

        let mut in_progress = Vec::new();
        let mut queued = Vec::new();
        let mut waiting = 0;
        for entry in live_queue {
            if entry.work.is_encoding {
                let remaining = match entry.eta {
                    Some(eta) if eta > Duration::ZERO => eta.as_secs_f64(),
                    _ => (entry.work.cost - entry.completed_work).max(0.0) / per_slot_rate,
                };
                in_progress.push(remaining);
            } else {
                waiting += 1;
                if queued.len() < LOOKAHEAD_WINDOW {
                    queued.push(entry.work.cost / per_slot_rate);
                }
            }
        }

        let simulated = simulate_makespan(&in_progress, &queued, self.slots);
        if waiting <= LOOKAHEAD_WINDOW {
            simulated
        } else {
            naive.max(simulated)
        }
    }

    fn log_invalid_fraction(
        &self,
        fraction: f64,
        in_progress_completed_work: f64,
        live_queue: &[QueueEntrySnapshot],
    ) {
        let mut dump = String::new();
        for entry in live_queue {
            dump.push_str(&format!(
                "\n  job {} cost={:.2} completed={:.2} encoding={} eta={:?}",
                entry.id, entry.work.cost, entry.completed_work, entry.work.is_encoding, entry.eta
            ));
        }
        error!(
            fraction,
            total_queue_cost = self.total_queue_cost,
            completed_queue_work = self.completed_queue_work,
            in_progress_completed_work,
            "Overall progress fraction out of range, ETA disabled for this run:{}",
            dump
        );
    }
}
