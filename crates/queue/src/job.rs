//! Encode job model.
//!
//! A job is the unit the queue orders, arbitrates hardware for and tracks
//! progress on. The encode profile is carried only as a reference; the queue
//! reads the encoder name and pass layout, nothing else.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Cost of the optional subtitle scan pre-pass, relative to one main pass.
pub const SUBTITLE_SCAN_COST_FRACTION: f64 = 0.0125;

/// Pass id reported by the encoder while scanning for forced subtitles.
pub const PASS_SUBTITLE_SCAN: i32 = -1;
/// Pass id of a single-pass encode.
pub const PASS_SINGLE: i32 = 0;
pub const PASS_FIRST: i32 = 1;
pub const PASS_SECOND: i32 = 2;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell jobs apart in file names.
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(8);
        simple
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the source is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// A single video file.
    #[default]
    File,
    /// A ripped disc structure on a regular drive (VIDEO_TS / BDMV).
    VideoFolder,
    /// An optical disc read directly from its drive.
    Disc,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::File => write!(f, "file"),
            SourceType::VideoFolder => write!(f, "video_folder"),
            SourceType::Disc => write!(f, "disc"),
        }
    }
}

/// Part of the title selected for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeSelection {
    #[default]
    All,
    Chapters { start: u32, end: u32 },
    Seconds { start: f64, end: f64 },
    Frames { start: u64, end: u64 },
}

/// The parts of an encode profile the queue cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    /// Encoder name as understood by the encoder executable (e.g. "x265", "nvenc_h265").
    pub video_encoder: String,
    #[serde(default)]
    pub two_pass: bool,
    /// Scan for forced subtitles before the main pass.
    #[serde(default)]
    pub include_subtitle_scan: bool,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_encoder: "x264".to_string(),
            two_pass: false,
            include_subtitle_scan: false,
        }
    }
}

/// A queued encode request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub id: JobId,
    pub source_path: PathBuf,
    #[serde(default)]
    pub source_type: SourceType,
    /// Title number on the source (1-based).
    #[serde(default = "default_title")]
    pub title: u32,
    #[serde(default)]
    pub range: RangeSelection,
    pub profile: EncodeProfile,
    pub preset_name: String,
    pub output_path: PathBuf,
    /// The user picked the output path instead of accepting the generated one.
    #[serde(default)]
    pub manual_output_path: bool,
    /// Length of the selected range in seconds.
    pub duration_secs: f64,
}

fn default_title() -> u32 {
    1
}

impl EncodeJob {
    /// Create a job with a fresh id and the default profile.
    pub fn new(source_path: PathBuf, output_path: PathBuf, duration_secs: f64) -> Self {
        Self {
            id: JobId::new(),
            source_path,
            source_type: SourceType::File,
            title: 1,
            range: RangeSelection::All,
            profile: EncodeProfile::default(),
            preset_name: String::new(),
            output_path,
            manual_output_path: false,
            duration_secs,
        }
    }

    /// The duration is a number of seconds the queue can account with.
    pub fn has_valid_duration(&self) -> bool {
        self.duration_secs.is_finite() && self.duration_secs >= 0.0
    }

    /// Cost of one main pass: the selected duration in seconds.
    pub fn cost(&self) -> f64 {
        if self.duration_secs.is_finite() {
            self.duration_secs.max(0.0)
        } else {
            0.0
        }
    }

    fn subtitle_scan_cost(&self) -> f64 {
        if self.profile.include_subtitle_scan {
            self.cost() * SUBTITLE_SCAN_COST_FRACTION
        } else {
            0.0
        }
    }

    fn pass_count(&self) -> u32 {
        if self.profile.two_pass {
            2
        } else {
            1
        }
    }

    /// Total work of the job across every pass.
    pub fn work(&self) -> f64 {
        self.cost() * self.pass_count() as f64 + self.subtitle_scan_cost()
    }

    /// Accounting record for the work tracker.
    pub fn job_work(&self) -> JobWork {
        JobWork::new(self.work())
    }

    /// Work completed so far given the encoder's current pass and fraction.
    pub fn completed_work(&self, pass_id: i32, fraction: f64) -> f64 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let scan = self.subtitle_scan_cost();
        let cost = self.cost();
        match pass_id {
            PASS_SUBTITLE_SCAN => fraction * scan,
            PASS_SINGLE | PASS_FIRST => scan + fraction * cost,
            PASS_SECOND => scan + cost + fraction * cost,
            _ => 0.0,
        }
    }

    /// Pass ids the encoder runs through for this job, in order.
    pub fn pass_sequence(&self) -> Vec<i32> {
        let mut passes = Vec::with_capacity(3);
        if self.profile.include_subtitle_scan {
            passes.push(PASS_SUBTITLE_SCAN);
        }
        if self.profile.two_pass {
            passes.push(PASS_FIRST);
            passes.push(PASS_SECOND);
        } else {
            passes.push(PASS_SINGLE);
        }
        passes
    }

    /// Short display name used for log file names and messages.
    pub fn display_name(&self) -> String {
        file_stem(&self.source_path)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    /// Waiting in the queue.
    Queued,
    /// Proxy asked to start; the encoder has not confirmed yet.
    Starting,
    Encoding,
    /// Paused by the user (`auto == false`) or by the auto-pause controller.
    Paused { auto: bool },
    /// An administrative stop was sent to the encoder.
    Stopping,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Whether the job currently holds an encoder (and a hardware lease).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Encoding | JobState::Paused { .. } | JobState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Starting => write!(f, "starting"),
            JobState::Encoding => write!(f, "encoding"),
            JobState::Paused { auto: true } => write!(f, "auto_paused"),
            JobState::Paused { auto: false } => write!(f, "paused"),
            JobState::Stopping => write!(f, "stopping"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Final status of a job in the completed-results list.
///
/// Canceled jobs leave the queue without a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Succeeded,
    Failed,
}

impl From<ResultStatus> for JobState {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Succeeded => JobState::Succeeded,
            ResultStatus::Failed => JobState::Failed,
        }
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeResult {
    pub job: EncodeJob,
    pub status: ResultStatus,
    pub output_bytes: u64,
    pub elapsed: Duration,
    pub log_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
}

/// Aggregate accounting record handed to the work tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobWork {
    /// Total work of the job across every pass.
    pub cost: f64,
    pub is_encoding: bool,
}

impl JobWork {
    pub fn new(cost: f64) -> Self {
        Self {
            cost,
            is_encoding: false,
        }
    }

    pub fn encoding(self, is_encoding: bool) -> Self {
        Self { is_encoding, ..self }
    }
}

/// Decide the result of a job whose encoder finished without reporting an error.
///
/// A missing or zero-byte output is a failure even when the encoder was happy.
pub fn classify_output(encoder_error: bool, output_path: &Path) -> (ResultStatus, u64, Option<String>) {
    if encoder_error {
        let bytes = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);
        return (
            ResultStatus::Failed,
            bytes,
            Some("Encoder reported an error".to_string()),
        );
    }

    match std::fs::metadata(output_path) {
        Ok(meta) if meta.len() > 0 => (ResultStatus::Succeeded, meta.len(), None),
        Ok(_) => (
            ResultStatus::Failed,
            0,
            Some("Output file is empty".to_string()),
        ),
        Err(e) => (
            ResultStatus::Failed,
            0,
            Some(format!("Output file not found: {}", e)),
        ),
    }
}
