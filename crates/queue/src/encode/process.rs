//! Encoder proxy backed by an external encoder process
//!
//! Launches the configured encoder executable (HandBrakeCLI by default) for one
//! job, turns its progress output into [`EncoderEvent::Progress`] events and
//! reports the exit status as [`EncoderEvent::Completed`].

use super::proxy::{
    EncodeError, EncodeProgress, EncodeRequest, EncoderEvent, EncoderProxy, EncoderProxyFactory,
    EventSink,
};
use crate::job::{EncodeJob, RangeSelection};
use crate::job_log::JobLogger;
use encode_queue_config::EncoderConfig;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Delay between exit-status polls once the encoder closed its output.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One parsed progress line.
///
/// `Encoding: task 1 of 2, 45.67 % (123.45 fps, avg 110.00 fps, ETA 00h01m23s)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    /// 1-based task number.
    pub task: u32,
    pub task_count: u32,
    pub percent: f64,
    pub current_fps: Option<f64>,
    pub average_fps: Option<f64>,
    pub eta: Option<Duration>,
}

/// Parse an encoder progress line; returns None for any other output.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let rest = line.trim().strip_prefix("Encoding: task ")?;
    let (tasks, rest) = rest.split_once(',')?;
    let (task, task_count) = tasks.split_once(" of ")?;
    let task = task.trim().parse().ok()?;
    let task_count = task_count.trim().parse().ok()?;

    let (percent, rest) = rest.split_once('%')?;
    let percent = percent.trim().parse().ok()?;

    let mut progress = ProgressLine {
        task,
        task_count,
        percent,
        current_fps: None,
        average_fps: None,
        eta: None,
    };

    let details = rest
        .trim()
        .strip_prefix('(')
        .and_then(|d| d.split_once(')'))
        .map(|(inner, _)| inner);
    if let Some(details) = details {
        for part in details.split(',').map(str::trim) {
            if let Some(avg) = part.strip_prefix("avg ") {
                progress.average_fps = parse_fps(avg);
            } else if let Some(eta) = part.strip_prefix("ETA ") {
                progress.eta = parse_eta(eta);
            } else if part.ends_with("fps") {
                progress.current_fps = parse_fps(part);
            }
        }
    }

    Some(progress)
}

fn parse_fps(value: &str) -> Option<f64> {
    value.trim().trim_end_matches("fps").trim().parse().ok()
}

/// Parse `00h01m23s`.
fn parse_eta(value: &str) -> Option<Duration> {
    let (hours, rest) = value.trim().split_once('h')?;
    let (minutes, rest) = rest.split_once('m')?;
    let seconds = rest.strip_suffix('s')?;
    let total = hours.parse::<u64>().ok()? * 3600
        + minutes.parse::<u64>().ok()? * 60
        + seconds.parse::<u64>().ok()?;
    Some(Duration::from_secs(total))
}

/// Pass id for a 1-based task number of `job`.
fn pass_for_task(job: &EncodeJob, task: u32) -> i32 {
    let passes = job.pass_sequence();
    let index = (task.max(1) as usize - 1).min(passes.len().saturating_sub(1));
    passes.get(index).copied().unwrap_or(crate::job::PASS_SINGLE)
}

/// Convert a parsed line into a progress event for `job`.
pub fn progress_event(job: &EncodeJob, line: &ProgressLine) -> EncodeProgress {
    EncodeProgress {
        pass_id: pass_for_task(job, line.task),
        fraction_complete: (line.percent / 100.0).clamp(0.0, 1.0),
        current_fps: line.current_fps.unwrap_or(0.0),
        average_fps: line.average_fps.unwrap_or(0.0),
        estimated_time_left: line.eta,
    }
}

/// Expand the argument template for one request.
///
/// Tokens: `{input}`, `{output}`, `{title}`, `{preset}`, `{encoder}`,
/// `{device}`. Range, preview and two-pass flags are appended after the
/// template.
pub fn build_encoder_args(template: &[String], request: &EncodeRequest) -> Vec<String> {
    let job = &request.job;
    let device = request.accelerator_index.unwrap_or(0).to_string();
    let input = job.source_path.to_string_lossy();
    let output = job.output_path.to_string_lossy();
    let title = job.title.to_string();

    let mut args: Vec<String> = template
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{title}", &title)
                .replace("{preset}", &job.preset_name)
                .replace("{encoder}", &job.profile.video_encoder)
                .replace("{device}", &device)
        })
        .collect();

    match job.range {
        RangeSelection::All => {}
        RangeSelection::Chapters { start, end } => {
            args.push("--chapters".to_string());
            args.push(format!("{}-{}", start, end));
        }
        RangeSelection::Seconds { start, end } => {
            args.push("--start-at".to_string());
            args.push(format!("seconds:{}", start));
            args.push("--stop-at".to_string());
            args.push(format!("seconds:{}", (end - start).max(0.0)));
        }
        RangeSelection::Frames { start, end } => {
            args.push("--start-at".to_string());
            args.push(format!("frames:{}", start));
            args.push("--stop-at".to_string());
            args.push(format!("frames:{}", end.saturating_sub(start)));
        }
    }

    if let Some(preview) = request.preview {
        let start = job.cost() * f64::from(preview.start_percent.min(100)) / 100.0;
        args.push("--start-at".to_string());
        args.push(format!("seconds:{}", start.floor() as u64));
        args.push("--stop-at".to_string());
        args.push(format!("seconds:{}", preview.seconds));
    }

    if job.profile.two_pass {
        args.push("--two-pass".to_string());
    }

    args
}

/// Read stdout, splitting on both carriage returns and newlines.
fn read_output(stdout: ChildStdout, job: EncodeJob, logger: JobLogger, events: EventSink) {
    let mut reader = BufReader::new(stdout);
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();

    let mut flush = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line).to_string();
        line.clear();
        match parse_progress_line(&text) {
            Some(progress) => {
                events.send(EncoderEvent::Progress(progress_event(&job, &progress)));
            }
            None => logger.encoder_output(text.trim_end()),
        }
    };

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\r' || byte == b'\n' {
                        flush(&mut line);
                    } else {
                        line.push(byte);
                    }
                }
            }
            Err(e) => {
                logger.log_error(&format!("Lost encoder output: {}", e));
                break;
            }
        }
    }
    flush(&mut line);
}

/// Proxy for one encoder process.
#[derive(Debug)]
pub struct ProcessEncoderProxy {
    config: EncoderConfig,
    child: Option<Arc<Mutex<Child>>>,
}

impl ProcessEncoderProxy {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    fn child(&self) -> Result<&Arc<Mutex<Child>>, EncodeError> {
        self.child.as_ref().ok_or(EncodeError::NotRunning)
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), EncodeError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let mut child = self.child()?.lock();
        if child.try_wait()?.is_some() {
            return Err(EncodeError::NotRunning);
        }
        kill(Pid::from_raw(child.id() as i32), signal)
            .map_err(|e| EncodeError::Signal(e.to_string()))
    }
}

impl EncoderProxy for ProcessEncoderProxy {
    fn start_encode(
        &mut self,
        request: EncodeRequest,
        logger: JobLogger,
        events: EventSink,
    ) -> Result<(), EncodeError> {
        let args = build_encoder_args(&self.config.arguments, &request);
        logger.log(&format!(
            "Starting {} {}",
            self.config.executable,
            args.join(" ")
        ));

        let mut child = Command::new(&self.config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(EncodeError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        self.child = Some(child.clone());

        events.send(EncoderEvent::Started);

        if let Some(stderr) = stderr {
            let logger = logger.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    logger.encoder_output(&line);
                }
            });
        }

        let job = request.job;
        thread::spawn(move || {
            if let Some(stdout) = stdout {
                read_output(stdout, job, logger.clone(), events.clone());
            }

            let status = loop {
                let polled = child.lock().try_wait();
                match polled {
                    Ok(Some(status)) => break Some(status),
                    Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                    Err(e) => {
                        logger.log_error(&format!("Could not read encoder exit status: {}", e));
                        break None;
                    }
                }
            };

            let error = !status.map_or(false, |s| s.success());
            match status {
                Some(status) => logger.log(&format!("Encoder exited with {}", status)),
                None => logger.log_error("Encoder exit status unknown"),
            }
            debug!(job_id = %events.job_id(), error, "Encoder finished");
            events.send(EncoderEvent::Completed { error });
        });

        Ok(())
    }

    #[cfg(unix)]
    fn pause_encode(&mut self) -> Result<(), EncodeError> {
        self.signal(nix::sys::signal::Signal::SIGSTOP)
    }

    #[cfg(not(unix))]
    fn pause_encode(&mut self) -> Result<(), EncodeError> {
        self.child()?;
        Err(EncodeError::Unsupported("pausing an encoder process"))
    }

    #[cfg(unix)]
    fn resume_encode(&mut self) -> Result<(), EncodeError> {
        self.signal(nix::sys::signal::Signal::SIGCONT)
    }

    #[cfg(not(unix))]
    fn resume_encode(&mut self) -> Result<(), EncodeError> {
        self.child()?;
        Err(EncodeError::Unsupported("resuming an encoder process"))
    }

    fn stop_encode(&mut self) -> Result<(), EncodeError> {
        let mut child = self.child()?.lock();
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        Ok(())
    }

    fn stop_and_wait(&mut self) -> Result<(), EncodeError> {
        let mut child = self.child()?.lock();
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        child.wait()?;
        Ok(())
    }
}

/// Creates a [`ProcessEncoderProxy`] per job.
#[derive(Debug, Clone)]
pub struct ProcessEncoderFactory {
    config: EncoderConfig,
}

impl ProcessEncoderFactory {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }
}

impl EncoderProxyFactory for ProcessEncoderFactory {
    fn create_proxy(&self) -> Box<dyn EncoderProxy> {
        Box::new(ProcessEncoderProxy::new(self.config.clone()))
    }
}
