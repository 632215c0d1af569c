//! End-of-queue notification and system actions, and the post-encode command.

use encode_queue_config::{EndOfQueueAction, EndOfQueueConfig, PostEncodeConfig};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for system actions
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Side effects the queue triggers on the desktop.
///
/// Implementations may block; the engine calls the end-of-queue sequence from
/// a blocking thread.
pub trait SystemActions: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> Result<(), ActionError>;

    fn play_sound(&self, file: &Path) -> Result<(), ActionError>;

    /// Ask whether a destructive end-of-queue action may proceed.
    fn confirm(&self, action: EndOfQueueAction) -> bool;

    /// Perform a system-level action. `CloseProgram` and `None` are handled by
    /// the caller.
    fn perform(&self, action: EndOfQueueAction) -> Result<(), ActionError>;

    /// Launch a program without waiting for it.
    fn spawn_program(&self, program: &str, args: &[String]) -> Result<(), ActionError>;
}

/// Desktop actions through the usual freedesktop command-line tools.
#[derive(Debug, Clone, Default)]
pub struct ShellSystemActions {
    allow_destructive: bool,
}

impl ShellSystemActions {
    /// `allow_destructive` answers every confirmation.
    pub fn new(allow_destructive: bool) -> Self {
        Self { allow_destructive }
    }
}

fn run_and_wait(program: &str, args: &[&str]) -> Result<(), ActionError> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| ActionError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ActionError::Failed {
            program: program.to_string(),
            status: status.to_string(),
        })
    }
}

impl SystemActions for ShellSystemActions {
    fn notify(&self, title: &str, body: &str) -> Result<(), ActionError> {
        run_and_wait("notify-send", &["--app-name=encode-queue", title, body])
    }

    fn play_sound(&self, file: &Path) -> Result<(), ActionError> {
        let file = file.to_string_lossy();
        run_and_wait("paplay", &[file.as_ref()])
    }

    fn confirm(&self, action: EndOfQueueAction) -> bool {
        if !self.allow_destructive {
            warn!(action = ?action, "End-of-queue action needs confirmation; not confirmed");
        }
        self.allow_destructive
    }

    fn perform(&self, action: EndOfQueueAction) -> Result<(), ActionError> {
        match action {
            EndOfQueueAction::None | EndOfQueueAction::CloseProgram => Ok(()),
            EndOfQueueAction::Eject => run_and_wait("eject", &[]),
            EndOfQueueAction::Sleep => run_and_wait("systemctl", &["suspend"]),
            EndOfQueueAction::Hibernate => run_and_wait("systemctl", &["hibernate"]),
            EndOfQueueAction::Shutdown => run_and_wait("systemctl", &["poweroff"]),
            EndOfQueueAction::LogOff => match std::env::var("XDG_SESSION_ID") {
                Ok(session) => run_and_wait("loginctl", &["terminate-session", &session]),
                Err(_) => Err(ActionError::Unsupported("log off without a login session")),
            },
        }
    }

    fn spawn_program(&self, program: &str, args: &[String]) -> Result<(), ActionError> {
        spawn_detached(program, args).map(|_| ())
    }
}

/// Start `program` and return its pid. A background thread waits for the
/// child so it is reaped when it exits.
pub fn spawn_detached(program: &str, args: &[String]) -> Result<u32, ActionError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| ActionError::Spawn {
            program: program.to_string(),
            source,
        })?;
    let pid = child.id();
    reap_in_background(program.to_string(), child);
    Ok(pid)
}

fn reap_in_background(program: String, mut child: Child) {
    let spawned = std::thread::Builder::new()
        .name("child-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) if status.success() => debug!(program = %program, "Program exited"),
            Ok(status) => warn!(program = %program, %status, "Program exited with failure"),
            Err(e) => warn!(program = %program, "Could not wait for program: {}", e),
        });
    if let Err(e) = spawned {
        warn!("Could not start reaper thread: {}", e);
    }
}

/// What the caller should do after the end-of-queue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndOfQueueOutcome {
    /// The configured action asks the program to exit.
    pub exit_requested: bool,
    pub action_performed: bool,
}

/// Notification, then sound, then the configured action.
pub fn run_end_of_queue(
    config: &EndOfQueueConfig,
    actions: &dyn SystemActions,
    succeeded: usize,
    failed: usize,
) -> EndOfQueueOutcome {
    let mut outcome = EndOfQueueOutcome::default();

    if config.notification {
        let body = format!("{} succeeded, {} failed", succeeded, failed);
        if let Err(e) = actions.notify("Encode queue finished", &body) {
            warn!("Could not show notification: {}", e);
        }
    }

    if config.play_sound {
        if config.sound_file.is_empty() {
            debug!("No sound file configured");
        } else if let Err(e) = actions.play_sound(Path::new(&config.sound_file)) {
            warn!("Could not play sound: {}", e);
        }
    }

    match config.action {
        EndOfQueueAction::None => {}
        EndOfQueueAction::CloseProgram => {
            info!("Queue finished; closing");
            outcome.exit_requested = true;
        }
        action => {
            if action.is_destructive() && !actions.confirm(action) {
                info!(action = ?action, "End-of-queue action canceled");
                return outcome;
            }
            info!(action = ?action, "Running end-of-queue action");
            match actions.perform(action) {
                Ok(()) => outcome.action_performed = true,
                Err(e) => warn!(action = ?action, "End-of-queue action failed: {}", e),
            }
        }
    }

    outcome
}

/// Replace `{file}` and `{folder}` with the output path and its directory.
pub fn substitute_tokens(template: &str, output: &Path) -> String {
    let folder = output
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    template
        .replace("{file}", &output.to_string_lossy())
        .replace("{folder}", &folder)
}

/// Split an argument string on whitespace, keeping double-quoted runs together.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in arguments.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Run the post-encode program for a finished output, if enabled.
pub fn run_post_encode(
    config: &PostEncodeConfig,
    actions: &dyn SystemActions,
    output: &Path,
) -> Result<(), ActionError> {
    if !config.enabled || config.program.trim().is_empty() {
        return Ok(());
    }
    // Split first so a path with spaces stays one argument
    let args: Vec<String> = split_arguments(&config.arguments)
        .iter()
        .map(|arg| substitute_tokens(arg, output))
        .collect();
    debug!(program = %config.program, ?args, "Running post-encode program");
    actions.spawn_program(&config.program, &args)
}
