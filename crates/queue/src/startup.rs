//! Startup checks
//!
//! Preflight checks run before the queue starts:
//! - The encoder executable can be found
//! - The state directory (queue file and job logs) is writable

use encode_queue_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("State directory {path} is not usable: {source}")]
    StateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Resolve an executable name the way the shell would.
///
/// Names containing a path separator are checked as given; bare names are
/// looked up in each `PATH` entry.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Check that the configured encoder executable exists
pub fn check_encoder_available(cfg: &Config) -> Result<PathBuf, StartupError> {
    find_executable(&cfg.encoder.executable).ok_or_else(|| {
        StartupError::EncoderUnavailable(format!(
            "'{}' not found; is it installed and in PATH?",
            cfg.encoder.executable
        ))
    })
}

/// Create the state and log directories if needed
pub fn prepare_state_dir(state_dir: &Path) -> Result<(), StartupError> {
    let logs = state_dir.join("logs");
    fs::create_dir_all(&logs).map_err(|source| StartupError::StateDir {
        path: logs.clone(),
        source,
    })?;

    let probe = state_dir.join(".write-test");
    fs::write(&probe, b"").map_err(|source| StartupError::StateDir {
        path: state_dir.to_path_buf(),
        source,
    })?;
    let _ = fs::remove_file(probe);
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Encoder availability
/// 2. State directory
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_encoder_available(cfg)?;
    prepare_state_dir(&cfg.paths.resolved_state_dir())?;
    Ok(())
}
