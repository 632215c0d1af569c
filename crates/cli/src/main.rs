//! CLI entry point for the encode queue
//!
//! `run` restores the saved queue and serves the control API until
//! interrupted. SIGHUP re-reads the config file. `add` appends a job to the
//! saved queue for the next run; a running queue takes jobs over
//! `POST /jobs`.

use clap::{Parser, Subcommand, ValueEnum};
use encode_queue::{
    run_server, run_startup_checks, Config, EncodeJob, EngineDeps, ProcessEncoderFactory,
    ProcessingEngine, QueueError, QueueHandle, QueueStore, RangeSelection, ServerState,
    ShellSystemActions, SourceType, StatusReceiver, SystemProbe,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Encode Queue - runs video encodes in parallel under hardware limits
#[derive(Parser, Debug)]
#[command(name = "encode-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue (default)
    Run {
        /// Start encoding right away
        #[arg(long)]
        start: bool,

        /// Skip startup checks (encoder executable, state directory)
        #[arg(long)]
        skip_checks: bool,

        /// Allow sleep, log off, shutdown and hibernate at the end of the queue
        #[arg(long)]
        allow_system_actions: bool,
    },
    /// Append a job to the saved queue
    Add {
        /// Source file, video folder or disc path
        source: PathBuf,

        /// Output file
        output: PathBuf,

        /// Length of the selected range in seconds
        #[arg(long)]
        duration: f64,

        #[arg(long, value_enum, default_value_t = SourceKind::File)]
        source_type: SourceKind,

        /// Title number on the source
        #[arg(long, default_value_t = 1)]
        title: u32,

        /// Chapter range, e.g. 2-5
        #[arg(long)]
        chapters: Option<String>,

        #[arg(long, default_value = "x264")]
        encoder: String,

        #[arg(long, default_value = "")]
        preset: String,

        #[arg(long)]
        two_pass: bool,

        /// Scan for forced subtitles before encoding
        #[arg(long)]
        subtitle_scan: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceKind {
    File,
    VideoFolder,
    Disc,
}

impl From<SourceKind> for SourceType {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::File => SourceType::File,
            SourceKind::VideoFolder => SourceType::VideoFolder,
            SourceKind::Disc => SourceType::Disc,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "encode_queue=debug,encode_queue_cli=debug"
    } else {
        "info"
    };
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        info!(path = %path.display(), "No config file; using defaults");
    }
    Config::load_or_default(path).map_err(|e| e.to_string())
}

/// Build a job from the `add` arguments.
#[allow(clippy::too_many_arguments)]
fn build_job(
    source: PathBuf,
    output: PathBuf,
    duration: f64,
    source_type: SourceKind,
    title: u32,
    chapters: Option<&str>,
    encoder: String,
    preset: String,
    two_pass: bool,
    subtitle_scan: bool,
) -> Result<EncodeJob, String> {
    let mut job = EncodeJob::new(source, output, duration);
    if !job.has_valid_duration() {
        return Err(format!("invalid duration {}; expected a finite number of seconds >= 0", duration));
    }
    job.source_type = source_type.into();
    job.title = title;
    job.preset_name = preset;
    job.profile.video_encoder = encoder;
    job.profile.two_pass = two_pass;
    job.profile.include_subtitle_scan = subtitle_scan;
    if let Some(chapters) = chapters {
        job.range = parse_chapters(chapters)?;
    }
    Ok(job)
}

fn parse_chapters(value: &str) -> Result<RangeSelection, String> {
    let (start, end) = value.split_once('-').unwrap_or((value, value));
    let start: u32 = start.trim().parse().map_err(|_| format!("bad chapter range '{}'", value))?;
    let end: u32 = end.trim().parse().map_err(|_| format!("bad chapter range '{}'", value))?;
    if start == 0 || end < start {
        return Err(format!("bad chapter range '{}'", value));
    }
    Ok(RangeSelection::Chapters { start, end })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let command = args.command.unwrap_or(Command::Run {
        start: false,
        skip_checks: false,
        allow_system_actions: false,
    });

    match command {
        Command::Run {
            start,
            skip_checks,
            allow_system_actions,
        } => run(config, args.config, start, skip_checks, allow_system_actions).await,
        Command::Add {
            source,
            output,
            duration,
            source_type,
            title,
            chapters,
            encoder,
            preset,
            two_pass,
            subtitle_scan,
        } => {
            let job = match build_job(
                source,
                output,
                duration,
                source_type,
                title,
                chapters.as_deref(),
                encoder,
                preset,
                two_pass,
                subtitle_scan,
            ) {
                Ok(job) => job,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };

            let store = QueueStore::new(&config.paths.resolved_state_dir());
            let id = job.id;
            match store.append(job) {
                Ok(len) => {
                    info!(job_id = %id, queue_length = len, "Added job");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Failed to add job: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Resolves once the engine asks the program to close.
async fn exit_requested(mut status: StatusReceiver) {
    loop {
        if status.borrow_and_update().exit_requested {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

/// Re-read the config file on every SIGHUP and hand it to the engine.
#[cfg(unix)]
async fn reload_on_hangup(handle: QueueHandle, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Could not listen for SIGHUP: {}", e);
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match load_config(&path) {
            Ok(config) => {
                if handle.update_config(config).is_err() {
                    return;
                }
                info!(path = %path.display(), "Reloaded config");
            }
            Err(e) => error!("Failed to reload config: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_handle: QueueHandle, _path: PathBuf) {}

async fn run(
    config: Config,
    config_path: PathBuf,
    start: bool,
    skip_checks: bool,
    allow_system_actions: bool,
) -> ExitCode {
    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let deps = EngineDeps {
        encoder: Arc::new(ProcessEncoderFactory::new(config.encoder.clone())),
        probe: Arc::new(SystemProbe::new()),
        actions: Arc::new(ShellSystemActions::new(allow_system_actions)),
    };
    let server = config.server.clone();
    let (engine, rx) = ProcessingEngine::new(config, deps);
    let handle = engine.handle();
    let status = engine.subscribe();
    let engine_task = tokio::spawn(engine.run(rx));

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server_task = server.enabled.then(|| {
        let state = ServerState::new(handle.clone(), Some(config_path.clone()));
        tokio::spawn(async move {
            let shutdown = async {
                let _ = server_stopped.await;
            };
            if let Err(e) = run_server(&server.bind, state, shutdown).await {
                error!("Control server error: {}", e);
            }
        })
    });
    let reload_task = tokio::spawn(reload_on_hangup(handle.clone(), config_path));

    if start {
        match handle.start().await {
            Ok(()) | Err(QueueError::NotIdle(_)) => {}
            Err(QueueError::EmptyQueue) => info!("Queue is empty; nothing to start"),
            Err(e) => warn!("Could not start queue: {}", e),
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Could not listen for Ctrl-C: {}", e);
            }
            info!("Interrupted; stopping encodes");
        }
        _ = exit_requested(status) => info!("Queue finished; closing"),
    }

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = handle.shutdown().await {
        error!("Shutdown failed: {}", e);
        code = ExitCode::FAILURE;
    }
    if let Err(e) = engine_task.await {
        error!("Processing engine panicked: {}", e);
        code = ExitCode::FAILURE;
    }

    reload_task.abort();
    let _ = stop_server.send(());
    if let Some(task) = server_task {
        let _ = task.await;
    }
    code
}
