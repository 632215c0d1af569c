//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Queue-level encoding options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncodingConfig {
    /// Maximum number of encodes running at once (0 = derive from CPU count)
    pub max_simultaneous_encodes: u32,
    /// Number of hardware encoder devices to spread accelerated jobs across
    pub accelerator_devices: u32,
    /// How many times a failed job is re-queued before its failure is recorded
    pub encode_retries: u32,
    /// Start a restored, non-empty queue as soon as the program launches
    pub resume_encoding_on_restart: bool,
    /// Copy the source modification time onto finished outputs
    pub preserve_modify_time_files: bool,
    /// Delete source files of succeeded jobs when completed results are cleared
    pub delete_source_files_on_clearing_completed: bool,
    /// Copy each job's log file next to its output
    pub copy_log_to_output_folder: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_encodes: 0,
            accelerator_devices: 1,
            encode_retries: 0,
            resume_encoding_on_restart: false,
            preserve_modify_time_files: false,
            delete_source_files_on_clearing_completed: false,
            copy_log_to_output_folder: false,
        }
    }
}

/// External encoder executable and its argument template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Program to launch for each job
    pub executable: String,
    /// Arguments; `{input}`, `{output}`, `{title}`, `{preset}`, `{encoder}`
    /// and `{device}` are substituted per job
    pub arguments: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            executable: "HandBrakeCLI".to_string(),
            arguments: ["-i", "{input}", "-t", "{title}", "-o", "{output}", "--preset", "{preset}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Environment conditions that pause a running queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoPauseConfig {
    /// Pause when running on battery below `low_battery_percent`
    pub low_battery: bool,
    pub low_battery_percent: u8,
    /// Pause when an output drive has less than `low_disk_space_gb` free
    pub low_disk_space: bool,
    pub low_disk_space_gb: u32,
    /// Pause while any of `processes` is running
    pub processes_enabled: bool,
    pub processes: Vec<String>,
    pub poll_interval_secs: u64,
}

impl Default for AutoPauseConfig {
    fn default() -> Self {
        Self {
            low_battery: true,
            low_battery_percent: 15,
            low_disk_space: true,
            low_disk_space_gb: 1,
            processes_enabled: false,
            processes: Vec::new(),
            poll_interval_secs: 5,
        }
    }
}

/// System action performed once the queue drains
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndOfQueueAction {
    #[default]
    None,
    Eject,
    CloseProgram,
    Sleep,
    LogOff,
    Shutdown,
    Hibernate,
}

impl EndOfQueueAction {
    /// Whether the action ends the user's session or powers the machine down
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            EndOfQueueAction::Sleep
                | EndOfQueueAction::LogOff
                | EndOfQueueAction::Shutdown
                | EndOfQueueAction::Hibernate
        )
    }
}

/// What happens once the last job of a run finishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndOfQueueConfig {
    pub action: EndOfQueueAction,
    /// Show a desktop notification
    pub notification: bool,
    pub play_sound: bool,
    pub sound_file: String,
}

impl Default for EndOfQueueConfig {
    fn default() -> Self {
        Self {
            action: EndOfQueueAction::None,
            notification: true,
            play_sound: false,
            sound_file: String::new(),
        }
    }
}

/// Command run after every successful encode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PostEncodeConfig {
    pub enabled: bool,
    pub program: String,
    /// Argument string; `{file}` and `{folder}` are substituted
    pub arguments: String,
}

/// Where queue state and job logs are kept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `queue.json` and `logs/` (platform default if None)
    pub state_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Resolve the state directory, falling back to `$XDG_STATE_HOME` / `$HOME`
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if let Ok(dir) = env::var("XDG_STATE_HOME") {
            return PathBuf::from(dir).join("encode-queue");
        }
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(".local/state/encode-queue");
        }
        PathBuf::from(".encode-queue")
    }
}

/// Status HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7879".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub auto_pause: AutoPauseConfig,
    #[serde(default)]
    pub end_of_queue: EndOfQueueConfig,
    #[serde(default)]
    pub post_encode: PostEncodeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - EQ_MAX_SIMULTANEOUS_ENCODES -> encoding.max_simultaneous_encodes
    /// - EQ_ENCODE_RETRIES -> encoding.encode_retries
    /// - EQ_RESUME_ENCODING_ON_RESTART -> encoding.resume_encoding_on_restart
    /// - EQ_AUTO_PAUSE_LOW_BATTERY -> auto_pause.low_battery
    /// - EQ_AUTO_PAUSE_LOW_DISK_SPACE -> auto_pause.low_disk_space
    /// - EQ_AUTO_PAUSE_LOW_DISK_SPACE_GB -> auto_pause.low_disk_space_gb
    /// - EQ_AUTO_PAUSE_PROCESSES_ENABLED -> auto_pause.processes_enabled
    /// - EQ_AUTO_PAUSE_PROCESSES -> auto_pause.processes (comma separated)
    /// - EQ_STATE_DIR -> paths.state_dir
    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse::<u32>("EQ_MAX_SIMULTANEOUS_ENCODES") {
            self.encoding.max_simultaneous_encodes = n;
        }

        if let Some(n) = env_parse::<u32>("EQ_ENCODE_RETRIES") {
            self.encoding.encode_retries = n;
        }

        if let Some(b) = env_bool("EQ_RESUME_ENCODING_ON_RESTART") {
            self.encoding.resume_encoding_on_restart = b;
        }

        if let Some(b) = env_bool("EQ_AUTO_PAUSE_LOW_BATTERY") {
            self.auto_pause.low_battery = b;
        }

        if let Some(b) = env_bool("EQ_AUTO_PAUSE_LOW_DISK_SPACE") {
            self.auto_pause.low_disk_space = b;
        }

        if let Some(gb) = env_parse::<u32>("EQ_AUTO_PAUSE_LOW_DISK_SPACE_GB") {
            self.auto_pause.low_disk_space_gb = gb;
        }

        if let Some(b) = env_bool("EQ_AUTO_PAUSE_PROCESSES_ENABLED") {
            self.auto_pause.processes_enabled = b;
        }

        if let Ok(val) = env::var("EQ_AUTO_PAUSE_PROCESSES") {
            self.auto_pause.processes = val
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(val) = env::var("EQ_STATE_DIR") {
            if !val.is_empty() {
                self.paths.state_dir = Some(PathBuf::from(val));
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    /// (with environment overrides applied).
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn env_bool(key: &str) -> Option<bool> {
    let val = env::var(key).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests share process state
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "EQ_MAX_SIMULTANEOUS_ENCODES",
        "EQ_ENCODE_RETRIES",
        "EQ_RESUME_ENCODING_ON_RESTART",
        "EQ_AUTO_PAUSE_LOW_BATTERY",
        "EQ_AUTO_PAUSE_LOW_DISK_SPACE",
        "EQ_AUTO_PAUSE_LOW_DISK_SPACE_GB",
        "EQ_AUTO_PAUSE_PROCESSES_ENABLED",
        "EQ_AUTO_PAUSE_PROCESSES",
        "EQ_STATE_DIR",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_encodes in 0u32..16,
            retries in 0u32..5,
            low_battery in proptest::bool::ANY,
            battery_percent in 1u8..100,
            disk_gb in 0u32..500,
            processes in proptest::collection::vec("[a-z]{1,12}", 0..4),
            action_idx in 0usize..7,
        ) {
            let actions = ["none", "eject", "close_program", "sleep", "log_off", "shutdown", "hibernate"];
            let process_list = processes
                .iter()
                .map(|p| format!("\"{}\"", p))
                .collect::<Vec<_>>()
                .join(", ");
            let toml_str = format!(
                r#"
[encoding]
max_simultaneous_encodes = {}
encode_retries = {}

[auto_pause]
low_battery = {}
low_battery_percent = {}
low_disk_space_gb = {}
processes = [{}]

[end_of_queue]
action = "{}"
"#,
                max_encodes, retries, low_battery, battery_percent, disk_gb, process_list, actions[action_idx]
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.encoding.max_simultaneous_encodes, max_encodes);
            prop_assert_eq!(config.encoding.encode_retries, retries);
            prop_assert_eq!(config.auto_pause.low_battery, low_battery);
            prop_assert_eq!(config.auto_pause.low_battery_percent, battery_percent);
            prop_assert_eq!(config.auto_pause.low_disk_space_gb, disk_gb);
            prop_assert_eq!(config.auto_pause.processes, processes);
            // untouched fields keep their defaults
            prop_assert_eq!(config.auto_pause.poll_interval_secs, 5);
            prop_assert_eq!(config.encoding.accelerator_devices, 1);
        }

        #[test]
        fn prop_env_overrides_max_simultaneous_encodes(
            initial in 0u32..8,
            overridden in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoding]\nmax_simultaneous_encodes = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("EQ_MAX_SIMULTANEOUS_ENCODES", overridden.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoding.max_simultaneous_encodes, overridden);
        }

        #[test]
        fn prop_env_overrides_low_disk_space(
            initial_enabled in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
            override_gb in 0u32..1000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[auto_pause]\nlow_disk_space = {}\n", initial_enabled);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("EQ_AUTO_PAUSE_LOW_DISK_SPACE", override_enabled.to_string());
            env::set_var("EQ_AUTO_PAUSE_LOW_DISK_SPACE_GB", override_gb.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.auto_pause.low_disk_space, override_enabled);
            prop_assert_eq!(config.auto_pause.low_disk_space_gb, override_gb);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.encoding.max_simultaneous_encodes, 0);
        assert_eq!(config.encoding.encode_retries, 0);
        assert!(!config.encoding.resume_encoding_on_restart);
        assert!(config.auto_pause.low_battery);
        assert_eq!(config.auto_pause.low_battery_percent, 15);
        assert_eq!(config.auto_pause.low_disk_space_gb, 1);
        assert!(!config.auto_pause.processes_enabled);
        assert_eq!(config.end_of_queue.action, EndOfQueueAction::None);
        assert_eq!(config.encoder.executable, "HandBrakeCLI");
        assert!(config.server.enabled);
    }

    #[test]
    fn test_env_process_list_is_split_and_trimmed() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("EQ_AUTO_PAUSE_PROCESSES", " vlc, obs64 ,,steam");
        env::set_var("EQ_AUTO_PAUSE_PROCESSES_ENABLED", "yes");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.auto_pause.processes_enabled);
        assert_eq!(config.auto_pause.processes, vec!["vlc", "obs64", "steam"]);
    }

    #[test]
    fn test_invalid_env_bool_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("EQ_AUTO_PAUSE_LOW_BATTERY", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.auto_pause.low_battery);
    }

    #[test]
    fn test_destructive_actions() {
        assert!(!EndOfQueueAction::None.is_destructive());
        assert!(!EndOfQueueAction::Eject.is_destructive());
        assert!(!EndOfQueueAction::CloseProgram.is_destructive());
        assert!(EndOfQueueAction::Sleep.is_destructive());
        assert!(EndOfQueueAction::LogOff.is_destructive());
        assert!(EndOfQueueAction::Shutdown.is_destructive());
        assert!(EndOfQueueAction::Hibernate.is_destructive());
    }

    #[test]
    fn test_missing_file_loads_defaults_with_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("EQ_ENCODE_RETRIES", "2");
        let config = Config::load_or_default("/nonexistent/encode-queue/config.toml");
        clear_env_vars();

        let config = config.expect("Missing file should load defaults");
        assert_eq!(config.encoding.encode_retries, 2);
        assert_eq!(config.encoder.executable, "HandBrakeCLI");
    }

    #[test]
    fn test_state_dir_explicit_wins() {
        let paths = PathsConfig {
            state_dir: Some(PathBuf::from("/var/lib/eq")),
        };
        assert_eq!(paths.resolved_state_dir(), PathBuf::from("/var/lib/eq"));
    }
}
