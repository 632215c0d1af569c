//! Environment conditions consulted by the auto-pause controller.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, ProcessesToUpdate, System};

/// Battery state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStatus {
    /// Running on battery rather than mains power.
    pub on_battery: bool,
    /// Remaining charge, 0-100.
    pub percent: u8,
}

/// Source of environment readings.
pub trait EnvironmentProbe: Send + Sync {
    /// Battery state, or None when the machine has no battery.
    fn power_status(&self) -> Option<PowerStatus>;

    /// Free bytes on the drive holding `path`.
    fn free_space_bytes(&self, path: &Path) -> io::Result<u64>;

    /// Normalized names of every running process (see [`normalize_process_name`]).
    fn running_process_names(&self) -> HashSet<String>;
}

/// Lowercase a process name and drop a trailing `.exe`.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Reads the real machine: sysfs for power, sysinfo for disks and processes.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    power_supply_dir: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe using a different power-supply directory (sysfs layout).
    pub fn with_power_supply_dir(dir: PathBuf) -> Self {
        Self {
            power_supply_dir: dir,
        }
    }
}

/// Parse a sysfs power-supply directory into a [`PowerStatus`].
///
/// Batteries are entries whose `type` is `Battery`; mains adapters are `Mains`
/// with `online` set to 1.
pub fn read_power_supply_dir(dir: &Path) -> Option<PowerStatus> {
    let entries = fs::read_dir(dir).ok()?;
    let mut battery_percent: Option<u8> = None;
    let mut discharging = false;
    let mut mains_online = false;

    for entry in entries.flatten() {
        let path = entry.path();
        let kind = read_trimmed(&path.join("type")).unwrap_or_default();
        match kind.as_str() {
            "Battery" => {
                if let Some(capacity) = read_trimmed(&path.join("capacity"))
                    .and_then(|c| c.parse::<u8>().ok())
                {
                    battery_percent = Some(battery_percent.map_or(capacity, |p| p.min(capacity)));
                }
                if read_trimmed(&path.join("status")).as_deref() == Some("Discharging") {
                    discharging = true;
                }
            }
            "Mains" => {
                if read_trimmed(&path.join("online")).as_deref() == Some("1") {
                    mains_online = true;
                }
            }
            _ => {}
        }
    }

    battery_percent.map(|percent| PowerStatus {
        on_battery: discharging && !mains_online,
        percent: percent.min(100),
    })
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

impl EnvironmentProbe for SystemProbe {
    fn power_status(&self) -> Option<PowerStatus> {
        read_power_supply_dir(&self.power_supply_dir)
    }

    fn free_space_bytes(&self, path: &Path) -> io::Result<u64> {
        let disks = Disks::new_with_refreshed_list();
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No mounted disk holds {}", target.display()),
                )
            })
    }

    fn running_process_names(&self) -> HashSet<String> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All);
        system
            .processes()
            .values()
            .map(|process| normalize_process_name(&process.name().to_string_lossy()))
            .collect()
    }
}
