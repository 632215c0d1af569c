//! Slot planning
//!
//! Derives how many encodes may run at once from configuration and CPU count.

use encode_queue_config::EncodingConfig;

/// Upper bound for a derived encode count; explicit settings may exceed it.
const MAX_DERIVED_ENCODES: u32 = 4;

/// Logical cores one encode is expected to keep busy.
const CORES_PER_ENCODE: u32 = 8;

/// Effective concurrency settings for a queue run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlan {
    /// Logical CPU cores detected
    pub cpu_cores: u32,
    /// Size of the total pool
    pub max_simultaneous_encodes: u32,
    /// Hardware encoder devices to spread jobs across
    pub accelerator_devices: u32,
}

impl SlotPlan {
    /// Derive a plan using the detected CPU count.
    pub fn derive(cfg: &EncodingConfig) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a machine with `cpu_cores` logical cores.
    ///
    /// A `max_simultaneous_encodes` of 0 means one encode per
    /// [`CORES_PER_ENCODE`] cores, between 1 and [`MAX_DERIVED_ENCODES`].
    pub fn derive_with_cores(cfg: &EncodingConfig, cpu_cores: u32) -> Self {
        let cpu_cores = cpu_cores.max(1);
        let max_simultaneous_encodes = if cfg.max_simultaneous_encodes > 0 {
            cfg.max_simultaneous_encodes
        } else {
            derive_max_encodes(cpu_cores)
        };

        Self {
            cpu_cores,
            max_simultaneous_encodes,
            accelerator_devices: cfg.accelerator_devices.max(1),
        }
    }

    pub fn slots(&self) -> usize {
        self.max_simultaneous_encodes as usize
    }

    /// Accelerated jobs are spread round-robin over several devices.
    pub fn round_robin_accelerators(&self) -> bool {
        self.accelerator_devices > 1 && self.max_simultaneous_encodes > 1
    }
}

fn derive_max_encodes(cores: u32) -> u32 {
    (cores / CORES_PER_ENCODE).clamp(1, MAX_DERIVED_ENCODES)
}
