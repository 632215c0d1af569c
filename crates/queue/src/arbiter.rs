//! Hardware resource arbiter.
//!
//! Every running job holds a lease on a set of pools: the total pool, the pool
//! of its hardware encoder family (if any) and the pool of the drive it reads
//! from (for discs). Leases are granted all-or-nothing under one lock.

use crate::job::{EncodeJob, JobId, SourceType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};
use tracing::{debug, info, warn};

/// Hardware encoder families with a limited number of concurrent sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AcceleratorFamily {
    Nvenc,
    QuickSync,
    Amf,
    Vaapi,
    MediaFoundation,
    VideoToolbox,
}

/// Substrings of encoder names identifying each family, checked in order.
const ACCELERATOR_MARKERS: &[(&str, AcceleratorFamily)] = &[
    ("nvenc", AcceleratorFamily::Nvenc),
    ("qsv", AcceleratorFamily::QuickSync),
    ("vce", AcceleratorFamily::Amf),
    ("amf", AcceleratorFamily::Amf),
    ("vcn", AcceleratorFamily::Amf),
    ("vaapi", AcceleratorFamily::Vaapi),
    ("mf_", AcceleratorFamily::MediaFoundation),
    ("videotoolbox", AcceleratorFamily::VideoToolbox),
    ("vt_", AcceleratorFamily::VideoToolbox),
];

impl AcceleratorFamily {
    /// Detect the family from an encoder name such as `nvenc_h265` or `qsv_av1`.
    pub fn detect(encoder: &str) -> Option<Self> {
        let lower = encoder.to_lowercase();
        ACCELERATOR_MARKERS
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, family)| *family)
    }

    /// Concurrent sessions allowed per family.
    pub fn slot_count(self) -> usize {
        match self {
            AcceleratorFamily::Nvenc => 3,
            AcceleratorFamily::QuickSync => 2,
            AcceleratorFamily::Amf => 2,
            AcceleratorFamily::Vaapi => 2,
            AcceleratorFamily::MediaFoundation => 1,
            AcceleratorFamily::VideoToolbox => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AcceleratorFamily::Nvenc => "nvenc",
            AcceleratorFamily::QuickSync => "quicksync",
            AcceleratorFamily::Amf => "amf",
            AcceleratorFamily::Vaapi => "vaapi",
            AcceleratorFamily::MediaFoundation => "media_foundation",
            AcceleratorFamily::VideoToolbox => "videotoolbox",
        }
    }
}

/// Identifies one pool in the arbiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolKey {
    Total,
    Accelerator(AcceleratorFamily),
    SourceDrive(String),
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKey::Total => write!(f, "total"),
            PoolKey::Accelerator(family) => write!(f, "accelerator:{}", family.name()),
            PoolKey::SourceDrive(drive) => write!(f, "drive:{}", drive),
        }
    }
}

/// A countable resource with a fixed number of slots.
#[derive(Debug, Clone)]
pub struct HardwarePool {
    name: String,
    slot_count: usize,
    holders: HashSet<JobId>,
}

impl HardwarePool {
    pub fn new(name: impl Into<String>, slot_count: usize) -> Self {
        Self {
            name: name.into(),
            slot_count,
            holders: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub fn can_acquire_slot(&self) -> bool {
        self.holders.len() < self.slot_count
    }

    fn acquire(&mut self, job: JobId) {
        self.holders.insert(job);
    }

    fn release(&mut self, job: JobId) -> bool {
        self.holders.remove(&job)
    }
}

/// Pool usage for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub name: String,
    pub holders: usize,
    pub slots: usize,
}

/// Root of a source path, used to key per-drive pools.
///
/// `D:\VIDEO_TS` → `D:`, `/media/cdrom/VIDEO_TS` → `/media/cdrom`, `/dev/sr0` → `/dev/sr0`.
pub fn source_drive_key(path: &Path) -> String {
    let mut components = path.components();
    match components.next() {
        Some(Component::Prefix(prefix)) => prefix.as_os_str().to_string_lossy().to_uppercase(),
        Some(Component::RootDir) => {
            let first = components.next();
            let second = components.next();
            match (first, second) {
                (Some(a), Some(b)) => format!(
                    "/{}/{}",
                    a.as_os_str().to_string_lossy(),
                    b.as_os_str().to_string_lossy()
                ),
                (Some(a), None) => format!("/{}", a.as_os_str().to_string_lossy()),
                _ => "/".to_string(),
            }
        }
        Some(other) => other.as_os_str().to_string_lossy().to_string(),
        None => String::new(),
    }
}

/// Pools a job needs to hold while it runs.
///
/// Pure function of the job's profile and source so that acquire and release
/// always agree.
pub fn required_pools(job: &EncodeJob) -> Vec<PoolKey> {
    let mut pools = vec![PoolKey::Total];
    if let Some(family) = AcceleratorFamily::detect(&job.profile.video_encoder) {
        pools.push(PoolKey::Accelerator(family));
    }
    if job.source_type == SourceType::Disc {
        pools.push(PoolKey::SourceDrive(source_drive_key(&job.source_path)));
    }
    pools
}

struct ArbiterState {
    total: HardwarePool,
    accelerators: BTreeMap<AcceleratorFamily, HardwarePool>,
    drives: BTreeMap<String, HardwarePool>,
}

impl ArbiterState {
    fn pool(&self, key: &PoolKey) -> Option<&HardwarePool> {
        match key {
            PoolKey::Total => Some(&self.total),
            PoolKey::Accelerator(family) => self.accelerators.get(family),
            PoolKey::SourceDrive(drive) => self.drives.get(drive),
        }
    }

    /// Get a pool, creating accelerator and drive pools on first use.
    fn pool_mut(&mut self, key: &PoolKey) -> &mut HardwarePool {
        match key {
            PoolKey::Total => &mut self.total,
            PoolKey::Accelerator(family) => self
                .accelerators
                .entry(*family)
                .or_insert_with(|| HardwarePool::new(key.to_string(), family.slot_count())),
            PoolKey::SourceDrive(drive) => self
                .drives
                .entry(drive.clone())
                .or_insert_with(|| HardwarePool::new(key.to_string(), 1)),
        }
    }
}

/// Grants and releases multi-pool leases for jobs.
pub struct HardwareArbiter {
    state: Mutex<ArbiterState>,
}

impl HardwareArbiter {
    /// Create an arbiter whose total pool allows `max_simultaneous_encodes` jobs.
    pub fn new(max_simultaneous_encodes: usize) -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                total: HardwarePool::new(PoolKey::Total.to_string(), max_simultaneous_encodes),
                accelerators: BTreeMap::new(),
                drives: BTreeMap::new(),
            }),
        }
    }

    /// Resize the total pool. Current holders keep their slots.
    pub fn set_max_simultaneous_encodes(&self, slots: usize) {
        let mut state = self.state.lock();
        if state.total.slot_count != slots {
            info!(old = state.total.slot_count, new = slots, "Resizing total encode pool");
            state.total.slot_count = slots;
        }
    }

    /// Try to lease every pool the job needs. Returns false without touching
    /// any pool if one of them is full.
    pub fn try_acquire_slot(&self, job: &EncodeJob) -> bool {
        let pools = required_pools(job);
        let mut state = self.state.lock();

        for key in &pools {
            let available = state.pool(key).map_or(true, HardwarePool::can_acquire_slot);
            if !available {
                if *key != PoolKey::Total {
                    info!(
                        job_id = %job.id,
                        pool = %key,
                        "Hardware pool busy, job must wait"
                    );
                }
                return false;
            }
        }

        for key in &pools {
            state.pool_mut(key).acquire(job.id);
        }
        debug!(job_id = %job.id, pools = pools.len(), "Acquired hardware lease");
        true
    }

    /// Release the lease acquired by [`try_acquire_slot`](Self::try_acquire_slot).
    pub fn release_slot(&self, job: &EncodeJob) {
        let pools = required_pools(job);
        let mut state = self.state.lock();
        for key in &pools {
            let released = state.pool_mut(key).release(job.id);
            if !released {
                warn!(job_id = %job.id, pool = %key, "Released a slot the job did not hold");
            }
        }
    }

    /// Whether the job currently holds its total-pool slot.
    pub fn holds_slot(&self, job: JobId) -> bool {
        self.state.lock().total.holders.contains(&job)
    }

    /// Usage of every pool, total pool first.
    pub fn usage(&self) -> Vec<PoolUsage> {
        let state = self.state.lock();
        std::iter::once(&state.total)
            .chain(state.accelerators.values())
            .chain(state.drives.values())
            .map(|pool| PoolUsage {
                name: pool.name.clone(),
                holders: pool.holder_count(),
                slots: pool.slot_count,
            })
            .collect()
    }

    /// Total number of held slots across every pool.
    pub fn total_holders(&self) -> usize {
        self.usage().iter().map(|u| u.holders).sum()
    }
}
