//! Contracts with the platform the governor runs on.
//!
//! The sampler reads time counters and frequency data through these traits
//! and the controller issues core bring-up/bring-down requests through
//! [`CoreControl`]. `crate::linux` implements them over sysfs/procfs; tests
//! implement them in memory.

use crate::cpu_mask::{CoreId, CoreMask};
use crate::error::Result;

/// Cumulative idle and wall time of one core, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreTimes {
    /// Idle time, I/O wait included.
    pub idle_us: u64,
    pub wall_us: u64,
}

/// Raw per-state busy counters of one core plus the current wall clock,
/// all in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub wall_us: u64,
}

impl RawCpuTimes {
    pub fn busy_us(&self) -> u64 {
        self.user
            .saturating_add(self.system)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
            .saturating_add(self.steal)
            .saturating_add(self.nice)
    }

    /// Idle time derived from the busy counters.
    pub fn idle_us(&self) -> u64 {
        self.wall_us.saturating_sub(self.busy_us())
    }
}

/// Source of monotonic per-core time counters.
pub trait TimeAccounting: Send + Sync {
    /// Preferred idle/wall accounting. `None` means unavailable.
    fn core_times(&self, core: CoreId) -> Option<CoreTimes>;

    /// Raw busy counters used when [`core_times`](Self::core_times) is
    /// unavailable.
    fn raw_cpu_times(&self, core: CoreId) -> Option<RawCpuTimes>;

    /// Cumulative I/O wait time. `None` is treated as zero.
    fn iowait_us(&self, core: CoreId) -> Option<u64>;
}

/// Frequency data of the platform's frequency-scaling policy (kHz).
pub trait FrequencyPolicy: Send + Sync {
    fn max_frequency(&self, core: CoreId) -> Option<u32>;

    fn current_frequency(&self, core: CoreId) -> Option<u32>;

    /// Cores sharing `core`'s frequency domain, `core` included.
    fn domain_siblings(&self, core: CoreId) -> CoreMask;
}

/// Powers cores on and off. Requests are idempotent.
pub trait CoreControl: Send + Sync {
    fn possible_cores(&self) -> CoreMask;

    fn is_online(&self, core: CoreId) -> bool;

    fn request_online(&self, core: CoreId) -> Result<()>;

    fn request_offline(&self, core: CoreId) -> Result<()>;

    fn online_cores(&self) -> CoreMask {
        self.possible_cores()
            .iter()
            .filter(|&core| self.is_online(core))
            .collect()
    }
}
