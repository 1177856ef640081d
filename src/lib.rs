// Public modules
pub mod bridge;
pub mod config;
pub mod cpu_mask;
pub mod error;
pub mod events;
pub mod governor;
pub mod linux;
pub mod load_monitor;
pub mod load_sampler;
pub mod platform;
pub mod status;
pub mod timer;
pub mod tunables;

pub use error::{Error, Result};

// Re-export constants commonly used
pub mod constants {
    pub const MAX_CORES: usize = 64;
    pub const PRIMARY_CORE: usize = 0;

    pub const DEFAULT_THRESHOLD_SINGLE_CORE: u32 = 40;
    pub const DEFAULT_THRESHOLD_MULTI_CORE: u32 = 60;
    pub const DEFAULT_POLL_INTERVAL_SINGLE_CORE_MS: u64 = 100;
    pub const DEFAULT_POLL_INTERVAL_MULTI_CORE_MS: u64 = 1000;
    pub const DEFAULT_ALLOWED_MISSES: u32 = 1;
    pub const VERSION: u32 = 1;

    pub const STARTUP_DELAY_MS: u64 = 60_000;
    pub const DEFAULT_EVENT_POLL_MS: u64 = 50;

    pub const DEFAULT_CONFIG_PATH: &str = "/etc/hotplug-governor/config.toml";
    pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
    pub const PROC_ROOT: &str = "/proc";
}
