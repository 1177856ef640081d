//! Daemon configuration.
//!
//! Every field is optional. A missing or invalid field is replaced by its
//! default and the substitution is logged; only a file that is not TOML at
//! all is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};
use tracing::warn;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::status::default_status_path;
use crate::tunables::Tunables;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tunables: Tunables,
    pub startup_delay: Duration,
    pub event_poll_interval: Duration,
    pub status_path: Option<PathBuf>,
    pub cpu_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            startup_delay: Duration::from_millis(STARTUP_DELAY_MS),
            event_poll_interval: Duration::from_millis(DEFAULT_EVENT_POLL_MS),
            status_path: Some(default_status_path()),
            cpu_root: PathBuf::from(SYSFS_CPU_ROOT),
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config = text
            .parse::<Table>()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut parsed = Self::default();

        let thresholds = config.get("thresholds").and_then(Value::as_table);
        let multi = percentage(thresholds, "multi-core").unwrap_or_else(replaced(
            "thresholds.multi-core",
            DEFAULT_THRESHOLD_MULTI_CORE,
        ));
        let single = percentage(thresholds, "single-core").unwrap_or_else(replaced(
            "thresholds.single-core",
            DEFAULT_THRESHOLD_SINGLE_CORE.min(multi),
        ));
        if single > multi {
            warn!(single, multi, "single-core threshold above multi-core, raising multi-core");
        }
        parsed.tunables.set_threshold_multi_core(multi)?;
        parsed.tunables.set_threshold_single_core(single)?;

        let intervals = config.get("intervals").and_then(Value::as_table);
        let single_poll = millis(intervals, "single-core").unwrap_or_else(replaced(
            "intervals.single-core",
            DEFAULT_POLL_INTERVAL_SINGLE_CORE_MS,
        ));
        parsed
            .tunables
            .set_poll_interval_single_core(Duration::from_millis(single_poll));
        let multi_poll = millis(intervals, "multi-core").unwrap_or_else(replaced(
            "intervals.multi-core",
            DEFAULT_POLL_INTERVAL_MULTI_CORE_MS,
        ));
        parsed
            .tunables
            .set_poll_interval_multi_core(Duration::from_millis(multi_poll));
        parsed.startup_delay = Duration::from_millis(
            millis(intervals, "startup-delay")
                .unwrap_or_else(replaced("intervals.startup-delay", STARTUP_DELAY_MS)),
        );
        parsed.event_poll_interval = Duration::from_millis(
            millis(intervals, "event-poll")
                .and_then(|v| {
                    (v > 0)
                        .then_some(v)
                        .ok_or_else(|| "must be positive".to_string())
                })
                .unwrap_or_else(replaced("intervals.event-poll", DEFAULT_EVENT_POLL_MS)),
        );

        let misses = non_negative(config.get("allowed-misses"))
            .and_then(|v| {
                u32::try_from(v).map_err(|_| format!("cannot be greater than {}", u32::MAX))
            })
            .unwrap_or_else(replaced("allowed-misses", DEFAULT_ALLOWED_MISSES));
        parsed.tunables.set_allowed_misses(misses);

        if let Some(status) = config.get("status").and_then(Value::as_table) {
            match status.get("enabled").map(|v| v.as_bool()) {
                Some(Some(false)) => parsed.status_path = None,
                Some(None) => warn!("status.enabled must be a boolean, ignored"),
                _ => {}
            }
            if parsed.status_path.is_some() {
                match status.get("path").map(Value::as_str) {
                    Some(Some(path)) => parsed.status_path = Some(PathBuf::from(path)),
                    Some(None) => warn!("status.path must be a string, using the default location"),
                    None => {}
                }
            }
        }

        let sysfs = config.get("sysfs").and_then(Value::as_table);
        if let Some(root) = path_field(sysfs, "cpu-root") {
            parsed.cpu_root = root;
        }
        if let Some(root) = path_field(sysfs, "proc-root") {
            parsed.proc_root = root;
        }

        Ok(parsed)
    }
}

/// Fallback for an invalid field: logs why and yields `default`.
fn replaced<T: Copy + std::fmt::Display>(
    field: &'static str,
    default: T,
) -> impl FnOnce(String) -> T {
    move |reason| {
        warn!(field, %reason, %default, "invalid value, replaced with the default");
        default
    }
}

fn non_negative(value: Option<&Value>) -> std::result::Result<i64, String> {
    value
        .ok_or("is missing")?
        .as_integer()
        .ok_or("must be an integer")
        .and_then(|v| (!v.is_negative()).then_some(v).ok_or("must not be negative"))
        .map_err(str::to_string)
}

fn percentage(table: Option<&Table>, key: &str) -> std::result::Result<u32, String> {
    non_negative(table.and_then(|t| t.get(key))).and_then(|v| {
        (v <= 100)
            .then_some(v as u32)
            .ok_or_else(|| "must be between 0 and 100".to_string())
    })
}

fn millis(table: Option<&Table>, key: &str) -> std::result::Result<u64, String> {
    non_negative(table.and_then(|t| t.get(key))).map(|v| v as u64)
}

fn path_field(table: Option<&Table>, key: &str) -> Option<PathBuf> {
    match table?.get(key)?.as_str() {
        Some(path) => Some(PathBuf::from(path)),
        None => {
            warn!("sysfs.{key} must be a string, ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn reads_every_section() {
        let config = Config::parse(
            r#"
            allowed-misses = 3

            [thresholds]
            single-core = 25
            multi-core = 75

            [intervals]
            single-core = 50
            multi-core = 500
            startup-delay = 0
            event-poll = 20

            [status]
            path = "/tmp/hotplug.json"

            [sysfs]
            cpu-root = "/tmp/cpu"
            proc-root = "/tmp/proc"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunables.threshold_single_core(), 25);
        assert_eq!(config.tunables.threshold_multi_core(), 75);
        assert_eq!(config.tunables.allowed_misses(), 3);
        assert_eq!(config.tunables.poll_interval_single_core(), Duration::from_millis(50));
        assert_eq!(config.tunables.poll_interval_multi_core(), Duration::from_millis(500));
        assert_eq!(config.startup_delay, Duration::ZERO);
        assert_eq!(config.event_poll_interval, Duration::from_millis(20));
        assert_eq!(config.status_path, Some(PathBuf::from("/tmp/hotplug.json")));
        assert_eq!(config.cpu_root, PathBuf::from("/tmp/cpu"));
        assert_eq!(config.proc_root, PathBuf::from("/tmp/proc"));
    }

    #[test]
    fn invalid_fields_fall_back_to_defaults() {
        let config = Config::parse(
            r#"
            allowed-misses = -1
            [thresholds]
            single-core = 140
            multi-core = "high"
            [intervals]
            event-poll = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.tunables, Tunables::default());
        assert_eq!(config.event_poll_interval, Duration::from_millis(DEFAULT_EVENT_POLL_MS));
    }

    #[test]
    fn inverted_thresholds_are_clamped() {
        let config = Config::parse(
            r#"
            [thresholds]
            single-core = 70
            multi-core = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.tunables.threshold_single_core(), 70);
        assert_eq!(config.tunables.threshold_multi_core(), 70);
    }

    #[test]
    fn status_can_be_disabled() {
        let config = Config::parse("[status]\nenabled = false\n").unwrap();
        assert_eq!(config.status_path, None);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(matches!(Config::parse("thresholds = ["), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
