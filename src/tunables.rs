//! Runtime-tunable parameters and their attribute-style text interface.
//!
//! Every attribute reads as a decimal integer followed by a newline and is
//! written as a decimal integer. Invalid writes are rejected without touching
//! the stored value.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::constants::*;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    ThresholdSingleCore,
    ThresholdMultiCore,
    PollIntervalSingleCore,
    PollIntervalMultiCore,
    AllowedMisses,
    Version,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::ThresholdSingleCore,
        Attribute::ThresholdMultiCore,
        Attribute::PollIntervalSingleCore,
        Attribute::PollIntervalMultiCore,
        Attribute::AllowedMisses,
        Attribute::Version,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::ThresholdSingleCore => "threshold_single_core",
            Attribute::ThresholdMultiCore => "threshold_multi_core",
            Attribute::PollIntervalSingleCore => "poll_interval_single_core",
            Attribute::PollIntervalMultiCore => "poll_interval_multi_core",
            Attribute::AllowedMisses => "allowed_misses",
            Attribute::Version => "version",
        }
    }

    pub fn is_writable(self) -> bool {
        self != Attribute::Version
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.name() == s)
            .ok_or_else(|| Error::UnknownAttribute(s.to_string()))
    }
}

/// Decision parameters of the hotplug controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tunables {
    threshold_single_core: u32,
    threshold_multi_core: u32,
    poll_interval_single_core_ms: u64,
    poll_interval_multi_core_ms: u64,
    allowed_misses: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            threshold_single_core: DEFAULT_THRESHOLD_SINGLE_CORE,
            threshold_multi_core: DEFAULT_THRESHOLD_MULTI_CORE,
            poll_interval_single_core_ms: DEFAULT_POLL_INTERVAL_SINGLE_CORE_MS,
            poll_interval_multi_core_ms: DEFAULT_POLL_INTERVAL_MULTI_CORE_MS,
            allowed_misses: DEFAULT_ALLOWED_MISSES,
        }
    }
}

impl Tunables {
    pub fn threshold_single_core(&self) -> u32 {
        self.threshold_single_core
    }

    pub fn threshold_multi_core(&self) -> u32 {
        self.threshold_multi_core
    }

    pub fn poll_interval_single_core(&self) -> Duration {
        Duration::from_millis(self.poll_interval_single_core_ms)
    }

    pub fn poll_interval_multi_core(&self) -> Duration {
        Duration::from_millis(self.poll_interval_multi_core_ms)
    }

    pub fn allowed_misses(&self) -> u32 {
        self.allowed_misses
    }

    /// Sets the single-core threshold, raising the multi-core threshold to
    /// match if needed.
    pub fn set_threshold_single_core(&mut self, value: u32) -> Result<()> {
        check_percentage(Attribute::ThresholdSingleCore, value)?;
        self.threshold_single_core = value;
        self.threshold_multi_core = self.threshold_multi_core.max(value);
        Ok(())
    }

    /// Sets the multi-core threshold, lowering the single-core threshold to
    /// match if needed.
    pub fn set_threshold_multi_core(&mut self, value: u32) -> Result<()> {
        check_percentage(Attribute::ThresholdMultiCore, value)?;
        self.threshold_multi_core = value;
        self.threshold_single_core = self.threshold_single_core.min(value);
        Ok(())
    }

    pub fn set_poll_interval_single_core(&mut self, interval: Duration) {
        self.poll_interval_single_core_ms = duration_ms(interval);
    }

    pub fn set_poll_interval_multi_core(&mut self, interval: Duration) {
        self.poll_interval_multi_core_ms = duration_ms(interval);
    }

    pub fn set_allowed_misses(&mut self, misses: u32) {
        self.allowed_misses = misses;
    }

    /// Text value of `attr` as exposed to readers.
    pub fn show(&self, attr: Attribute) -> String {
        match attr {
            Attribute::ThresholdSingleCore => format!("{}\n", self.threshold_single_core),
            Attribute::ThresholdMultiCore => format!("{}\n", self.threshold_multi_core),
            Attribute::PollIntervalSingleCore => {
                format!("{}\n", self.poll_interval_single_core_ms)
            }
            Attribute::PollIntervalMultiCore => format!("{}\n", self.poll_interval_multi_core_ms),
            Attribute::AllowedMisses => format!("{}\n", self.allowed_misses),
            Attribute::Version => format!("{VERSION}\n"),
        }
    }

    /// Parses and applies a write to `attr`.
    pub fn store(&mut self, attr: Attribute, input: &str) -> Result<()> {
        if !attr.is_writable() {
            return Err(Error::ReadOnly(attr.name()));
        }
        let value: i64 = input.trim().parse().map_err(|_| Error::InvalidTunable {
            attribute: attr.name(),
            reason: format!("'{}' is not an integer", input.trim()),
        })?;
        if value < 0 {
            return Err(Error::InvalidTunable {
                attribute: attr.name(),
                reason: "must not be negative".to_string(),
            });
        }
        let as_u32 = || {
            u32::try_from(value).map_err(|_| Error::InvalidTunable {
                attribute: attr.name(),
                reason: format!("cannot be greater than {}", u32::MAX),
            })
        };
        match attr {
            Attribute::ThresholdSingleCore => self.set_threshold_single_core(as_u32()?)?,
            Attribute::ThresholdMultiCore => self.set_threshold_multi_core(as_u32()?)?,
            Attribute::PollIntervalSingleCore => self.poll_interval_single_core_ms = value as u64,
            Attribute::PollIntervalMultiCore => self.poll_interval_multi_core_ms = value as u64,
            Attribute::AllowedMisses => self.allowed_misses = as_u32()?,
            Attribute::Version => {}
        }
        Ok(())
    }
}

fn check_percentage(attr: Attribute, value: u32) -> Result<()> {
    if value > 100 {
        return Err(Error::InvalidTunable {
            attribute: attr.name(),
            reason: "must be between 0 and 100".to_string(),
        });
    }
    Ok(())
}

fn duration_ms(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let t = Tunables::default();
        assert_eq!(t.threshold_single_core(), 40);
        assert_eq!(t.threshold_multi_core(), 60);
        assert_eq!(t.poll_interval_single_core(), Duration::from_millis(100));
        assert_eq!(t.poll_interval_multi_core(), Duration::from_millis(1000));
        assert_eq!(t.allowed_misses(), 1);
    }

    #[test]
    fn raising_single_threshold_drags_multi_along() {
        let mut t = Tunables::default();
        t.store(Attribute::ThresholdSingleCore, "80\n").unwrap();
        assert_eq!(t.threshold_single_core(), 80);
        assert_eq!(t.threshold_multi_core(), 80);
    }

    #[test]
    fn lowering_multi_threshold_drags_single_along() {
        let mut t = Tunables::default();
        t.store(Attribute::ThresholdMultiCore, "30").unwrap();
        assert_eq!(t.threshold_multi_core(), 30);
        assert_eq!(t.threshold_single_core(), 30);
    }

    #[test]
    fn invalid_writes_leave_value_unchanged() {
        let mut t = Tunables::default();
        for input in ["abc", "101", "-1", "", "4 0"] {
            assert!(t.store(Attribute::ThresholdSingleCore, input).is_err(), "{input:?}");
        }
        assert!(t.store(Attribute::AllowedMisses, "-3").is_err());
        assert!(t.store(Attribute::PollIntervalMultiCore, "soon").is_err());
        assert_eq!(t, Tunables::default());
    }

    #[test]
    fn version_is_read_only() {
        let mut t = Tunables::default();
        assert!(matches!(
            t.store(Attribute::Version, "2"),
            Err(Error::ReadOnly("version"))
        ));
        assert_eq!(t.show(Attribute::Version), "1\n");
    }

    #[test]
    fn show_and_store_round_trip_through_names() {
        let mut t = Tunables::default();
        let attr: Attribute = "poll_interval_single_core".parse().unwrap();
        t.store(attr, "250").unwrap();
        assert_eq!(t.show(attr), "250\n");
        assert_eq!(t.poll_interval_single_core(), Duration::from_millis(250));
        assert!("threshold".parse::<Attribute>().is_err());
    }

    #[test]
    fn zero_values_are_accepted() {
        let mut t = Tunables::default();
        t.store(Attribute::AllowedMisses, "0").unwrap();
        t.store(Attribute::PollIntervalSingleCore, "0").unwrap();
        t.store(Attribute::ThresholdSingleCore, "0").unwrap();
        assert_eq!(t.allowed_misses(), 0);
        assert_eq!(t.poll_interval_single_core(), Duration::ZERO);
        assert_eq!(t.threshold_single_core(), 0);
    }
}
