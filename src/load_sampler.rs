//! Per-core load estimation normalized to maximum frequency.
//!
//! Every core owns a [`CoreLoadState`] slot guarding the last-seen time
//! counters and a time-weighted running average of its load rescaled to the
//! core's maximum frequency. A window accumulates samples until the
//! aggregator reads and clears it (see `crate::load_monitor`).
//!
//! Slots are allocated once for every possible core. Going offline only
//! flips a flag; coming back online reinitializes the slot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::cpu_mask::{CoreId, CoreMask};
use crate::platform::{CoreTimes, FrequencyPolicy, TimeAccounting};

/// Cumulative counters of one core at one instant, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterReading {
    pub idle_us: u64,
    pub wall_us: u64,
    pub iowait_us: u64,
}

/// Sampler state of a single core.
#[derive(Debug, Clone, Default)]
pub struct CoreLoadState {
    prev_idle_us: u64,
    prev_wall_us: u64,
    prev_iowait_us: u64,
    avg_load_at_max_freq: u32,
    window_size: u64,
    cur_freq: u32,
    max_freq: u32,
    siblings: CoreMask,
}

impl CoreLoadState {
    pub fn new(max_freq: u32, cur_freq: u32, siblings: CoreMask) -> Self {
        Self {
            max_freq,
            cur_freq,
            siblings,
            ..Self::default()
        }
    }

    /// Closes the interval since the previous reading and merges it into the
    /// window, attributing it to `freq`.
    ///
    /// Returns the interval's load-at-max-frequency, or `None` when the
    /// interval was discarded because of counter skew.
    pub fn record(&mut self, now: CounterReading, freq: u32) -> Option<u32> {
        let wall_time = now.wall_us.saturating_sub(self.prev_wall_us);
        self.prev_wall_us = now.wall_us;

        let mut idle_time = now.idle_us.saturating_sub(self.prev_idle_us);
        self.prev_idle_us = now.idle_us;

        let iowait_time = now.iowait_us.saturating_sub(self.prev_iowait_us);
        self.prev_iowait_us = now.iowait_us;

        // A core waiting on I/O is not idle.
        if idle_time >= iowait_time {
            idle_time -= iowait_time;
        }

        if wall_time == 0 || wall_time < idle_time {
            return None;
        }

        let cur_load = 100 * (wall_time - idle_time) / wall_time;
        let load_at_max_freq = if self.max_freq == 0 {
            cur_load
        } else {
            cur_load * u64::from(freq) / u64::from(self.max_freq)
        };

        if self.avg_load_at_max_freq == 0 {
            self.avg_load_at_max_freq = load_at_max_freq as u32;
            self.window_size = wall_time;
        } else {
            let weighted = u64::from(self.avg_load_at_max_freq) * self.window_size
                + load_at_max_freq * wall_time;
            self.avg_load_at_max_freq = (weighted / (self.window_size + wall_time)) as u32;
            self.window_size += wall_time;
        }
        // An empty average carries no window.
        if self.avg_load_at_max_freq == 0 {
            self.window_size = 0;
        }

        Some(load_at_max_freq as u32)
    }

    /// Stores `now` as the previous reading without sampling.
    pub fn prime(&mut self, now: CounterReading) {
        self.prev_idle_us = now.idle_us;
        self.prev_wall_us = now.wall_us;
        self.prev_iowait_us = now.iowait_us;
    }

    /// Returns the window's average and starts a new window.
    pub fn take_average(&mut self) -> u32 {
        let avg = self.avg_load_at_max_freq;
        self.avg_load_at_max_freq = 0;
        self.window_size = 0;
        avg
    }

    pub fn average(&self) -> u32 {
        self.avg_load_at_max_freq
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn current_frequency(&self) -> u32 {
        self.cur_freq
    }

    pub fn siblings(&self) -> CoreMask {
        self.siblings
    }
}

struct CoreSlot {
    online: bool,
    state: CoreLoadState,
}

/// Arena of per-core sampler slots indexed by [`CoreId`].
pub struct LoadSampler {
    slots: Vec<Mutex<CoreSlot>>,
    accounting: Arc<dyn TimeAccounting>,
    frequency: Arc<dyn FrequencyPolicy>,
}

impl LoadSampler {
    /// Allocates a slot for every possible core and primes the counters of
    /// the online ones.
    pub fn new(
        accounting: Arc<dyn TimeAccounting>,
        frequency: Arc<dyn FrequencyPolicy>,
        possible: CoreMask,
        online: CoreMask,
    ) -> Self {
        let slots = (0..possible.span())
            .map(|core| {
                let is_online = possible.contains(core) && online.contains(core);
                let cur_freq = if is_online {
                    frequency.current_frequency(core).unwrap_or(0)
                } else {
                    0
                };
                let mut siblings = frequency.domain_siblings(core);
                siblings.insert(core);
                let mut state = CoreLoadState::new(
                    frequency.max_frequency(core).unwrap_or(0),
                    cur_freq,
                    siblings,
                );
                if is_online && let Some(now) = read_counters(accounting.as_ref(), core) {
                    state.prime(now);
                }
                Mutex::new(CoreSlot {
                    online: is_online,
                    state,
                })
            })
            .collect();

        Self {
            slots,
            accounting,
            frequency,
        }
    }

    fn slot(&self, core: CoreId) -> Option<MutexGuard<'_, CoreSlot>> {
        self.slots
            .get(core)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn sample_locked(&self, core: CoreId, slot: &mut CoreSlot, freq: u32) -> Option<u32> {
        let Some(now) = read_counters(self.accounting.as_ref(), core) else {
            trace!(core, "time counters unavailable, sample skipped");
            return None;
        };
        let load = slot.state.record(now, freq);
        if load.is_none() {
            trace!(core, "counter skew, sample discarded");
        }
        load
    }

    /// Closes the current interval of `core` under `freq`.
    pub fn update_sample(&self, core: CoreId, freq: u32) -> Option<u32> {
        let mut slot = self.slot(core)?;
        self.sample_locked(core, &mut slot, freq)
    }

    /// Average of the current window, without mutation.
    pub fn current_average(&self, core: CoreId) -> u32 {
        self.slot(core).map_or(0, |slot| slot.state.average())
    }

    /// Samples `core` at its current frequency, then reads and clears its
    /// window. `None` for offline or unknown cores.
    pub fn take_window(&self, core: CoreId) -> Option<u32> {
        let mut slot = self.slot(core)?;
        if !slot.online {
            return None;
        }
        let freq = slot.state.current_frequency();
        self.sample_locked(core, &mut slot, freq);
        Some(slot.state.take_average())
    }

    /// Closes the window of every core in `core`'s frequency domain under
    /// `old_freq`, then records `new_freq` for each of them.
    pub fn frequency_changed(&self, core: CoreId, old_freq: u32, new_freq: u32) {
        let Some(siblings) = self.slot(core).map(|slot| slot.state.siblings()) else {
            return;
        };
        for sibling in siblings.iter() {
            let Some(mut slot) = self.slot(sibling) else {
                continue;
            };
            if slot.online {
                self.sample_locked(sibling, &mut slot, old_freq);
            }
            slot.state.cur_freq = new_freq;
        }
        trace!(core, %siblings, old_freq, new_freq, "frequency domain updated");
    }

    /// Reinitializes the slot of a core that came online.
    pub fn core_online(&self, core: CoreId) {
        let Some(mut slot) = self.slot(core) else {
            debug!(core, "online event for unknown core ignored");
            return;
        };
        slot.online = true;
        if slot.state.cur_freq == 0 {
            slot.state.cur_freq = self.frequency.current_frequency(core).unwrap_or(0);
        }
        if slot.state.max_freq == 0 {
            slot.state.max_freq = self.frequency.max_frequency(core).unwrap_or(0);
        }
        // the policy of a core that was offline at startup may have been unreadable
        let mut siblings = self.frequency.domain_siblings(core);
        siblings.insert(core);
        slot.state.siblings = siblings;
        slot.state.take_average();
        if let Some(now) = read_counters(self.accounting.as_ref(), core) {
            slot.state.prime(now);
        }
    }

    /// Excludes an offline core from aggregation.
    pub fn core_offline(&self, core: CoreId) {
        if let Some(mut slot) = self.slot(core) {
            slot.online = false;
        }
    }

    pub fn online_cores(&self) -> CoreMask {
        (0..self.slots.len())
            .filter(|&core| self.slot(core).is_some_and(|slot| slot.online))
            .collect()
    }

    /// Copy of a core's sampler state.
    pub fn snapshot(&self, core: CoreId) -> Option<CoreLoadState> {
        self.slot(core).map(|slot| slot.state.clone())
    }

    pub fn core_count(&self) -> usize {
        self.slots.len()
    }
}

/// Reads the current counters of `core`, falling back to the raw busy
/// counters when the preferred accounting is unavailable.
fn read_counters(accounting: &dyn TimeAccounting, core: CoreId) -> Option<CounterReading> {
    let times = accounting.core_times(core).or_else(|| {
        accounting.raw_cpu_times(core).map(|raw| CoreTimes {
            idle_us: raw.idle_us(),
            wall_us: raw.wall_us,
        })
    })?;
    Some(CounterReading {
        idle_us: times.idle_us,
        wall_us: times.wall_us,
        iowait_us: accounting.iowait_us(core).unwrap_or(0),
    })
}
