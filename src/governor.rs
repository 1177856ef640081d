use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::PRIMARY_CORE;
use crate::error::{Error, Result};
use crate::load_monitor::LoadSource;
use crate::platform::CoreControl;
use crate::status::StatusPublisher;
use crate::timer::DelayedWork;
use crate::tunables::{Attribute, Tunables};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotplugMode {
    SingleCore, // only the primary core online
    MultiCore,  // every possible core online
}

/// Decision state of the controller.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub mode: HotplugMode,
    pub miss_count: u32,
    pub tunables: Tunables,
    pub suspended: bool,
    pub disabled: bool,
    pub last_load: Option<u32>,
}

impl ControllerState {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            mode: HotplugMode::MultiCore,
            miss_count: 0,
            tunables,
            suspended: false,
            disabled: false,
            last_load: None,
        }
    }

    /// Feeds one load reading into the hysteresis and returns the mode to
    /// switch to, if any.
    ///
    /// Going up needs `allowed_misses + 1` net readings above the multi-core
    /// threshold; going down happens on the first reading below the
    /// single-core threshold.
    pub fn evaluate(&mut self, load: u32) -> Option<HotplugMode> {
        match self.mode {
            HotplugMode::SingleCore => {
                if load > self.tunables.threshold_multi_core() {
                    self.miss_count += 1;
                    if self.miss_count > self.tunables.allowed_misses() {
                        return Some(HotplugMode::MultiCore);
                    }
                } else if self.miss_count > 0 {
                    self.miss_count -= 1;
                }
            }
            HotplugMode::MultiCore => {
                if load < self.tunables.threshold_single_core() {
                    return Some(HotplugMode::SingleCore);
                }
            }
        }
        None
    }

    /// Delay until the next decision in the current mode.
    pub fn poll_interval(&self) -> Duration {
        match self.mode {
            HotplugMode::SingleCore => self.tunables.poll_interval_single_core(),
            HotplugMode::MultiCore => self.tunables.poll_interval_multi_core(),
        }
    }
}

/// Snapshot of the controller published after every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub mode: HotplugMode,
    pub load: Option<u32>,
    pub miss_count: u32,
    pub suspended: bool,
    pub disabled: bool,
    pub online_cores: String,
    pub tunables: Tunables,
}

/// Periodic hotplug decision loop.
///
/// A delayed work item calls [`tick`](Self::tick), which samples the system
/// load, updates the hysteresis, requests core transitions and re-arms
/// itself after the poll interval of the resulting mode.
pub struct HotplugController {
    state: Mutex<ControllerState>,
    load: Arc<dyn LoadSource>,
    cores: Arc<dyn CoreControl>,
    status: Mutex<Option<StatusPublisher>>,
    work: DelayedWork,
}

impl HotplugController {
    pub fn new(
        load: Arc<dyn LoadSource>,
        cores: Arc<dyn CoreControl>,
        tunables: Tunables,
    ) -> Result<Arc<Self>> {
        let target: Arc<OnceLock<Weak<HotplugController>>> = Arc::default();
        let hook = target.clone();
        let work = DelayedWork::spawn("hotplug-decide", move || {
            if let Some(controller) = hook.get().and_then(Weak::upgrade) {
                controller.tick();
            }
        })
        .map_err(|source| Error::Spawn {
            name: "hotplug-decide",
            source,
        })?;

        let controller = Arc::new(Self {
            state: Mutex::new(ControllerState::new(tunables)),
            load,
            cores,
            status: Mutex::new(None),
            work,
        });
        let _ = target.set(Arc::downgrade(&controller));
        Ok(controller)
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status_publisher(&self, publisher: StatusPublisher) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(publisher);
    }

    /// Brings every core up and arms the first decision after `delay`.
    pub fn start(&self, delay: Duration) {
        let mut state = self.lock();
        self.enter_multi_core(&mut state);
        info!(delay_ms = delay.as_millis() as u64, "hotplug controller started");
        self.work.schedule(delay);
        self.publish(&state);
    }

    /// One decision step.
    pub fn tick(&self) {
        let mut state = self.lock();
        let load = self.load.sample_all();

        if state.suspended || state.disabled {
            debug!(load, "decision skipped while suspended or disabled");
            return;
        }
        state.last_load = Some(load);

        match state.evaluate(load) {
            Some(HotplugMode::MultiCore) => {
                info!(load, misses = state.miss_count, "load sustained, going multi-core");
                self.enter_multi_core(&mut state);
            }
            Some(HotplugMode::SingleCore) => {
                info!(load, "load dropped, going single-core");
                self.enter_single_core(&mut state);
            }
            None => {}
        }
        debug!(load, mode = ?state.mode, misses = state.miss_count, "hotplug decision");

        self.work.schedule(state.poll_interval());
        self.publish(&state);
    }

    /// Forces single-core mode and freezes the loop until [`resume`](Self::resume).
    /// Returns once any in-flight decision has completed.
    pub fn suspend(&self) {
        self.work.cancel_sync();
        let mut state = self.lock();
        self.enter_single_core(&mut state);
        state.suspended = true;
        info!("suspending, hotplug frozen in single-core mode");
        self.publish(&state);
    }

    /// Forces multi-core mode and re-arms the loop.
    pub fn resume(&self) {
        let mut state = self.lock();
        self.enter_multi_core(&mut state);
        state.suspended = false;
        if !state.disabled {
            self.work.schedule(state.tunables.poll_interval_multi_core());
        }
        info!("resumed, hotplug back in multi-core mode");
        self.publish(&state);
    }

    /// Halts the loop with every core online until
    /// [`enable_auto_hotplug`](Self::enable_auto_hotplug) is called.
    pub fn disable_auto_hotplug(&self) {
        self.work.cancel_sync();
        let mut state = self.lock();
        state.disabled = true;
        self.enter_multi_core(&mut state);
        info!("automatic hotplug disabled");
        self.publish(&state);
    }

    pub fn enable_auto_hotplug(&self) {
        let mut state = self.lock();
        if !state.disabled {
            return;
        }
        state.disabled = false;
        if !state.suspended {
            self.work.schedule(state.tunables.poll_interval_multi_core());
        }
        info!("automatic hotplug enabled");
        self.publish(&state);
    }

    pub fn read_attribute(&self, attr: Attribute) -> String {
        self.lock().tunables.show(attr)
    }

    /// Applies an attribute write. Rejected writes are logged and leave the
    /// stored value unchanged; returns whether the write was applied.
    pub fn write_attribute(&self, attr: Attribute, input: &str) -> bool {
        let mut state = self.lock();
        match state.tunables.store(attr, input) {
            Ok(()) => {
                debug!(%attr, value = input.trim(), "tunable updated");
                self.publish(&state);
                true
            }
            Err(e) => {
                warn!(%attr, error = %e, "invalid input ignored");
                false
            }
        }
    }

    pub fn mode(&self) -> HotplugMode {
        self.lock().mode
    }

    pub fn miss_count(&self) -> u32 {
        self.lock().miss_count
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn is_scheduled(&self) -> bool {
        self.work.is_pending()
    }

    pub fn status(&self) -> ControllerStatus {
        self.snapshot(&self.lock())
    }

    /// Stops the decision thread. The cores are left as they are.
    pub fn shutdown(&self) {
        self.work.shutdown();
    }

    fn enter_single_core(&self, state: &mut ControllerState) {
        for core in self.cores.online_cores().iter() {
            if core == PRIMARY_CORE {
                continue;
            }
            if let Err(e) = self.cores.request_offline(core) {
                warn!(core, error = %e, "failed to take core offline");
            }
        }
        state.mode = HotplugMode::SingleCore;
        state.miss_count = 0;
    }

    fn enter_multi_core(&self, state: &mut ControllerState) {
        for core in self.cores.possible_cores().iter() {
            if core == PRIMARY_CORE || self.cores.is_online(core) {
                continue;
            }
            if let Err(e) = self.cores.request_online(core) {
                warn!(core, error = %e, "failed to bring core online");
            }
        }
        state.mode = HotplugMode::MultiCore;
        state.miss_count = 0;
    }

    fn snapshot(&self, state: &ControllerState) -> ControllerStatus {
        ControllerStatus {
            mode: state.mode,
            load: state.last_load,
            miss_count: state.miss_count,
            suspended: state.suspended,
            disabled: state.disabled,
            online_cores: self.cores.online_cores().to_string(),
            tunables: state.tunables,
        }
    }

    fn publish(&self, state: &ControllerState) {
        let status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(publisher) = status.as_ref() {
            publisher.publish(self.snapshot(state));
        }
    }
}
