//! Subscriptions tying the event streams to the sampler and the controller.
//!
//! Each bridge owns its [`Subscription`]; dropping the bridge deregisters
//! the handler.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::events::{
    EventBus, EventSources, FrequencyChange, PowerTransition, Subscription, TopologyChange,
};
use crate::governor::HotplugController;
use crate::load_sampler::LoadSampler;

/// Closes the windows of a frequency domain under the frequency they ran at
/// before recording the new one.
pub struct FrequencyEventBridge {
    _subscription: Subscription,
}

impl FrequencyEventBridge {
    pub fn attach(bus: &Arc<EventBus<FrequencyChange>>, sampler: Arc<LoadSampler>) -> Self {
        let subscription = bus.subscribe(move |event: &FrequencyChange| {
            sampler.frequency_changed(event.core, event.old_freq, event.new_freq);
        });
        Self {
            _subscription: subscription,
        }
    }
}

/// Reinitializes sampler slots of cores coming online and excludes cores
/// going offline.
pub struct TopologyEventBridge {
    _subscription: Subscription,
}

impl TopologyEventBridge {
    pub fn attach(bus: &Arc<EventBus<TopologyChange>>, sampler: Arc<LoadSampler>) -> Self {
        let subscription = bus.subscribe(move |event: &TopologyChange| match *event {
            TopologyChange::Online(core) => {
                debug!(core, "sampler slot reinitialized");
                sampler.core_online(core);
            }
            TopologyChange::Offline(core) => sampler.core_offline(core),
        });
        Self {
            _subscription: subscription,
        }
    }
}

/// Freezes the controller in single-core mode across system suspend.
pub struct SuspendGate {
    _subscription: Subscription,
}

impl SuspendGate {
    pub fn attach(
        bus: &Arc<EventBus<PowerTransition>>,
        controller: &Arc<HotplugController>,
    ) -> Self {
        let controller: Weak<HotplugController> = Arc::downgrade(controller);
        let subscription = bus.subscribe(move |event: &PowerTransition| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            match event {
                PowerTransition::EnteringSuspend => controller.suspend(),
                PowerTransition::Resumed => controller.resume(),
            }
        });
        Self {
            _subscription: subscription,
        }
    }
}

/// Every subscription the governor holds.
pub struct Bridges {
    pub frequency: FrequencyEventBridge,
    pub topology: TopologyEventBridge,
    pub suspend: SuspendGate,
}

impl Bridges {
    pub fn attach(
        sources: &EventSources,
        sampler: &Arc<LoadSampler>,
        controller: &Arc<HotplugController>,
    ) -> Self {
        info!("event bridges attached");
        Self {
            frequency: FrequencyEventBridge::attach(&sources.frequency, sampler.clone()),
            topology: TopologyEventBridge::attach(&sources.topology, sampler.clone()),
            suspend: SuspendGate::attach(&sources.power, controller),
        }
    }

    /// Deregisters every handler.
    pub fn detach(self) {
        debug!("event bridges detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_mask::CoreMask;
    use crate::governor::HotplugMode;
    use crate::governor::tests::{FakeCores, ScriptedLoad};
    use crate::load_sampler::tests::FakeCpu;
    use crate::platform::CoreControl;
    use crate::tunables::Tunables;
    use std::time::Duration;

    fn sampler(cpu: &Arc<FakeCpu>, cores: usize) -> Arc<LoadSampler> {
        for core in 0..cores {
            cpu.advance(core, 0, 0);
        }
        Arc::new(LoadSampler::new(
            cpu.clone(),
            cpu.clone(),
            CoreMask::first(cores),
            CoreMask::first(cores),
        ))
    }

    #[test]
    fn frequency_event_updates_every_sibling() {
        let cpu = Arc::new(FakeCpu::new(2000));
        *cpu.domains.lock().unwrap() = vec![CoreMask::first(2), "2-3".parse().unwrap()];
        let sampler = sampler(&cpu, 4);
        let sources = EventSources::new();
        let _bridge = FrequencyEventBridge::attach(&sources.frequency, sampler.clone());

        cpu.advance(0, 1000, 500);
        cpu.advance(1, 1000, 1000);
        sources.frequency.publish(&FrequencyChange {
            core: 1,
            old_freq: 1000,
            new_freq: 1500,
        });

        for core in 0..2 {
            assert_eq!(sampler.snapshot(core).unwrap().current_frequency(), 1500);
        }
        for core in 2..4 {
            assert_eq!(sampler.snapshot(core).unwrap().current_frequency(), 2000);
        }
        // windows closed under the old frequency
        assert_eq!(sampler.current_average(0), 25);
        assert_eq!(sampler.current_average(1), 50);
    }

    #[test]
    fn topology_events_toggle_aggregation() {
        let cpu = Arc::new(FakeCpu::new(1000));
        let sampler = sampler(&cpu, 2);
        let sources = EventSources::new();
        let _bridge = TopologyEventBridge::attach(&sources.topology, sampler.clone());

        sources.topology.publish(&TopologyChange::Offline(1));
        assert_eq!(sampler.online_cores(), CoreMask::single(0));

        cpu.advance(1, 1000, 1000);
        sampler.update_sample(1, 1000);
        sources.topology.publish(&TopologyChange::Online(1));
        assert_eq!(sampler.online_cores(), CoreMask::first(2));
        assert_eq!(sampler.current_average(1), 0);
        assert_eq!(sampler.snapshot(1).unwrap().window_size(), 0);
    }

    #[test]
    fn suspend_gate_drives_controller() {
        let load = Arc::new(ScriptedLoad::default());
        let cores = Arc::new(FakeCores::new(4));
        let mut tunables = Tunables::default();
        tunables.set_poll_interval_multi_core(Duration::from_secs(60));
        tunables.set_poll_interval_single_core(Duration::from_secs(60));
        let controller = HotplugController::new(load, cores.clone(), tunables).unwrap();
        let sources = EventSources::new();
        let _gate = SuspendGate::attach(&sources.power, &controller);

        sources.power.publish(&PowerTransition::EnteringSuspend);
        assert!(controller.is_suspended());
        assert_eq!(controller.mode(), HotplugMode::SingleCore);
        assert_eq!(cores.online_cores(), CoreMask::single(0));

        sources.power.publish(&PowerTransition::Resumed);
        assert!(!controller.is_suspended());
        assert_eq!(controller.mode(), HotplugMode::MultiCore);
        assert_eq!(cores.online_cores(), CoreMask::first(4));
        controller.shutdown();
    }

    #[test]
    fn detach_deregisters_every_handler() {
        let cpu = Arc::new(FakeCpu::new(1000));
        let sampler = sampler(&cpu, 1);
        let controller = HotplugController::new(
            Arc::new(ScriptedLoad::default()),
            Arc::new(FakeCores::new(1)),
            Tunables::default(),
        )
        .unwrap();
        let sources = EventSources::new();

        let bridges = Bridges::attach(&sources, &sampler, &controller);
        assert_eq!(sources.frequency.subscriber_count(), 1);
        assert_eq!(sources.topology.subscriber_count(), 1);
        assert_eq!(sources.power.subscriber_count(), 1);

        bridges.detach();
        assert_eq!(sources.frequency.subscriber_count(), 0);
        assert_eq!(sources.topology.subscriber_count(), 0);
        assert_eq!(sources.power.subscriber_count(), 0);
        controller.shutdown();
    }
}
