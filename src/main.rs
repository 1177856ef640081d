use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hotplug_governor::bridge::Bridges;
use hotplug_governor::config::Config;
use hotplug_governor::constants::DEFAULT_CONFIG_PATH;
use hotplug_governor::events::EventSources;
use hotplug_governor::governor::HotplugController;
use hotplug_governor::linux::{EventPoller, SysfsCpu};
use hotplug_governor::load_monitor::LoadAggregator;
use hotplug_governor::load_sampler::LoadSampler;
use hotplug_governor::platform::CoreControl;
use hotplug_governor::status::StatusReporter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hotplug_governor=debug")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)?;

    let cpu = Arc::new(SysfsCpu::new(&config.cpu_root, &config.proc_root));
    let possible = cpu.possible_cores();
    let online = cpu.online_cores();
    info!(%possible, %online, "cpu topology");
    if possible.len() < 2 {
        warn!("a single possible core, hotplug has nothing to do");
    }

    let sampler = Arc::new(LoadSampler::new(cpu.clone(), cpu.clone(), possible, online));
    let aggregator = Arc::new(LoadAggregator::new(sampler.clone()));
    let controller = HotplugController::new(aggregator, cpu.clone(), config.tunables)?;

    let reporter = match config.status_path {
        Some(path) => {
            let (reporter, publisher) = StatusReporter::spawn(path)?;
            controller.set_status_publisher(publisher);
            Some(reporter)
        }
        None => None,
    };

    let sources = EventSources::new();
    let bridges = Bridges::attach(&sources, &sampler, &controller);
    let poller = EventPoller::spawn(cpu.clone(), sources.clone(), config.event_poll_interval)?;
    controller.start(config.startup_delay);
    info!(status = ?controller.status(), "hotplug governor running");

    let (send, mut recv) = watch::channel(false);
    ctrlc::set_handler(move || {
        send.send(true);
    })?;
    while !recv.wait() {}

    info!("shutting down, bringing every core back online");
    poller.stop();
    bridges.detach();
    controller.disable_auto_hotplug();
    controller.shutdown();
    if let Some(reporter) = reporter {
        reporter.stop();
    }
    Ok(())
}
