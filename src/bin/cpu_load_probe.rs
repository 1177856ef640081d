use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use hotplug_governor::bridge::{FrequencyEventBridge, TopologyEventBridge};
use hotplug_governor::constants::{DEFAULT_EVENT_POLL_MS, PROC_ROOT, SYSFS_CPU_ROOT};
use hotplug_governor::events::EventSources;
use hotplug_governor::linux::{EventPoller, SysfsCpu};
use hotplug_governor::load_monitor::{LoadAggregator, LoadSource};
use hotplug_governor::load_sampler::LoadSampler;
use hotplug_governor::platform::CoreControl;

fn print_usage() {
    println!("cpu_load_probe - print the aggregate CPU load at maximum frequency");
    println!();
    println!("Usage:");
    println!("  cpu_load_probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --interval <ms>     Sampling interval in ms (default: 1000)");
    println!("  --help              Show this help");
    println!();
    println!("Each line is the sum over online cores of their load rescaled to");
    println!("the core's maximum frequency (100 = one core fully busy at max).");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut interval_ms = 1000u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            "--interval" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse() {
                        Ok(val) if val > 0 => interval_ms = val,
                        _ => {
                            eprintln!("error: invalid interval");
                            process::exit(1);
                        }
                    }
                    i += 1;
                } else {
                    eprintln!("error: --interval requires an argument");
                    process::exit(1);
                }
            }
            _ => {
                eprintln!("error: unknown argument: {}", args[i]);
                eprintln!();
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cpu = Arc::new(SysfsCpu::new(SYSFS_CPU_ROOT, PROC_ROOT));
    let sampler = Arc::new(LoadSampler::new(
        cpu.clone(),
        cpu.clone(),
        cpu.possible_cores(),
        cpu.online_cores(),
    ));
    let aggregator = LoadAggregator::new(sampler.clone());

    let sources = EventSources::new();
    let _frequency = FrequencyEventBridge::attach(&sources.frequency, sampler.clone());
    let _topology = TopologyEventBridge::attach(&sources.topology, sampler);
    let poller = match EventPoller::spawn(
        cpu,
        sources.clone(),
        Duration::from_millis(DEFAULT_EVENT_POLL_MS),
    ) {
        Ok(poller) => poller,
        Err(e) => {
            eprintln!("fatal error: {e}");
            process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        eprintln!("error: failed to install the Ctrl+C handler: {e}");
        process::exit(1);
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(interval_ms));
        println!("{}", aggregator.sample_all());
    }
    poller.stop();
}
