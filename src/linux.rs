//! Linux backend over procfs and the cpu sysfs tree.
//!
//! Per-core time counters come from `/proc/stat`, frequency data from each
//! core's `cpufreq` directory and hotplug goes through `cpuN/online`. Both
//! roots are configurable so the backend can run against a copied tree.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::cpu_mask::{CoreId, CoreMask};
use crate::error::{Error, Result};
use crate::events::{EventSources, FrequencyChange, TopologyChange};
use crate::platform::{CoreControl, CoreTimes, FrequencyPolicy, RawCpuTimes, TimeAccounting};

/// Microseconds per `/proc/stat` tick (USER_HZ = 100).
const TICK_US: u64 = 10_000;

/// Field order of a `cpuN` line in `/proc/stat`.
const USER: usize = 0;
const NICE: usize = 1;
const SYSTEM: usize = 2;
const IDLE: usize = 3;
const IOWAIT: usize = 4;
const IRQ: usize = 5;
const SOFTIRQ: usize = 6;
const STEAL: usize = 7;

pub struct SysfsCpu {
    cpu_root: PathBuf,
    proc_root: PathBuf,
}

impl SysfsCpu {
    pub fn new(cpu_root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            cpu_root: cpu_root.into(),
            proc_root: proc_root.into(),
        }
    }

    fn core_path(&self, core: CoreId, file: &str) -> PathBuf {
        self.cpu_root.join(format!("cpu{core}")).join(file)
    }

    fn cpufreq_path(&self, core: CoreId, file: &str) -> PathBuf {
        self.cpu_root
            .join(format!("cpu{core}"))
            .join("cpufreq")
            .join(file)
    }

    /// Tick counters of `core`'s line in `/proc/stat`.
    fn stat_fields(&self, core: CoreId) -> Option<Vec<u64>> {
        let stat = fs::read_to_string(self.proc_root.join("stat")).ok()?;
        let label = format!("cpu{core}");
        let line = stat
            .lines()
            .find(|line| line.split_whitespace().next() == Some(label.as_str()))?;
        line.split_whitespace()
            .skip(1)
            .map(|field| field.parse().ok())
            .collect()
    }

    fn uptime_us(&self) -> Option<u64> {
        let uptime = fs::read_to_string(self.proc_root.join("uptime")).ok()?;
        let seconds: f64 = uptime.split_whitespace().next()?.parse().ok()?;
        Some((seconds * 1_000_000.0) as u64)
    }

    fn online_file(&self, core: CoreId) -> PathBuf {
        self.core_path(core, "online")
    }

    fn write_online(&self, core: CoreId, online: bool) -> Result<()> {
        let path = self.online_file(core);
        if !path.exists() {
            // cores without an online file cannot be hotplugged
            trace!(core, "no online control, request ignored");
            return Ok(());
        }
        if self.is_online(core) == online {
            return Ok(());
        }
        fs::write(&path, if online { "1" } else { "0" }).map_err(|e| Error::io(&path, e))?;
        debug!(core, online, "core hotplug request written");
        Ok(())
    }
}

fn read_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_mask(path: &Path) -> Option<CoreMask> {
    let content = fs::read_to_string(path).ok()?;
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    content.parse().ok()
}

impl TimeAccounting for SysfsCpu {
    fn core_times(&self, core: CoreId) -> Option<CoreTimes> {
        let fields = self.stat_fields(core)?;
        if fields.len() <= STEAL {
            return None;
        }
        let wall: u64 = fields[..=STEAL].iter().sum();
        Some(CoreTimes {
            idle_us: (fields[IDLE] + fields[IOWAIT]) * TICK_US,
            wall_us: wall * TICK_US,
        })
    }

    fn raw_cpu_times(&self, core: CoreId) -> Option<RawCpuTimes> {
        let fields = self.stat_fields(core)?;
        if fields.len() <= SYSTEM {
            return None;
        }
        let field = |index: usize| fields.get(index).copied().unwrap_or(0) * TICK_US;
        Some(RawCpuTimes {
            user: field(USER),
            nice: field(NICE),
            system: field(SYSTEM),
            irq: field(IRQ),
            softirq: field(SOFTIRQ),
            steal: field(STEAL),
            wall_us: self.uptime_us()?,
        })
    }

    fn iowait_us(&self, core: CoreId) -> Option<u64> {
        self.stat_fields(core)?
            .get(IOWAIT)
            .map(|ticks| ticks * TICK_US)
    }
}

impl FrequencyPolicy for SysfsCpu {
    fn max_frequency(&self, core: CoreId) -> Option<u32> {
        read_u32(&self.cpufreq_path(core, "cpuinfo_max_freq"))
    }

    fn current_frequency(&self, core: CoreId) -> Option<u32> {
        read_u32(&self.cpufreq_path(core, "scaling_cur_freq"))
            .or_else(|| read_u32(&self.cpufreq_path(core, "cpuinfo_cur_freq")))
    }

    fn domain_siblings(&self, core: CoreId) -> CoreMask {
        let mut siblings = read_mask(&self.cpufreq_path(core, "related_cpus"))
            .or_else(|| read_mask(&self.cpufreq_path(core, "affected_cpus")))
            .unwrap_or_default();
        siblings.insert(core);
        siblings
    }
}

impl CoreControl for SysfsCpu {
    fn possible_cores(&self) -> CoreMask {
        if let Some(mask) = read_mask(&self.cpu_root.join("possible")) {
            return mask;
        }
        // no possible file: every cpuN directory
        let Ok(entries) = fs::read_dir(&self.cpu_root) else {
            return CoreMask::single(crate::constants::PRIMARY_CORE);
        };
        let mut mask: CoreMask = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()?
                    .strip_prefix("cpu")?
                    .parse::<CoreId>()
                    .ok()
            })
            .collect();
        mask.insert(crate::constants::PRIMARY_CORE);
        mask
    }

    fn is_online(&self, core: CoreId) -> bool {
        match fs::read_to_string(self.online_file(core)) {
            Ok(content) => content.trim() == "1",
            Err(_) => self.cpu_root.join(format!("cpu{core}")).exists(),
        }
    }

    fn request_online(&self, core: CoreId) -> Result<()> {
        self.write_online(core, true)
    }

    fn request_offline(&self, core: CoreId) -> Result<()> {
        self.write_online(core, false)
    }
}

/// Last observed platform state, diffed on every poll.
#[derive(Debug)]
struct Observed {
    online: CoreMask,
    freq: HashMap<CoreId, u32>,
}

/// Turns sysfs state changes into topology and frequency events.
pub struct EventPoller {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl EventPoller {
    pub fn spawn(cpu: Arc<SysfsCpu>, sources: EventSources, interval: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let online = cpu.online_cores();
        let mut observed = Observed {
            online,
            freq: online
                .iter()
                .filter_map(|core| Some((core, cpu.current_frequency(core)?)))
                .collect(),
        };

        let handle = thread::Builder::new()
            .name("hotplug-events".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "event poller started");
                while r.load(Ordering::SeqCst) {
                    poll_once(cpu.as_ref(), &sources, &mut observed);
                    thread::sleep(interval);
                }
                debug!("event poller stopped");
            })
            .map_err(|source| Error::Spawn {
                name: "hotplug-events",
                source,
            })?;

        Ok(Self { running, handle })
    }

    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        if self.handle.join().is_err() {
            warn!("event poller panicked");
        }
    }
}

fn poll_once(cpu: &SysfsCpu, sources: &EventSources, observed: &mut Observed) {
    let online = cpu.online_cores();
    for core in cpu.possible_cores().iter() {
        match (observed.online.contains(core), online.contains(core)) {
            (false, true) => {
                debug!(core, "core came online");
                if let Some(freq) = cpu.current_frequency(core) {
                    observed.freq.insert(core, freq);
                }
                sources.topology.publish(&TopologyChange::Online(core));
            }
            (true, false) => {
                debug!(core, "core went offline");
                observed.freq.remove(&core);
                sources.topology.publish(&TopologyChange::Offline(core));
            }
            _ => {}
        }
    }
    observed.online = online;

    let mut seen = CoreMask::empty();
    for core in online.iter() {
        if seen.contains(core) {
            continue;
        }
        let domain = cpu.domain_siblings(core);
        for sibling in domain.iter() {
            seen.insert(sibling);
        }
        let Some(new_freq) = cpu.current_frequency(core) else {
            continue;
        };
        let old_freq = observed.freq.get(&core).copied().unwrap_or(new_freq);
        for sibling in domain.iter().filter(|&sibling| online.contains(sibling)) {
            observed.freq.insert(sibling, new_freq);
        }
        if old_freq != new_freq {
            trace!(core, old_freq, new_freq, "frequency change observed");
            sources.frequency.publish(&FrequencyChange {
                core,
                old_freq,
                new_freq,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fake sysfs/procfs tree with `cores` cores in one frequency domain.
    fn tree(cores: usize) -> (tempfile::TempDir, SysfsCpu) {
        let dir = tempfile::tempdir().unwrap();
        let cpu_root = dir.path().join("cpu");
        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        fs::create_dir_all(&cpu_root).unwrap();
        fs::write(cpu_root.join("possible"), format!("0-{}\n", cores - 1)).unwrap();
        for core in 0..cores {
            let freq = cpu_root.join(format!("cpu{core}")).join("cpufreq");
            fs::create_dir_all(&freq).unwrap();
            fs::write(freq.join("cpuinfo_max_freq"), "2000000\n").unwrap();
            fs::write(freq.join("scaling_cur_freq"), "1000000\n").unwrap();
            fs::write(freq.join("related_cpus"), format!("0-{}\n", cores - 1)).unwrap();
            if core != 0 {
                fs::write(cpu_root.join(format!("cpu{core}")).join("online"), "1\n").unwrap();
            }
        }
        let cpu = SysfsCpu::new(cpu_root, proc_root);
        (dir, cpu)
    }

    fn write_stat(cpu: &SysfsCpu, content: &str) {
        fs::write(cpu.proc_root.join("stat"), content).unwrap();
    }

    #[test]
    fn reads_times_from_proc_stat() {
        let (_dir, cpu) = tree(2);
        write_stat(
            &cpu,
            "cpu  10 0 10 80 0 0 0 0 0 0\n\
             cpu0 1 2 3 40 4 5 6 7 0 0\n\
             cpu1 9 0 1 90 0 0 0 0 0 0\n",
        );
        let times = cpu.core_times(0).unwrap();
        assert_eq!(times.idle_us, 44 * TICK_US);
        assert_eq!(times.wall_us, 68 * TICK_US);
        assert_eq!(cpu.iowait_us(0), Some(4 * TICK_US));
        assert_eq!(cpu.core_times(1).unwrap().idle_us, 90 * TICK_US);
        assert_eq!(cpu.core_times(2), None);
    }

    #[test]
    fn short_stat_lines_use_the_raw_fallback() {
        let (_dir, cpu) = tree(1);
        write_stat(&cpu, "cpu0 100 0 50 850\n");
        fs::write(cpu.proc_root.join("uptime"), "12.50 40.00\n").unwrap();
        assert_eq!(cpu.core_times(0), None);
        let raw = cpu.raw_cpu_times(0).unwrap();
        assert_eq!(raw.busy_us(), 150 * TICK_US);
        assert_eq!(raw.wall_us, 12_500_000);
        assert_eq!(cpu.iowait_us(0), None);
    }

    #[test]
    fn reads_frequency_policy() {
        let (_dir, cpu) = tree(4);
        assert_eq!(cpu.max_frequency(1), Some(2_000_000));
        assert_eq!(cpu.current_frequency(1), Some(1_000_000));
        assert_eq!(cpu.domain_siblings(2), CoreMask::first(4));

        let freq = cpu.cpu_root.join("cpu3").join("cpufreq");
        fs::remove_file(freq.join("scaling_cur_freq")).unwrap();
        fs::write(freq.join("cpuinfo_cur_freq"), "1500000").unwrap();
        fs::remove_file(freq.join("related_cpus")).unwrap();
        assert_eq!(cpu.current_frequency(3), Some(1_500_000));
        assert_eq!(cpu.domain_siblings(3), CoreMask::single(3));
    }

    #[test]
    fn hotplug_writes_online_files() {
        let (_dir, cpu) = tree(3);
        assert_eq!(cpu.possible_cores(), CoreMask::first(3));
        assert_eq!(cpu.online_cores(), CoreMask::first(3));

        cpu.request_offline(2).unwrap();
        assert!(!cpu.is_online(2));
        assert_eq!(cpu.online_cores().to_string(), "0-1");

        cpu.request_online(2).unwrap();
        assert!(cpu.is_online(2));

        // the primary core has no online file and stays up
        cpu.request_offline(0).unwrap();
        assert!(cpu.is_online(0));
    }

    #[test]
    fn possible_cores_falls_back_to_directories() {
        let (_dir, cpu) = tree(2);
        fs::remove_file(cpu.cpu_root.join("possible")).unwrap();
        fs::create_dir_all(cpu.cpu_root.join("cpufreq")).unwrap();
        assert_eq!(cpu.possible_cores(), CoreMask::first(2));
    }

    fn recording_sources() -> (
        EventSources,
        Arc<Mutex<Vec<FrequencyChange>>>,
        Arc<Mutex<Vec<TopologyChange>>>,
        Vec<crate::events::Subscription>,
    ) {
        let sources = EventSources::new();
        let freq = Arc::new(Mutex::new(Vec::new()));
        let topo = Arc::new(Mutex::new(Vec::new()));
        let f = freq.clone();
        let t = topo.clone();
        let subs = vec![
            sources
                .frequency
                .subscribe(move |e: &FrequencyChange| f.lock().unwrap().push(*e)),
            sources
                .topology
                .subscribe(move |e: &TopologyChange| t.lock().unwrap().push(*e)),
        ];
        (sources, freq, topo, subs)
    }

    #[test]
    fn poll_publishes_one_event_per_domain() {
        let (_dir, cpu) = tree(4);
        let (sources, freq, topo, _subs) = recording_sources();
        let mut observed = Observed {
            online: cpu.online_cores(),
            freq: (0..4).map(|core| (core, 1_000_000)).collect(),
        };

        for core in 0..4 {
            let path = cpu.cpufreq_path(core, "scaling_cur_freq");
            fs::write(path, "1800000\n").unwrap();
        }
        poll_once(&cpu, &sources, &mut observed);
        assert_eq!(
            *freq.lock().unwrap(),
            vec![FrequencyChange {
                core: 0,
                old_freq: 1_000_000,
                new_freq: 1_800_000
            }]
        );
        assert!(topo.lock().unwrap().is_empty());

        poll_once(&cpu, &sources, &mut observed);
        assert_eq!(freq.lock().unwrap().len(), 1);
    }

    #[test]
    fn poll_publishes_topology_changes() {
        let (_dir, cpu) = tree(3);
        let (sources, freq, topo, _subs) = recording_sources();
        let mut observed = Observed {
            online: cpu.online_cores(),
            freq: (0..3).map(|core| (core, 1_000_000)).collect(),
        };

        cpu.request_offline(1).unwrap();
        poll_once(&cpu, &sources, &mut observed);
        cpu.request_online(1).unwrap();
        poll_once(&cpu, &sources, &mut observed);

        assert_eq!(
            *topo.lock().unwrap(),
            vec![TopologyChange::Offline(1), TopologyChange::Online(1)]
        );
        assert!(freq.lock().unwrap().is_empty());
    }

    #[test]
    fn poller_thread_stops() {
        let (_dir, cpu) = tree(2);
        let poller =
            EventPoller::spawn(Arc::new(cpu), EventSources::new(), Duration::from_millis(1))
                .unwrap();
        thread::sleep(Duration::from_millis(10));
        poller.stop();
    }
}
