use std::sync::Arc;

use tracing::trace;

use crate::load_sampler::LoadSampler;

/// Something that reports the system-wide load-at-max-frequency.
pub trait LoadSource: Send + Sync {
    fn sample_all(&self) -> u32;
}

/// Sums the per-core windows of every online core into one load figure.
pub struct LoadAggregator {
    sampler: Arc<LoadSampler>,
}

impl LoadAggregator {
    pub fn new(sampler: Arc<LoadSampler>) -> Self {
        Self { sampler }
    }

    pub fn sampler(&self) -> &Arc<LoadSampler> {
        &self.sampler
    }
}

impl LoadSource for LoadAggregator {
    /// Forces a fresh sample on each online core and reads-and-clears its
    /// window. Each window contributes exactly once.
    fn sample_all(&self) -> u32 {
        let total = (0..self.sampler.core_count())
            .filter_map(|core| self.sampler.take_window(core))
            .sum();
        trace!(total, "aggregate load at max frequency");
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_mask::CoreMask;
    use crate::load_sampler::tests::FakeCpu;

    fn aggregator(cpu: &Arc<FakeCpu>, cores: usize) -> LoadAggregator {
        for core in 0..cores {
            cpu.advance(core, 0, 0);
        }
        LoadAggregator::new(Arc::new(LoadSampler::new(
            cpu.clone(),
            cpu.clone(),
            CoreMask::first(cores),
            CoreMask::first(cores),
        )))
    }

    #[test]
    fn sums_online_cores() {
        let cpu = Arc::new(FakeCpu::new(1000));
        let agg = aggregator(&cpu, 4);
        cpu.advance(0, 1000, 900);
        cpu.advance(1, 1000, 500);
        cpu.advance(2, 1000, 100);
        cpu.advance(3, 1000, 1000);
        agg.sampler().core_offline(3);

        assert_eq!(agg.sample_all(), 150);
    }

    #[test]
    fn read_and_clear_is_exactly_once() {
        let cpu = Arc::new(FakeCpu::new(1000));
        let agg = aggregator(&cpu, 2);
        cpu.advance(0, 2000, 1000);
        cpu.advance(1, 2000, 2000);

        assert_eq!(agg.sample_all(), 150);
        assert_eq!(agg.sample_all(), 0);
        for core in 0..2 {
            assert_eq!(agg.sampler().snapshot(core).unwrap().window_size(), 0);
        }
    }

    #[test]
    fn frequency_windows_are_folded_in() {
        let cpu = Arc::new(FakeCpu::new(1000));
        let agg = aggregator(&cpu, 1);
        // 1000us fully busy at half speed, then 1000us fully busy at max
        cpu.advance(0, 1000, 1000);
        agg.sampler().frequency_changed(0, 500, 1000);
        cpu.advance(0, 1000, 1000);

        assert_eq!(agg.sample_all(), 75);
    }
}
