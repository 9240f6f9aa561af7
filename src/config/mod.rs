//! Configuration of the sketch, the decode loop and the queues.

use crate::error::{RadarError, RadarResult};

const MAX_FILTER_HASHES: usize = 64;

/// Every option recognised by the measurement loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarConfig {
    /// Blocks per sketch.
    pub num_blocks: usize,
    /// Counters per block.
    pub cells_per_block: usize,
    /// Cell hashes per flow (K).
    pub cell_hashes: usize,
    /// Novelty filter size in bits.
    pub filter_size: usize,
    /// Novelty filter hashes (H).
    pub filter_hashes: usize,
    /// Flow table entries reserved per block. May exceed `cells_per_block`;
    /// the decode system is then underdetermined but still solvable. A block
    /// whose table fills up is skipped for the period.
    pub flow_table_capacity: usize,
    /// Measurement period in seconds.
    pub period: f64,
    /// No decode cycle is scheduled at or after this time.
    pub end_time: Option<f64>,
    /// Base seed of the sketch hashes; each switch adds its id.
    pub hash_seed: u64,
    /// Fraction of a port's flows classified as elephants.
    pub elephant_fraction: f64,
    /// Inflation applied to the mice share of a port's capacity.
    pub mice_expansion: f64,
    /// Elephant occupancy ratio at which AQM starts dropping.
    pub aqm_threshold: f64,
    /// Drop rate assigned to every elephant flow.
    pub elephant_drop_rate: f32,
    /// Mice turns out of `total_weight`.
    pub mice_weight: u16,
    /// Length of the round robin schedule.
    pub total_weight: u16,
    /// Packets a port queue holds across both classes.
    pub queue_capacity: usize,
    /// Mice capacity before the first decode cycle.
    pub initial_mice_capacity: usize,
    /// Output ports per switch.
    pub ports_per_switch: usize,
    /// Drain rate of a port in bytes per second.
    pub link_rate: f64,
    /// Dump blocks instead of solving them.
    pub offline: bool,
    /// Where diagnostic flow files are written.
    pub output_dir: Option<std::path::PathBuf>,
    /// Seed for the AQM random draws.
    pub rng_seed: Option<u64>,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            num_blocks: 10,
            cells_per_block: 1000,
            cell_hashes: 4,
            filter_size: 1 << 22,
            filter_hashes: 20,
            flow_table_capacity: 8 * 1000,
            period: 0.5,
            end_time: None,
            hash_seed: 0,
            elephant_fraction: 0.5,
            mice_expansion: 1.2,
            aqm_threshold: 0.8,
            elephant_drop_rate: 0.0,
            mice_weight: 5,
            total_weight: 10,
            queue_capacity: 150,
            initial_mice_capacity: 100,
            ports_per_switch: 4,
            link_rate: 1.25e9,
            offline: false,
            output_dir: None,
            rng_seed: None,
        }
    }
}

impl RadarConfig {
    /// Small sketch and deterministic randomness.
    pub fn for_testing() -> Self {
        Self {
            num_blocks: 2,
            cells_per_block: 64,
            cell_hashes: 2,
            filter_size: 1 << 16,
            filter_hashes: 4,
            flow_table_capacity: 8 * 64,
            rng_seed: Some(7),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> RadarResult<()> {
        let positive = [
            ("num_blocks", self.num_blocks),
            ("cells_per_block", self.cells_per_block),
            ("cell_hashes", self.cell_hashes),
            ("filter_size", self.filter_size),
            ("filter_hashes", self.filter_hashes),
            ("flow_table_capacity", self.flow_table_capacity),
            ("queue_capacity", self.queue_capacity),
            ("ports_per_switch", self.ports_per_switch),
            ("total_weight", self.total_weight as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(invalid(format!("{} must be positive", name)));
            }
        }
        if !(self.period > 0.0) {
            return Err(invalid(format!("period must be positive, got {}", self.period)));
        }
        if !(self.elephant_fraction >= 0.0 && self.elephant_fraction <= 1.0) {
            return Err(invalid(format!(
                "elephant_fraction {} not in [0, 1]",
                self.elephant_fraction
            )));
        }
        if !(self.mice_expansion >= 1.0) {
            return Err(invalid(format!("mice_expansion {} below 1", self.mice_expansion)));
        }
        if !(self.aqm_threshold > 0.0 && self.aqm_threshold <= 1.0) {
            return Err(invalid(format!("aqm_threshold {} not in (0, 1]", self.aqm_threshold)));
        }
        if !(0.0..=1.0).contains(&self.elephant_drop_rate) {
            return Err(invalid(format!(
                "elephant_drop_rate {} not in [0, 1]",
                self.elephant_drop_rate
            )));
        }
        if self.cell_hashes > self.cells_per_block {
            return Err(invalid(format!(
                "cell_hashes {} exceeds cells_per_block {}",
                self.cell_hashes, self.cells_per_block
            )));
        }
        if self.filter_hashes > MAX_FILTER_HASHES {
            return Err(invalid(format!(
                "filter_hashes {} exceeds {}",
                self.filter_hashes, MAX_FILTER_HASHES
            )));
        }
        if self.mice_weight > self.total_weight {
            return Err(invalid(format!(
                "mice_weight {} exceeds total_weight {}",
                self.mice_weight, self.total_weight
            )));
        }
        if self.initial_mice_capacity > self.queue_capacity {
            return Err(invalid(format!(
                "initial_mice_capacity {} exceeds queue_capacity {}",
                self.initial_mice_capacity, self.queue_capacity
            )));
        }
        if !(self.link_rate > 0.0) {
            return Err(invalid("link_rate must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(message: String) -> RadarError {
    RadarError::InvalidConfig(message)
}
