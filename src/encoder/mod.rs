//! Per-switch packet recording.
//!
//! The encoder keeps two period buffers. Packets always land in the active
//! one; [`SketchEncoder::rotate`] swaps in the cleared standby buffer and hands
//! the filled one to the decoder by value, so a decode never observes a
//! sketch that is still being written.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::bloom_filter::NoveltyFilter;
use crate::cms::Sketch;
use crate::config::RadarConfig;
use crate::flow::{FlowKey, FlowStats};
use crate::hashing::{FlowHasher, SeededHasher};

/// Encoder handle shared between the packet path and the decoder.
pub type SharedEncoder = Arc<Mutex<SketchEncoder>>;

/// Everything recorded during one measurement period.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodState {
    pub sketch: Sketch,
    pub filter: NoveltyFilter,
    /// Exact per-flow counts. Only used as an oracle for output and tests.
    pub real: HashMap<FlowKey, FlowStats>,
    pub packets: u64,
}

impl PeriodState {
    fn new(config: &RadarConfig) -> PeriodState {
        PeriodState {
            sketch: Sketch::build_sketch(
                config.cells_per_block,
                config.cell_hashes,
                config.num_blocks,
                config.flow_table_capacity,
            ),
            filter: NoveltyFilter::build_novelty_filter(config.filter_size, config.filter_hashes),
            real: HashMap::new(),
            packets: 0,
        }
    }

    fn clear(&mut self) {
        self.sketch.clear();
        self.filter.clear();
        self.real.clear();
        self.packets = 0;
    }
}

/// A finished period, owned by the decoder until it is recycled.
#[derive(Debug)]
pub struct SketchSnapshot {
    pub switch_id: usize,
    pub state: PeriodState,
}

impl SketchSnapshot {
    pub fn sketch(&self) -> &Sketch {
        &self.state.sketch
    }

    pub fn filter(&self) -> &NoveltyFilter {
        &self.state.filter
    }

    pub fn real(&self) -> &HashMap<FlowKey, FlowStats> {
        &self.state.real
    }

    pub fn packets(&self) -> u64 {
        self.state.packets
    }
}

#[derive(Debug)]
pub struct SketchEncoder {
    switch_id: usize,
    hasher: Arc<dyn FlowHasher>,
    active: PeriodState,
    standby: Option<PeriodState>,
    config: RadarConfig,
}

impl SketchEncoder {
    pub fn new(switch_id: usize, config: &RadarConfig) -> SketchEncoder {
        let hasher = SeededHasher::for_switch(config.hash_seed, switch_id);
        SketchEncoder::with_hasher(switch_id, config, Arc::new(hasher))
    }

    pub fn with_hasher(
        switch_id: usize,
        config: &RadarConfig,
        hasher: Arc<dyn FlowHasher>,
    ) -> SketchEncoder {
        SketchEncoder {
            switch_id,
            hasher,
            active: PeriodState::new(config),
            standby: Some(PeriodState::new(config)),
            config: config.clone(),
        }
    }

    pub fn into_shared(self) -> SharedEncoder {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> usize {
        self.switch_id
    }

    /// Records one packet. Returns true if it was the first of its flow.
    pub fn record_packet(&mut self, key: FlowKey, bytes: u32) -> bool {
        let is_new = self.active.filter.insert(self.hasher.as_ref(), &key);
        let (block, cells) = self.active.sketch.index(self.hasher.as_ref(), &key);
        let was_overflowed = self.active.sketch.blocks[block].overflowed;
        if !self.active.sketch.insert(block, cells, key, bytes, is_new) && !was_overflowed {
            warn!(
                switch = self.switch_id,
                block,
                capacity = self.active.sketch.flow_table_capacity(),
                "flow table full, block cannot be decoded this period"
            );
        }

        self.active.real.entry(key).or_default().record(bytes);
        self.active.packets += 1;
        if self.active.packets % 100_000 == 0 {
            debug!(switch = self.switch_id, packets = self.active.packets, "encoder progress");
        }
        trace!(switch = self.switch_id, flow = %key, bytes, is_new, block, "recorded");
        is_new
    }

    /// Resets the active period.
    pub fn clear(&mut self) {
        debug!(switch = self.switch_id, "encoder reset");
        self.active.clear();
    }

    /// Ends the active period and returns it.
    pub fn rotate(&mut self) -> SketchSnapshot {
        let fresh = self.standby.take().unwrap_or_else(|| PeriodState::new(&self.config));
        let state = std::mem::replace(&mut self.active, fresh);
        SketchSnapshot { switch_id: self.switch_id, state }
    }

    /// Returns a decoded snapshot's buffers for reuse.
    pub fn recycle(&mut self, snapshot: SketchSnapshot) {
        let mut state = snapshot.state;
        state.clear();
        self.standby = Some(state);
    }

    pub fn sketch(&self) -> &Sketch {
        &self.active.sketch
    }

    pub fn real_flows(&self) -> &HashMap<FlowKey, FlowStats> {
        &self.active.real
    }

    pub fn packets_received(&self) -> u64 {
        self.active.packets
    }

    /// Bytes held by the fixed-size structures of both buffers.
    pub fn footprint(&self) -> usize {
        let one = self.active.sketch.footprint() + self.active.filter.footprint();
        match self.standby {
            Some(_) => 2 * one,
            None => one,
        }
    }
}
