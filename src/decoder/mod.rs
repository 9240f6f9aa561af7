//! Periodic reconstruction of per-flow counts from the encoders' sketches.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::cms::{Block, Sketch};
use crate::encoder::{SharedEncoder, SketchSnapshot};
use crate::error::{RadarError, RadarResult};
use crate::flow::{DecodedFlow, FlowKey, FlowStats};
use crate::output::FlowWriter;
use crate::solver::{EquationSolver, EquationSystem, SimplexSolver, SolveOutcome};

/// Decoded flows of one switch for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub switch_id: usize,
    pub time: f64,
    pub flows: Vec<DecodedFlow>,
}

/// Outcome of one decode cycle over every registered encoder.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub time: f64,
    pub batches: Vec<DecodedBatch>,
    pub failures: Vec<(usize, RadarError)>,
    pub accuracy: Vec<(usize, Accuracy)>,
}

/// When decode cycles fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeSchedule {
    period: f64,
    end_time: Option<f64>,
    next_due: Option<f64>,
}

impl DecodeSchedule {
    pub fn new(period: f64, end_time: Option<f64>) -> DecodeSchedule {
        DecodeSchedule {
            period,
            end_time,
            next_due: None,
        }
    }

    /// Arms the first cycle one period after `start`.
    pub fn start(&mut self, start: f64) {
        self.next_due = self.following(start);
    }

    pub fn next_due(&self) -> Option<f64> {
        self.next_due
    }

    pub fn is_due(&self, now: f64) -> bool {
        matches!(self.next_due, Some(t) if now >= t)
    }

    /// Called after the cycle due at `at` ran.
    pub fn advance(&mut self, at: f64) {
        self.next_due = self.following(at);
        if self.next_due.is_none() {
            info!(at, "stop decoding");
        }
    }

    fn following(&self, at: f64) -> Option<f64> {
        let next = at + self.period;
        match self.end_time {
            Some(end) if next >= end => None,
            _ => Some(next),
        }
    }
}

/// Per-switch comparison of decoded counts against the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accuracy {
    pub num_flows: usize,
    pub num_exact: usize,
    pub num_near_exact: usize,
    /// Average absolute packet error.
    pub aae: f64,
    /// Average relative packet error.
    pub are: f64,
}

impl Accuracy {
    pub fn compare(measured: &[DecodedFlow], real: &HashMap<FlowKey, FlowStats>) -> Accuracy {
        let decoded: HashMap<FlowKey, u64> =
            measured.iter().map(|f| (f.key, f.stats.packets)).collect();
        let mut acc = Accuracy {
            num_flows: real.len(),
            ..Accuracy::default()
        };
        if real.is_empty() {
            return acc;
        }
        let mut error = 0.0;
        let mut relative_error = 0.0;
        for (k, v) in real {
            let exact = v.packets as f64;
            let s = decoded.get(k).copied().unwrap_or(0) as f64;
            let e = (exact - s).abs();
            error += e;
            relative_error += e / exact;
            if e < 1.0 {
                acc.num_exact += 1;
            }
            if e < 2.0 {
                acc.num_near_exact += 1;
            }
        }
        acc.aae = error / real.len() as f64;
        acc.are = relative_error / real.len() as f64;
        acc
    }
}

/// Candidate flows of every cell, with multiplicity.
pub fn candidate_sets(block: &Block) -> Vec<Vec<usize>> {
    let mut candidates = vec![Vec::new(); block.count_table.len()];
    for (f, entry) in block.flow_table.iter().enumerate() {
        for &c in &entry.cells {
            candidates[c].push(f);
        }
    }
    candidates
}

/// Packet and byte equation systems of a block, one row per non-empty cell.
pub fn build_systems(
    switch_id: usize,
    block_index: usize,
    block: &Block,
) -> RadarResult<(EquationSystem, EquationSystem)> {
    if block.overflowed {
        return Err(RadarError::BlockOverflow {
            switch_id,
            block: block_index,
            capacity: block.flow_table.len(),
        });
    }
    let num_flows = block.flow_table.len();
    let mut packets = EquationSystem::new(num_flows);
    let mut bytes = EquationSystem::new(num_flows);
    for (cell, candidates) in candidate_sets(block).into_iter().enumerate() {
        let counter = &block.count_table[cell];
        if counter.is_empty() {
            if !candidates.is_empty() {
                return Err(RadarError::CorruptBlock {
                    switch_id,
                    block: block_index,
                    cell,
                    candidates: candidates.len(),
                });
            }
            continue;
        }
        if candidates.is_empty() {
            return Err(RadarError::Infeasible {
                switch_id,
                block: block_index,
                reason: format!(
                    "cell {} counted {} packets but no flow maps to it",
                    cell, counter.packets
                ),
            });
        }
        packets.push(candidates.clone(), counter.packets as f64);
        bytes.push(candidates, counter.bytes as f64);
    }
    Ok((packets, bytes))
}

fn solve_values(
    solver: &dyn EquationSolver,
    switch_id: usize,
    block_index: usize,
    system: &EquationSystem,
) -> RadarResult<Vec<u64>> {
    match solver.solve(system)? {
        SolveOutcome::Solved(x) => Ok(x.into_iter().map(|v| v.round().max(0.0) as u64).collect()),
        SolveOutcome::Infeasible(reason) => Err(RadarError::Infeasible {
            switch_id,
            block: block_index,
            reason,
        }),
    }
}

/// Decodes one block.
pub fn decode_block(
    solver: &dyn EquationSolver,
    switch_id: usize,
    block_index: usize,
    block: &Block,
) -> RadarResult<Vec<DecodedFlow>> {
    if block.flow_table.is_empty() && block.packets() == 0 {
        return Ok(Vec::new());
    }
    let (packet_system, byte_system) = build_systems(switch_id, block_index, block)?;
    let packets = solve_values(solver, switch_id, block_index, &packet_system)?;
    let bytes = solve_values(solver, switch_id, block_index, &byte_system)?;
    debug!(
        switch = switch_id,
        block = block_index,
        flows = block.flow_table.len(),
        rows = packet_system.num_equations(),
        "block decoded"
    );
    Ok(block
        .flow_table
        .iter()
        .zip(packets.into_iter().zip(bytes))
        .map(|(entry, (p, b))| DecodedFlow {
            key: entry.key,
            stats: FlowStats::new(p, b),
        })
        .collect())
}

/// An overflowed block lost flows, so it is left out of the period instead
/// of failing the whole switch.
fn skip_overflowed(result: RadarResult<Vec<DecodedFlow>>) -> RadarResult<Vec<DecodedFlow>> {
    match result {
        Err(RadarError::BlockOverflow {
            switch_id,
            block,
            capacity,
        }) => {
            warn!(switch = switch_id, block, capacity, "flow table overflowed, block skipped");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Decodes every block of a sketch, spreading blocks over the available
/// cores. Overflowed blocks contribute no flows.
pub fn decode_sketch(
    solver: &dyn EquationSolver,
    switch_id: usize,
    sketch: &Sketch,
) -> RadarResult<Vec<DecodedFlow>> {
    let blocks = &sketch.blocks;
    if blocks.is_empty() {
        return Ok(Vec::new());
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(blocks.len());
    let chunk = (blocks.len() + workers - 1) / workers;

    let results: Vec<RadarResult<Vec<Vec<DecodedFlow>>>> = thread::scope(|s| {
        let handles: Vec<_> = blocks
            .chunks(chunk)
            .enumerate()
            .map(|(ci, part)| {
                s.spawn(move || {
                    part.iter()
                        .enumerate()
                        .map(|(bi, block)| {
                            skip_overflowed(decode_block(solver, switch_id, ci * chunk + bi, block))
                        })
                        .collect::<RadarResult<Vec<Vec<DecodedFlow>>>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(RadarError::Solver("decode worker panicked".to_string()))
                })
            })
            .collect()
    });

    let mut flows = Vec::with_capacity(sketch.num_flows());
    for part in results {
        for block_flows in part? {
            flows.extend(block_flows);
        }
    }
    Ok(flows)
}

/// Drives decode cycles over a set of encoders.
#[derive(Debug)]
pub struct SketchDecoder {
    encoders: Vec<SharedEncoder>,
    solver: Arc<dyn EquationSolver>,
    schedule: DecodeSchedule,
    offline: bool,
    writer: Option<FlowWriter>,
}

impl SketchDecoder {
    pub fn new(period: f64, end_time: Option<f64>) -> SketchDecoder {
        SketchDecoder {
            encoders: Vec::new(),
            solver: Arc::new(SimplexSolver::default()),
            schedule: DecodeSchedule::new(period, end_time),
            offline: false,
            writer: None,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn EquationSolver>) -> SketchDecoder {
        self.solver = solver;
        self
    }

    /// Dump blocks instead of solving them. Requires a writer to be useful.
    pub fn offline(mut self, offline: bool) -> SketchDecoder {
        self.offline = offline;
        self
    }

    pub fn with_writer(mut self, writer: FlowWriter) -> SketchDecoder {
        self.writer = Some(writer);
        self
    }

    pub fn add_encoder(&mut self, encoder: SharedEncoder) {
        self.encoders.push(encoder);
    }

    pub fn num_encoders(&self) -> usize {
        self.encoders.len()
    }

    pub fn schedule(&self) -> &DecodeSchedule {
        &self.schedule
    }

    pub fn start(&mut self, start: f64) {
        self.schedule.start(start);
    }

    /// Runs a cycle if one is due at `now`.
    pub fn poll(&mut self, now: f64) -> Option<CycleReport> {
        let due = self.schedule.next_due()?;
        if now < due {
            return None;
        }
        let report = self.run_cycle(due);
        self.schedule.advance(due);
        Some(report)
    }

    /// Rotates every encoder and decodes the finished periods.
    pub fn run_cycle(&self, time: f64) -> CycleReport {
        info!(time, encoders = self.encoders.len(), "decode cycle");
        let mut report = CycleReport {
            time,
            ..CycleReport::default()
        };
        for encoder in &self.encoders {
            let snapshot = encoder.lock().rotate();
            let switch_id = snapshot.switch_id;
            match self.process(&snapshot, time) {
                Ok(Some((flows, accuracy))) => {
                    report.accuracy.push((switch_id, accuracy));
                    if flows.is_empty() {
                        debug!(switch = switch_id, "no flows decoded");
                    } else {
                        report.batches.push(DecodedBatch { switch_id, time, flows });
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(switch = switch_id, time, error = %e, "decode cycle failed");
                    report.failures.push((switch_id, e));
                }
            }
            encoder.lock().recycle(snapshot);
        }
        report
    }

    fn process(
        &self,
        snapshot: &SketchSnapshot,
        time: f64,
    ) -> RadarResult<Option<(Vec<DecodedFlow>, Accuracy)>> {
        let switch_id = snapshot.switch_id;
        if let Some(writer) = &self.writer {
            writer.write_real(switch_id, time, snapshot.real())?;
        }
        if self.offline {
            if let Some(writer) = &self.writer {
                writer.write_blocks(switch_id, time, snapshot.sketch())?;
            }
            return Ok(None);
        }

        let sketch = snapshot.sketch();
        let flows = decode_sketch(self.solver.as_ref(), switch_id, sketch)?;
        let accuracy = Accuracy::compare(&flows, snapshot.real());
        let max_block_load = (0..sketch.num_blocks())
            .map(|b| sketch.get_block_load(b))
            .fold(0.0f32, f32::max);
        info!(
            switch = switch_id,
            packets = snapshot.packets(),
            flows = flows.len(),
            novel = snapshot.filter().get_num_items(),
            real_flows = accuracy.num_flows,
            exact = accuracy.num_exact,
            aae = accuracy.aae,
            load = sketch.get_load(),
            max_block_load,
            filter_load = snapshot.filter().get_load(),
            "switch decoded"
        );
        if let Some(writer) = &self.writer {
            writer.write_measured(switch_id, time, &flows)?;
        }
        Ok(Some((flows, accuracy)))
    }
}
