//! Trace replay through the whole loop: every packet is recorded by each
//! switch on its path, routed to a port queue and drained at link rate;
//! decode cycles fire on the replay clock and reconfigure the queues.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::config::RadarConfig;
use crate::controller::{ControllerReport, QueueController};
use crate::decoder::{Accuracy, CycleReport, SketchDecoder};
use crate::encoder::{SharedEncoder, SketchEncoder};
use crate::error::{RadarError, RadarResult};
use crate::output::FlowWriter;
use crate::queue::{DiffQueue, DiffQueueConfig, Enqueue, QueueStats};
use crate::trace::TracePacket;

/// A per-switch failure of one decode cycle.
#[derive(Debug)]
pub struct CycleFailure {
    pub time: f64,
    pub switch_id: usize,
    pub error: RadarError,
}

#[derive(Debug, Default)]
pub struct SimSummary {
    pub packets: u64,
    pub cycles: usize,
    pub decoded_flows: usize,
    pub failures: Vec<CycleFailure>,
    pub accuracy: Vec<(f64, usize, Accuracy)>,
    pub reports: Vec<ControllerReport>,
    /// `(switch, port, stats)` at the end of the replay.
    pub queues: Vec<(usize, usize, QueueStats)>,
}

impl SimSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
struct Port {
    queue: Arc<DiffQueue<TracePacket>>,
    /// Bytes the link may still send.
    credit: f64,
    last_drain: f64,
}

#[derive(Debug)]
struct Switch {
    encoder: SharedEncoder,
    ports: Vec<Port>,
    next_port: usize,
}

#[derive(Debug)]
pub struct Simulation {
    config: RadarConfig,
    switches: Vec<Switch>,
    decoder: SketchDecoder,
    controller: QueueController<TracePacket>,
    origin: Option<f64>,
    summary: SimSummary,
}

impl Simulation {
    pub fn new(config: RadarConfig, num_switches: usize) -> RadarResult<Simulation> {
        config.validate()?;
        if num_switches == 0 {
            return Err(RadarError::InvalidConfig("at least one switch is required".to_string()));
        }
        let mut decoder =
            SketchDecoder::new(config.period, config.end_time).offline(config.offline);
        if let Some(dir) = &config.output_dir {
            decoder = decoder.with_writer(FlowWriter::new(dir)?);
        }
        let mut controller = QueueController::new(&config);
        let mut switches = Vec::with_capacity(num_switches);
        for switch_id in 0..num_switches {
            let encoder = SketchEncoder::new(switch_id, &config).into_shared();
            decoder.add_encoder(encoder.clone());
            let queues: Vec<_> = (0..config.ports_per_switch)
                .map(|port| {
                    Arc::new(DiffQueue::new(switch_id, port, DiffQueueConfig::from(&config)))
                })
                .collect();
            controller.register_switch(switch_id, queues.clone());
            let ports = queues
                .into_iter()
                .map(|queue| Port {
                    queue,
                    credit: 0.0,
                    last_drain: 0.0,
                })
                .collect();
            switches.push(Switch {
                encoder,
                ports,
                next_port: 0,
            });
        }
        info!(
            switches = num_switches,
            ports = config.ports_per_switch,
            blocks = config.num_blocks,
            cells = config.cells_per_block,
            period = config.period,
            "simulation ready"
        );
        Ok(Simulation {
            config,
            switches,
            decoder,
            controller,
            origin: None,
            summary: SimSummary::default(),
        })
    }

    pub fn controller(&self) -> &QueueController<TracePacket> {
        &self.controller
    }

    pub fn summary(&self) -> &SimSummary {
        &self.summary
    }

    /// Feeds one packet. Times are taken relative to the first packet.
    /// Returns false once the configured end time has passed.
    pub fn ingest(&mut self, packet: TracePacket) -> bool {
        let origin = *self.origin.get_or_insert_with(|| {
            debug!(start = packet.time, "replay clock started");
            packet.time
        });
        if self.summary.packets == 0 {
            self.decoder.start(0.0);
        }
        let now = packet.time - origin;
        if matches!(self.config.end_time, Some(end) if now >= end) {
            return false;
        }

        while let Some(report) = self.decoder.poll(now) {
            self.apply(report);
        }

        let packet = TracePacket { time: now, ..packet };
        for switch_id in 0..self.switches.len() {
            self.forward(switch_id, packet);
        }
        self.summary.packets += 1;
        true
    }

    fn forward(&mut self, switch_id: usize, packet: TracePacket) {
        let switch = &mut self.switches[switch_id];
        switch.encoder.lock().record_packet(packet.key, packet.size);

        let dst = packet.key.dst();
        let port = match self.controller.route(switch_id, dst) {
            Some(port) => port,
            None => {
                let port = switch.next_port % switch.ports.len();
                switch.next_port += 1;
                if let Err(e) = self.controller.add_route(switch_id, dst, port) {
                    warn!(switch = switch_id, %dst, error = %e, "route discovery failed");
                    return;
                }
                port
            }
        };

        let link_rate = self.config.link_rate;
        let out = &mut self.switches[switch_id].ports[port];
        drain(out, packet.time, link_rate);
        if let Enqueue::Dropped(reason) = out.queue.enqueue(packet) {
            trace!(switch = switch_id, port, flow = %packet.key, ?reason, "dropped");
        }
    }

    fn apply(&mut self, report: CycleReport) {
        let CycleReport {
            time,
            batches,
            failures,
            accuracy,
        } = report;
        self.summary.cycles += 1;
        for (switch_id, error) in failures {
            self.summary.failures.push(CycleFailure { time, switch_id, error });
        }
        self.summary
            .accuracy
            .extend(accuracy.into_iter().map(|(switch_id, acc)| (time, switch_id, acc)));
        for batch in batches {
            self.summary.decoded_flows += batch.flows.len();
            match self.controller.receive_decoded_flows(&batch) {
                Ok(report) => self.summary.reports.push(report),
                Err(e) => {
                    error!(
                        switch = batch.switch_id,
                        time,
                        error = %e,
                        "queue reconfiguration failed"
                    );
                    self.summary.failures.push(CycleFailure {
                        time,
                        switch_id: batch.switch_id,
                        error: e,
                    });
                }
            }
        }
    }

    /// Replays `packets` in order.
    pub fn run<I>(&mut self, packets: I) -> &SimSummary
    where
        I: IntoIterator<Item = TracePacket>,
    {
        for packet in packets {
            if !self.ingest(packet) {
                info!("end time reached");
                break;
            }
        }
        self.finish()
    }

    /// Runs the cycle that closes the last period, if still scheduled, and
    /// collects the queue counters.
    pub fn finish(&mut self) -> &SimSummary {
        if self.summary.packets > 0 {
            if let Some(due) = self.decoder.schedule().next_due() {
                if let Some(report) = self.decoder.poll(due) {
                    self.apply(report);
                }
            }
        }
        self.summary.queues = self
            .switches
            .iter()
            .enumerate()
            .flat_map(|(switch_id, switch)| {
                switch
                    .ports
                    .iter()
                    .map(move |port| (switch_id, port.queue.port(), port.queue.stats()))
            })
            .collect();
        for (switch_id, switch) in self.switches.iter().enumerate() {
            for port in &switch.ports {
                let stats = port.queue.stats();
                info!(
                    switch = switch_id,
                    port = port.queue.port(),
                    elephants = port.queue.num_elephants(),
                    enqueued = stats.enqueued_mice + stats.enqueued_elephant,
                    dequeued = stats.dequeued_mice + stats.dequeued_elephant,
                    drops = stats.drops(),
                    "queue"
                );
            }
        }
        info!(
            packets = self.summary.packets,
            cycles = self.summary.cycles,
            decoded = self.summary.decoded_flows,
            failures = self.summary.failures.len(),
            "replay done"
        );
        &self.summary
    }
}

/// Sends what the link had time for since the last drain.
fn drain(port: &mut Port, now: f64, link_rate: f64) {
    let elapsed = (now - port.last_drain).max(0.0);
    port.last_drain = now;
    port.credit += elapsed * link_rate;
    while port.credit > 0.0 {
        match port.queue.dequeue() {
            Some(sent) => port.credit -= sent.size as f64,
            None => {
                port.credit = 0.0;
                break;
            }
        }
    }
}
