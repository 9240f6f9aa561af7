//! Turns decoded flows into per-port queue configurations.
//!
//! For each port the decoded flows routed through it are sorted by bytes,
//! the top `elephant_fraction` become elephants and the mice FIFO gets the
//! mice share of the port's packets, inflated by `mice_expansion`.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RadarConfig;
use crate::decoder::DecodedBatch;
use crate::error::{RadarError, RadarResult};
use crate::flow::DecodedFlow;
use crate::queue::{Capacities, Classify, DiffQueue, ElephantSet, Occupancy};

/// Destination address to output port, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: Vec<(Ipv4Addr, usize)>,
    index: HashMap<Ipv4Addr, usize>,
}

impl RouteTable {
    /// Returns false if `dst` was already present.
    fn insert(&mut self, dst: Ipv4Addr, port: usize) -> Result<bool, usize> {
        match self.index.get(&dst) {
            Some(&existing) if existing == port => Ok(false),
            Some(&existing) => Err(existing),
            None => {
                self.index.insert(dst, port);
                self.entries.push((dst, port));
                Ok(true)
            }
        }
    }

    pub fn lookup(&self, dst: Ipv4Addr) -> Option<usize> {
        self.index.get(&dst).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (dst, port) in &self.entries {
            writeln!(f, "Dst {} Port {}", dst, port)?;
        }
        Ok(())
    }
}

/// Drop rate handed to the queue for each elephant flow.
pub trait DropRatePolicy: Send + Sync + Debug {
    fn drop_rate(&self, flow: &DecodedFlow, port: &PortStats) -> f32;
}

/// The same drop rate for every elephant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedDropRate(pub f32);

impl DropRatePolicy for FixedDropRate {
    fn drop_rate(&self, _flow: &DecodedFlow, _port: &PortStats) -> f32 {
        self.0
    }
}

/// Flows of one port after classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortStats {
    pub port: usize,
    /// Flows sorted by bytes, elephants first.
    pub sorted: Vec<DecodedFlow>,
    pub elephant_count: usize,
    pub elephant_packets: u64,
    pub elephant_bytes: u64,
    pub mice_packets: u64,
    pub mice_bytes: u64,
    /// Limits applied to the port queue.
    pub capacities: Capacities,
}

impl PortStats {
    pub fn total_flows(&self) -> usize {
        self.sorted.len()
    }

    pub fn mice_count(&self) -> usize {
        self.sorted.len() - self.elephant_count
    }

    pub fn elephants(&self) -> &[DecodedFlow] {
        &self.sorted[..self.elephant_count]
    }

    pub fn mice(&self) -> &[DecodedFlow] {
        &self.sorted[self.elephant_count..]
    }

    /// Mice fraction of the port's packets times `expansion`, at most 1.
    pub fn mice_share(&self, expansion: f64) -> f64 {
        let total = self.mice_packets + self.elephant_packets;
        if total == 0 {
            return 1.0;
        }
        (self.mice_packets as f64 / total as f64 * expansion).min(1.0)
    }
}

impl fmt::Display for PortStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "port {}: {} flows", self.port, self.total_flows())?;
        writeln!(
            f,
            "  elephant: {} flows, {} packets, {} bytes",
            self.elephant_count, self.elephant_packets, self.elephant_bytes
        )?;
        writeln!(
            f,
            "  mice:     {} flows, {} packets, {} bytes",
            self.mice_count(),
            self.mice_packets,
            self.mice_bytes
        )?;
        write!(f, "  capacity: mice {} elephant {}", self.capacities.mice, self.capacities.elephant)
    }
}

/// Sorts `flows` by bytes, descending and stable, and splits off the top
/// `floor(len * fraction)` as elephants.
pub fn classify(port: usize, mut flows: Vec<DecodedFlow>, elephant_fraction: f64) -> PortStats {
    flows.sort_by(|a, b| b.stats.bytes.cmp(&a.stats.bytes));
    let elephant_count = ((flows.len() as f64) * elephant_fraction).floor() as usize;
    let mut stats = PortStats {
        port,
        elephant_count: elephant_count.min(flows.len()),
        ..PortStats::default()
    };
    for (i, flow) in flows.iter().enumerate() {
        if i < stats.elephant_count {
            stats.elephant_packets += flow.stats.packets;
            stats.elephant_bytes += flow.stats.bytes;
        } else {
            stats.mice_packets += flow.stats.packets;
            stats.mice_bytes += flow.stats.bytes;
        }
    }
    stats.sorted = flows;
    stats
}

/// Splits `total` between the classes without shrinking either below what
/// it currently holds.
pub fn plan_capacities(total: usize, mice_share: f64, occupancy: Occupancy) -> Capacities {
    let target = (total as f64 * mice_share.clamp(0.0, 1.0)).floor() as usize;
    let mice = target.max(occupancy.mice);
    let elephant = total.saturating_sub(mice).max(occupancy.elephant);
    Capacities { mice, elephant }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerReport {
    pub switch_id: usize,
    pub time: f64,
    pub ports: Vec<PortStats>,
}

#[derive(Debug)]
struct SwitchState<P> {
    routes: RouteTable,
    ports: Vec<Arc<DiffQueue<P>>>,
}

#[derive(Debug)]
pub struct QueueController<P> {
    switches: HashMap<usize, SwitchState<P>>,
    elephant_fraction: f64,
    mice_expansion: f64,
    drop_rate: Box<dyn DropRatePolicy>,
}

impl<P: Classify> QueueController<P> {
    pub fn new(config: &RadarConfig) -> Self {
        Self {
            switches: HashMap::new(),
            elephant_fraction: config.elephant_fraction,
            mice_expansion: config.mice_expansion,
            drop_rate: Box::new(FixedDropRate(config.elephant_drop_rate)),
        }
    }

    pub fn with_drop_rate_policy(mut self, policy: Box<dyn DropRatePolicy>) -> Self {
        self.drop_rate = policy;
        self
    }

    pub fn register_switch(&mut self, switch_id: usize, ports: Vec<Arc<DiffQueue<P>>>) {
        self.switches.insert(
            switch_id,
            SwitchState {
                routes: RouteTable::default(),
                ports,
            },
        );
    }

    /// Adds a route. Re-adding a known destination with the same port is a
    /// no-op.
    pub fn add_route(&mut self, switch_id: usize, dst: Ipv4Addr, port: usize) -> RadarResult<()> {
        let switch = self
            .switches
            .get_mut(&switch_id)
            .ok_or(RadarError::UnknownSwitch(switch_id))?;
        if port >= switch.ports.len() {
            return Err(RadarError::UnknownPort { switch_id, port });
        }
        match switch.routes.insert(dst, port) {
            Ok(true) => {
                debug!(switch = switch_id, %dst, port, "route added");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(existing) => Err(RadarError::RouteConflict {
                switch_id,
                dst,
                existing,
                requested: port,
            }),
        }
    }

    pub fn route(&self, switch_id: usize, dst: Ipv4Addr) -> Option<usize> {
        self.switches.get(&switch_id)?.routes.lookup(dst)
    }

    pub fn route_table(&self, switch_id: usize) -> Option<&RouteTable> {
        self.switches.get(&switch_id).map(|s| &s.routes)
    }

    pub fn queue(&self, switch_id: usize, port: usize) -> Option<&Arc<DiffQueue<P>>> {
        self.switches.get(&switch_id)?.ports.get(port)
    }

    /// Groups the flows of `batch` per port, classifies them and applies
    /// the result to every port queue of the switch. Nothing is applied if
    /// any flow has no route.
    pub fn receive_decoded_flows(&self, batch: &DecodedBatch) -> RadarResult<ControllerReport> {
        let switch_id = batch.switch_id;
        let switch = self
            .switches
            .get(&switch_id)
            .ok_or(RadarError::UnknownSwitch(switch_id))?;

        let mut groups: Vec<Vec<DecodedFlow>> = vec![Vec::new(); switch.ports.len()];
        for flow in &batch.flows {
            let dst = flow.key.dst();
            let port = switch
                .routes
                .lookup(dst)
                .ok_or(RadarError::MissingRoute { switch_id, dst })?;
            groups[port].push(*flow);
        }

        let mut ports = Vec::with_capacity(groups.len());
        for (port, flows) in groups.into_iter().enumerate() {
            let mut stats = classify(port, flows, self.elephant_fraction);
            let elephants: ElephantSet = stats
                .elephants()
                .iter()
                .map(|f| (f.key, self.drop_rate.drop_rate(f, &stats)))
                .collect();
            let share = stats.mice_share(self.mice_expansion);
            let queue = &switch.ports[port];
            let total = queue.capacity();
            stats.capacities = queue.reconfigure(elephants, |occupancy| {
                plan_capacities(total, share, occupancy)
            });
            debug!(switch = switch_id, "{}", stats);
            ports.push(stats);
        }

        info!(
            switch = switch_id,
            time = batch.time,
            flows = batch.flows.len(),
            elephants = ports.iter().map(|p| p.elephant_count).sum::<usize>(),
            "queues reconfigured"
        );
        Ok(ControllerReport {
            switch_id,
            time: batch.time,
            ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowKey, FlowStats};
    use crate::queue::{DiffQueueConfig, Enqueue, TrafficClass};

    #[derive(Debug, Clone)]
    struct Pkt(FlowKey);

    impl Classify for Pkt {
        fn flow_key(&self) -> FlowKey {
            self.0
        }
        fn size(&self) -> u32 {
            100
        }
    }

    fn flow(src: u8, dst: u8, packets: u64, bytes: u64) -> DecodedFlow {
        DecodedFlow {
            key: FlowKey::new(
                Ipv4Addr::new(10, 0, 0, src),
                Ipv4Addr::new(10, 0, 1, dst),
                6,
                1000,
                80,
            ),
            stats: FlowStats::new(packets, bytes),
        }
    }

    fn controller(ports: usize) -> QueueController<Pkt> {
        let config = RadarConfig::for_testing();
        let mut ctl = QueueController::new(&config);
        let queues = (0..ports)
            .map(|p| Arc::new(DiffQueue::new(7, p, DiffQueueConfig::from(&config))))
            .collect();
        ctl.register_switch(7, queues);
        ctl
    }

    #[test]
    fn test_top_half_are_elephants() {
        let flows: Vec<_> = (0..10)
            .map(|i| flow(i, 1, 10 - i as u64, 1000 - 10 * i as u64))
            .collect();
        let stats = classify(0, flows.clone(), 0.5);
        assert_eq!(stats.elephant_count, 5);
        assert_eq!(stats.elephants(), &flows[..5]);
        assert_eq!(stats.mice(), &flows[5..]);
        assert_eq!(stats.elephant_packets, 10 + 9 + 8 + 7 + 6);
        assert_eq!(stats.mice_packets, 5 + 4 + 3 + 2 + 1);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let flows = vec![
            flow(1, 1, 1, 100),
            flow(2, 1, 1, 500),
            flow(3, 1, 1, 100),
            flow(4, 1, 1, 100),
        ];
        let stats = classify(0, flows.clone(), 0.5);
        assert_eq!(stats.elephants(), &[flows[1], flows[0]]);
        assert_eq!(stats.mice(), &[flows[2], flows[3]]);
        // deterministic on re-run
        assert_eq!(classify(0, flows, 0.5), stats);
    }

    #[test]
    fn test_odd_count_rounds_down() {
        let flows: Vec<_> = (0..3).map(|i| flow(i, 1, 1, 10 * (i as u64 + 1))).collect();
        assert_eq!(classify(0, flows, 0.5).elephant_count, 1);
        assert_eq!(classify(0, Vec::new(), 0.5).elephant_count, 0);
    }

    #[test]
    fn test_mice_share_expanded_and_clamped() {
        let mut stats = PortStats::default();
        stats.mice_packets = 25;
        stats.elephant_packets = 75;
        assert!((stats.mice_share(1.2) - 0.3).abs() < 1e-12);
        stats.mice_packets = 90;
        stats.elephant_packets = 10;
        assert_eq!(stats.mice_share(1.2), 1.0);
        assert_eq!(PortStats::default().mice_share(1.2), 1.0);
    }

    #[test]
    fn test_plan_respects_occupancy() {
        let caps = plan_capacities(150, 0.3, Occupancy::default());
        assert_eq!(caps, Capacities { mice: 45, elephant: 105 });
        let busy = Occupancy {
            mice: 60,
            elephant: 20,
            ..Occupancy::default()
        };
        let caps = plan_capacities(150, 0.3, busy);
        assert_eq!(caps, Capacities { mice: 60, elephant: 90 });
        let full = Occupancy {
            mice: 10,
            elephant: 140,
            ..Occupancy::default()
        };
        assert_eq!(plan_capacities(150, 1.0, full), Capacities { mice: 150, elephant: 140 });
    }

    #[test]
    fn test_routes() {
        let mut ctl = controller(2);
        let dst = Ipv4Addr::new(10, 0, 1, 1);
        ctl.add_route(7, dst, 1).unwrap();
        ctl.add_route(7, dst, 1).unwrap();
        assert_eq!(ctl.route_table(7).unwrap().len(), 1);
        assert_eq!(ctl.route(7, dst), Some(1));
        assert!(matches!(
            ctl.add_route(7, dst, 0),
            Err(RadarError::RouteConflict { existing: 1, .. })
        ));
        assert!(matches!(ctl.add_route(7, dst, 5), Err(RadarError::UnknownPort { port: 5, .. })));
        assert!(matches!(ctl.add_route(8, dst, 0), Err(RadarError::UnknownSwitch(8))));
        assert_eq!(ctl.route_table(7).unwrap().to_string(), "Dst 10.0.1.1 Port 1\n");
    }

    #[test]
    fn test_missing_route_is_fatal_and_applies_nothing() {
        let mut ctl = controller(1);
        ctl.add_route(7, Ipv4Addr::new(10, 0, 1, 1), 0).unwrap();
        let before = ctl.queue(7, 0).unwrap().capacities();
        let batch = DecodedBatch {
            switch_id: 7,
            time: 0.5,
            flows: vec![flow(1, 1, 10, 1000), flow(2, 2, 1, 10)],
        };
        let err = ctl.receive_decoded_flows(&batch).unwrap_err();
        assert!(matches!(err, RadarError::MissingRoute { switch_id: 7, .. }));
        assert!(err.is_fatal_for_cycle());
        assert_eq!(ctl.queue(7, 0).unwrap().capacities(), before);
        assert_eq!(ctl.queue(7, 0).unwrap().stats().reconfigurations, 0);
    }

    #[test]
    fn test_reconfigures_ports() {
        let mut ctl = controller(2);
        ctl.add_route(7, Ipv4Addr::new(10, 0, 1, 1), 0).unwrap();
        ctl.add_route(7, Ipv4Addr::new(10, 0, 1, 2), 1).unwrap();
        let big = flow(1, 1, 75, 75_000);
        let small = flow(2, 1, 25, 2_500);
        let other = flow(3, 2, 5, 500);
        let batch = DecodedBatch {
            switch_id: 7,
            time: 1.0,
            flows: vec![small, big, other],
        };
        let report = ctl.receive_decoded_flows(&batch).unwrap();
        assert_eq!(report.ports.len(), 2);

        let port0 = &report.ports[0];
        assert_eq!(port0.elephants(), &[big]);
        // 25 / 100 * 1.2 of 150 packets
        assert_eq!(port0.capacities, Capacities { mice: 45, elephant: 105 });
        let q0 = ctl.queue(7, 0).unwrap();
        assert!(q0.is_elephant(&big.key));
        assert_eq!(q0.enqueue(Pkt(big.key)), Enqueue::Queued(TrafficClass::Elephant));
        assert_eq!(q0.enqueue(Pkt(small.key)), Enqueue::Queued(TrafficClass::Mice));

        // a single flow rounds down to zero elephants: everything is mice
        let port1 = &report.ports[1];
        assert_eq!(port1.elephant_count, 0);
        assert_eq!(port1.capacities, Capacities { mice: 150, elephant: 0 });
    }

    #[test]
    fn test_custom_drop_rate_policy() {
        #[derive(Debug)]
        struct ByRank;
        impl DropRatePolicy for ByRank {
            fn drop_rate(&self, flow: &DecodedFlow, port: &PortStats) -> f32 {
                flow.stats.bytes as f32 / port.elephant_bytes.max(1) as f32
            }
        }
        let mut ctl = controller(1).with_drop_rate_policy(Box::new(ByRank));
        ctl.add_route(7, Ipv4Addr::new(10, 0, 1, 1), 0).unwrap();
        let batch = DecodedBatch {
            switch_id: 7,
            time: 0.5,
            flows: vec![flow(1, 1, 1, 100), flow(2, 1, 1, 10)],
        };
        let report = ctl.receive_decoded_flows(&batch).unwrap();
        assert_eq!(report.ports[0].elephant_count, 1);
    }
}
