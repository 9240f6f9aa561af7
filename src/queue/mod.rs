//! Two-class port queue.
//!
//! Packets of flows in the port's elephant set go to the elephant FIFO, all
//! others to the mice FIFO. Dequeues follow a fixed weighted round robin:
//! out of every `total_weight` turns, `mice_weight` belong to the mice FIFO.
//! A turn whose FIFO is empty is given to the other class.
//!
//! Classification set, capacities and both FIFOs sit behind one lock, so a
//! reconfiguration is never observed half applied.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::config::RadarConfig;
use crate::flow::FlowKey;

/// Flow key to AQM drop rate.
pub type ElephantSet = HashMap<FlowKey, f32>;

/// Anything the queue can classify.
pub trait Classify {
    fn flow_key(&self) -> FlowKey;
    fn size(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Mice,
    Elephant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    MiceFull,
    ElephantFull,
    /// Early drop of an elephant packet.
    Aqm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued(TrafficClass),
    Dropped(DropReason),
}

/// Per-class packet limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacities {
    pub mice: usize,
    pub elephant: usize,
}

/// Packets currently held per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub mice: usize,
    pub elephant: usize,
    pub mice_bytes: u64,
    pub elephant_bytes: u64,
}

impl Occupancy {
    pub fn packets(&self) -> usize {
        self.mice + self.elephant
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued_mice: u64,
    pub enqueued_elephant: u64,
    pub dequeued_mice: u64,
    pub dequeued_elephant: u64,
    pub steals: u64,
    pub dropped_mice_full: u64,
    pub dropped_elephant_full: u64,
    pub dropped_aqm: u64,
    pub reconfigurations: u64,
}

impl QueueStats {
    pub fn drops(&self) -> u64 {
        self.dropped_mice_full + self.dropped_elephant_full + self.dropped_aqm
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffQueueConfig {
    /// Packets across both classes.
    pub capacity: usize,
    pub initial_mice_capacity: usize,
    pub mice_weight: u16,
    pub total_weight: u16,
    pub aqm_threshold: f64,
    pub rng_seed: Option<u64>,
}

impl From<&RadarConfig> for DiffQueueConfig {
    fn from(config: &RadarConfig) -> Self {
        Self {
            capacity: config.queue_capacity,
            initial_mice_capacity: config.initial_mice_capacity,
            mice_weight: config.mice_weight,
            total_weight: config.total_weight,
            aqm_threshold: config.aqm_threshold,
            rng_seed: config.rng_seed,
        }
    }
}

#[derive(Debug)]
struct Fifo<P> {
    packets: VecDeque<P>,
    bytes: u64,
    max_packets: usize,
}

impl<P: Classify> Fifo<P> {
    fn new(max_packets: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            bytes: 0,
            max_packets,
        }
    }

    fn is_full(&self) -> bool {
        self.packets.len() >= self.max_packets
    }

    fn push(&mut self, packet: P) {
        self.bytes += packet.size() as u64;
        self.packets.push_back(packet);
    }

    fn pop(&mut self) -> Option<P> {
        let packet = self.packets.pop_front()?;
        self.bytes -= packet.size() as u64;
        Some(packet)
    }
}

#[derive(Debug)]
struct State<P> {
    mice: Fifo<P>,
    elephant: Fifo<P>,
    elephants: ElephantSet,
    turn: u16,
    stats: QueueStats,
    rng: StdRng,
}

#[derive(Debug)]
pub struct DiffQueue<P> {
    switch_id: usize,
    port: usize,
    config: DiffQueueConfig,
    state: Mutex<State<P>>,
}

impl<P: Classify> DiffQueue<P> {
    pub fn new(switch_id: usize, port: usize, config: DiffQueueConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ ((switch_id as u64) << 32) ^ port as u64),
            None => StdRng::from_entropy(),
        };
        let mice = config.initial_mice_capacity.min(config.capacity);
        Self {
            switch_id,
            port,
            config,
            state: Mutex::new(State {
                mice: Fifo::new(mice),
                elephant: Fifo::new(config.capacity - mice),
                elephants: ElephantSet::new(),
                turn: 0,
                stats: QueueStats::default(),
                rng,
            }),
        }
    }

    pub fn port(&self) -> usize {
        self.port
    }

    /// Packets held across both classes at most.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn enqueue(&self, packet: P) -> Enqueue {
        let key = packet.flow_key();
        let mut state = self.state.lock();
        let state = &mut *state;

        let result = match state.elephants.get(&key).copied() {
            None => {
                if state.mice.is_full() {
                    state.stats.dropped_mice_full += 1;
                    Enqueue::Dropped(DropReason::MiceFull)
                } else {
                    state.mice.push(packet);
                    state.stats.enqueued_mice += 1;
                    Enqueue::Queued(TrafficClass::Mice)
                }
            }
            Some(drop_rate) => {
                let fifo = &mut state.elephant;
                if fifo.is_full() {
                    state.stats.dropped_elephant_full += 1;
                    Enqueue::Dropped(DropReason::ElephantFull)
                } else if fifo.packets.len() as f64
                    >= self.config.aqm_threshold * fifo.max_packets as f64
                    && state.rng.gen::<f32>() < drop_rate
                {
                    state.stats.dropped_aqm += 1;
                    Enqueue::Dropped(DropReason::Aqm)
                } else {
                    fifo.push(packet);
                    state.stats.enqueued_elephant += 1;
                    Enqueue::Queued(TrafficClass::Elephant)
                }
            }
        };
        match result {
            Enqueue::Dropped(reason) => {
                debug!(
                    switch = self.switch_id,
                    port = self.port,
                    flow = %key,
                    ?reason,
                    "packet dropped"
                )
            }
            Enqueue::Queued(class) => {
                trace!(
                    switch = self.switch_id,
                    port = self.port,
                    flow = %key,
                    ?class,
                    "packet queued"
                )
            }
        }
        result
    }

    pub fn dequeue(&self) -> Option<P> {
        let mut state = self.state.lock();
        if state.mice.packets.is_empty() && state.elephant.packets.is_empty() {
            return None;
        }
        let mice_turn = state.turn < self.config.mice_weight;
        let take_mice = (mice_turn && !state.mice.packets.is_empty())
            || (!mice_turn && state.elephant.packets.is_empty());
        let packet = if take_mice {
            state.stats.dequeued_mice += 1;
            state.mice.pop()
        } else {
            state.stats.dequeued_elephant += 1;
            state.elephant.pop()
        };
        if take_mice != mice_turn {
            state.stats.steals += 1;
        }
        state.turn = (state.turn + 1) % self.config.total_weight;
        packet
    }

    /// Replaces the elephant set and the per-class limits. `plan` sees the
    /// occupancy under the same lock the new limits are applied with.
    pub fn reconfigure<F>(&self, elephants: ElephantSet, plan: F) -> Capacities
    where
        F: FnOnce(Occupancy) -> Capacities,
    {
        let mut state = self.state.lock();
        let occupancy = occupancy_of(&state);
        let mut caps = plan(occupancy);
        if caps.mice < occupancy.mice || caps.elephant < occupancy.elephant {
            warn!(
                switch = self.switch_id,
                port = self.port,
                ?caps,
                ?occupancy,
                "capacity plan below occupancy, keeping queued packets"
            );
            caps.mice = caps.mice.max(occupancy.mice);
            caps.elephant = caps.elephant.max(occupancy.elephant);
        }
        state.mice.max_packets = caps.mice;
        state.elephant.max_packets = caps.elephant;
        state.elephants = elephants;
        state.stats.reconfigurations += 1;
        caps
    }

    pub fn capacities(&self) -> Capacities {
        let state = self.state.lock();
        Capacities {
            mice: state.mice.max_packets,
            elephant: state.elephant.max_packets,
        }
    }

    pub fn occupancy(&self) -> Occupancy {
        occupancy_of(&self.state.lock())
    }

    pub fn len(&self) -> usize {
        self.occupancy().packets()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    pub fn is_elephant(&self, key: &FlowKey) -> bool {
        self.state.lock().elephants.contains_key(key)
    }

    pub fn num_elephants(&self) -> usize {
        self.state.lock().elephants.len()
    }
}

fn occupancy_of<P>(state: &State<P>) -> Occupancy {
    Occupancy {
        mice: state.mice.packets.len(),
        elephant: state.elephant.packets.len(),
        mice_bytes: state.mice.bytes,
        elephant_bytes: state.elephant.bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[derive(Debug, Clone, PartialEq)]
    struct Pkt(FlowKey, u32);

    impl Classify for Pkt {
        fn flow_key(&self) -> FlowKey {
            self.0
        }
        fn size(&self) -> u32 {
            self.1
        }
    }

    fn key(i: u8) -> FlowKey {
        FlowKey::new(Ipv4Addr::new(10, 0, 0, i), Ipv4Addr::new(10, 0, 1, 1), 6, 1000, 80)
    }

    fn config(capacity: usize, mice: usize) -> DiffQueueConfig {
        DiffQueueConfig {
            capacity,
            initial_mice_capacity: mice,
            mice_weight: 5,
            total_weight: 10,
            aqm_threshold: 0.8,
            rng_seed: Some(1),
        }
    }

    fn elephants(keys: &[(u8, f32)]) -> ElephantSet {
        keys.iter().map(|(k, r)| (key(*k), *r)).collect()
    }

    fn keep(caps: Capacities) -> impl FnOnce(Occupancy) -> Capacities {
        move |_| caps
    }

    #[test]
    fn test_classifies_by_elephant_set() {
        let q = DiffQueue::new(0, 0, config(150, 100));
        q.reconfigure(elephants(&[(2, 0.0)]), keep(Capacities { mice: 100, elephant: 50 }));
        assert_eq!(q.enqueue(Pkt(key(1), 100)), Enqueue::Queued(TrafficClass::Mice));
        assert_eq!(q.enqueue(Pkt(key(2), 100)), Enqueue::Queued(TrafficClass::Elephant));
        assert!(q.is_elephant(&key(2)));
        let occ = q.occupancy();
        assert_eq!((occ.mice, occ.elephant), (1, 1));
        assert_eq!(occ.mice_bytes, 100);
    }

    #[test]
    fn test_full_fifo_drops() {
        let q = DiffQueue::new(0, 0, config(3, 2));
        q.reconfigure(elephants(&[(9, 0.0)]), keep(Capacities { mice: 2, elephant: 1 }));
        assert!(matches!(q.enqueue(Pkt(key(1), 1)), Enqueue::Queued(_)));
        assert!(matches!(q.enqueue(Pkt(key(1), 1)), Enqueue::Queued(_)));
        assert_eq!(q.enqueue(Pkt(key(1), 1)), Enqueue::Dropped(DropReason::MiceFull));
        assert!(matches!(q.enqueue(Pkt(key(9), 1)), Enqueue::Queued(_)));
        assert_eq!(q.enqueue(Pkt(key(9), 1)), Enqueue::Dropped(DropReason::ElephantFull));
        let stats = q.stats();
        assert_eq!(stats.dropped_mice_full, 1);
        assert_eq!(stats.dropped_elephant_full, 1);
        assert_eq!(stats.drops(), 2);
    }

    #[test]
    fn test_aqm_only_above_threshold() {
        let q = DiffQueue::new(0, 0, config(10, 0));
        q.reconfigure(elephants(&[(1, 1.0)]), keep(Capacities { mice: 0, elephant: 10 }));
        // below 8 packets the drop rate is ignored
        for _ in 0..8 {
            assert_eq!(q.enqueue(Pkt(key(1), 1)), Enqueue::Queued(TrafficClass::Elephant));
        }
        // at 80% a drop rate of 1 drops everything
        assert_eq!(q.enqueue(Pkt(key(1), 1)), Enqueue::Dropped(DropReason::Aqm));
        assert_eq!(q.stats().dropped_aqm, 1);
    }

    #[test]
    fn test_zero_drop_rate_never_aqm_drops() {
        let q = DiffQueue::new(0, 0, config(10, 0));
        q.reconfigure(elephants(&[(1, 0.0)]), keep(Capacities { mice: 0, elephant: 10 }));
        for _ in 0..10 {
            assert!(matches!(q.enqueue(Pkt(key(1), 1)), Enqueue::Queued(_)));
        }
        assert_eq!(q.enqueue(Pkt(key(1), 1)), Enqueue::Dropped(DropReason::ElephantFull));
        assert_eq!(q.stats().dropped_aqm, 0);
    }

    #[test]
    fn test_weighted_round_robin_ratio() {
        let mut cfg = config(200, 100);
        cfg.mice_weight = 3;
        let q = DiffQueue::new(0, 0, cfg);
        q.reconfigure(elephants(&[(2, 0.0)]), keep(Capacities { mice: 100, elephant: 100 }));
        for _ in 0..50 {
            q.enqueue(Pkt(key(1), 1));
            q.enqueue(Pkt(key(2), 1));
        }
        let mut mice = 0;
        for _ in 0..10 {
            if q.dequeue().unwrap().0 == key(1) {
                mice += 1;
            }
        }
        assert_eq!(mice, 3);
        assert_eq!(q.stats().steals, 0);
    }

    #[test]
    fn test_steal_when_class_empty() {
        let q = DiffQueue::new(0, 0, config(150, 100));
        q.reconfigure(elephants(&[(2, 0.0)]), keep(Capacities { mice: 100, elephant: 50 }));
        for _ in 0..4 {
            q.enqueue(Pkt(key(2), 1));
        }
        // mice turns with an empty mice FIFO steal from the elephants
        for _ in 0..4 {
            assert_eq!(q.dequeue().unwrap().0, key(2));
        }
        assert_eq!(q.stats().steals, 4);
        assert!(q.dequeue().is_none());
        // the failed dequeue did not advance the turn: 4 turns used so far
        q.enqueue(Pkt(key(1), 1));
        q.enqueue(Pkt(key(2), 1));
        assert_eq!(q.dequeue().unwrap().0, key(1));
    }

    #[test]
    fn test_reconfigure_never_below_occupancy() {
        let q = DiffQueue::new(0, 0, config(10, 5));
        for _ in 0..5 {
            q.enqueue(Pkt(key(1), 1));
        }
        let caps = q.reconfigure(ElephantSet::new(), keep(Capacities { mice: 2, elephant: 8 }));
        assert_eq!(caps.mice, 5);
        assert_eq!(q.len(), 5);
        assert_eq!(q.capacities(), caps);
    }

    #[test]
    fn test_reconfigure_replaces_set() {
        let q: DiffQueue<Pkt> = DiffQueue::new(0, 0, config(10, 5));
        q.reconfigure(elephants(&[(1, 0.0), (2, 0.0)]), keep(Capacities { mice: 5, elephant: 5 }));
        q.reconfigure(elephants(&[(3, 0.0)]), keep(Capacities { mice: 5, elephant: 5 }));
        assert!(!q.is_elephant(&key(1)));
        assert!(q.is_elephant(&key(3)));
        assert_eq!(q.num_elephants(), 1);
        assert_eq!(q.stats().reconfigurations, 2);
    }
}
