use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use MatrixRadar::decoder::SketchDecoder;
use MatrixRadar::hashing::{FlowHasher, HashRole};
use MatrixRadar::output::FlowWriter;
use MatrixRadar::queue::{Capacities, DiffQueueConfig};
use MatrixRadar::sim::Simulation;
use MatrixRadar::trace::read_trace;
use MatrixRadar::{DiffQueue, FlowKey, FlowStats, QueueController, RadarConfig, SketchEncoder};

/// Places flows on fixed cells of block 0.
#[derive(Debug)]
struct ScriptedHasher {
    cells: HashMap<FlowKey, Vec<u64>>,
}

impl FlowHasher for ScriptedHasher {
    fn hash(&self, key: &FlowKey, role: HashRole) -> u64 {
        match role {
            HashRole::Block => 0,
            HashRole::Cell(k) => self.cells[key][k as usize],
            HashRole::Novelty(i) => (key.src_addr as u64) * 31 + i as u64,
        }
    }
}

fn key(src: u8) -> FlowKey {
    FlowKey::new(
        Ipv4Addr::new(10, 0, 0, src),
        Ipv4Addr::new(10, 0, 1, 1),
        6,
        40000 + src as u16,
        80,
    )
}

fn shared_cell_config() -> RadarConfig {
    RadarConfig {
        num_blocks: 1,
        cells_per_block: 4,
        cell_hashes: 2,
        flow_table_capacity: 4,
        filter_size: 1 << 16,
        filter_hashes: 2,
        period: 1.0,
        ..RadarConfig::for_testing()
    }
}

#[test]
fn test_shared_cell_decodes_exactly() {
    let (a, b) = (key(1), key(2));
    let mut cells = HashMap::new();
    cells.insert(a, vec![0, 1]);
    cells.insert(b, vec![0, 2]);
    let config = shared_cell_config();
    let encoder =
        SketchEncoder::with_hasher(0, &config, Arc::new(ScriptedHasher { cells })).into_shared();

    for i in 0..10 {
        encoder.lock().record_packet(a, 100);
        if i % 3 == 0 && i < 9 {
            encoder.lock().record_packet(b, 50);
        }
    }
    assert_eq!(encoder.lock().packets_received(), 13);

    let mut decoder = SketchDecoder::new(config.period, None);
    decoder.add_encoder(encoder.clone());
    decoder.start(0.0);
    assert!(decoder.poll(0.5).is_none());
    let report = decoder.poll(1.0).unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(report.batches.len(), 1);

    let mut flows = report.batches[0].flows.clone();
    flows.sort_by_key(|f| f.key);
    assert_eq!(flows.len(), 2);
    assert_eq!((flows[0].key, flows[0].stats), (a, FlowStats::new(10, 1000)));
    assert_eq!((flows[1].key, flows[1].stats), (b, FlowStats::new(3, 150)));
    let packets: u64 = flows.iter().map(|f| f.stats.packets).sum();
    let bytes: u64 = flows.iter().map(|f| f.stats.bytes).sum();
    assert_eq!((packets, bytes), (13, 1150));
    assert_eq!(report.accuracy[0].1.num_exact, 2);

    // the next period starts empty
    assert_eq!(encoder.lock().packets_received(), 0);
    assert_eq!(encoder.lock().sketch().num_flows(), 0);

    // A is the elephant; mice get 3 / 13 * 1.2 of the queue
    let mut controller = QueueController::new(&config);
    let queue = Arc::new(DiffQueue::<MatrixRadar::trace::TracePacket>::new(
        0,
        0,
        DiffQueueConfig::from(&config),
    ));
    controller.register_switch(0, vec![queue.clone()]);
    controller.add_route(0, Ipv4Addr::new(10, 0, 1, 1), 0).unwrap();
    let stats = controller.receive_decoded_flows(&report.batches[0]).unwrap();
    assert_eq!(stats.ports[0].elephants()[0].key, a);
    assert!(queue.is_elephant(&a));
    assert!(!queue.is_elephant(&b));
    assert_eq!(queue.capacities(), Capacities { mice: 41, elephant: 109 });
}

fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: usize) -> Vec<u8> {
    let mut frame = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2, 0x08, 0x00];
    let total = (40 + payload) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, 6, 0x00, 0x00]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&sport.to_be_bytes());
    frame.extend_from_slice(&dport.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    frame.extend(std::iter::repeat(0u8).take(payload));
    frame
}

fn pcap(records: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    for word in [0u32, 0, 65535, 1] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    for (sec, usec, frame) in records {
        for word in [*sec, *usec, frame.len() as u32, frame.len() as u32] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(frame);
    }
    out
}

#[test]
fn test_pcap_replay_writes_flow_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut records = Vec::new();
    for i in 0..30u32 {
        let usec = i * 50_000;
        let (sec, usec) = (10 + usec / 1_000_000, usec % 1_000_000);
        records.push((sec, usec, tcp_frame([10, 0, 0, 1], [10, 0, 9, 1], 5000, 80, 1000)));
        if i % 5 == 0 {
            let src = [10, 0, 0, 2 + (i / 5) as u8];
            records.push((sec, usec + 1, tcp_frame(src, [10, 0, 9, 2], 6000, 443, 10)));
        }
    }
    let capture = dir.path().join("trace.pcap");
    std::fs::write(&capture, pcap(&records)).unwrap();
    let trace = read_trace(&capture).unwrap();
    assert_eq!(trace.packets.len(), 36);
    assert_eq!(trace.skipped, 0);

    let out = dir.path().join("out");
    let config = RadarConfig {
        num_blocks: 2,
        cells_per_block: 128,
        cell_hashes: 3,
        flow_table_capacity: 128,
        ports_per_switch: 2,
        period: 0.5,
        output_dir: Some(out.clone()),
        ..RadarConfig::for_testing()
    };
    let mut sim = Simulation::new(config, 1).unwrap();
    let summary = sim.run(trace.packets);
    assert!(summary.is_success(), "{:?}", summary.failures);
    assert_eq!(summary.packets, 36);
    // the replay spans 1.45 s: cycles at 0.5, 1.0 and the closing one at 1.5
    assert_eq!(summary.cycles, 3);

    let writer = FlowWriter::new(&out).unwrap();
    for time in [0.5, 1.0, 1.5] {
        let measured = std::fs::read_to_string(writer.flow_path(0, time, "measured")).unwrap();
        let real = std::fs::read_to_string(writer.flow_path(0, time, "real")).unwrap();
        let mut measured: Vec<_> = measured.lines().collect();
        let mut real: Vec<_> = real.lines().collect();
        measured.sort();
        real.sort();
        assert_eq!(measured, real);
    }
    let first = std::fs::read_to_string(writer.flow_path(0, 0.5, "real")).unwrap();
    assert!(first.contains("10.0.0.1 10.0.9.1 TCP 5000 80 10 10540"));
}

#[test]
fn test_offline_mode_dumps_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let config = RadarConfig {
        offline: true,
        output_dir: Some(dir.path().to_path_buf()),
        period: 1.0,
        ..RadarConfig::for_testing()
    };
    let mut sim = Simulation::new(config.clone(), 1).unwrap();
    let packets = (0..5).map(|i| MatrixRadar::trace::TracePacket {
        time: i as f64 * 0.1,
        key: key(i as u8),
        size: 100,
    });
    let summary = sim.run(packets);
    assert!(summary.is_success());
    assert_eq!(summary.decoded_flows, 0);
    let writer = FlowWriter::new(dir.path()).unwrap();
    for block in 0..config.num_blocks {
        let dump = std::fs::read_to_string(writer.block_path(0, 1.0, block)).unwrap();
        assert!(dump.starts_with("flows "));
        assert!(dump.contains("counters\n"));
    }
}
