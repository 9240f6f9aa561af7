//! Replays a pcap capture as a stream of `(time, FlowKey, size)` records.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use packet::ether::Packet as EthernetPacket;
use packet::ip::Packet as IpPacket;
use packet::ip::v4::Packet as Ipv4Packet;
use packet::tcp::Packet as TcpPacket;
use packet::udp::Packet as UdpPacket;
use packet::Packet;
use pcap_parser::data::{get_packetdata, PacketData};
use pcap_parser::{Capture, PcapBlock, PcapCapture};
use tracing::{debug, info};

use crate::error::{RadarError, RadarResult};
use crate::flow::{FlowKey, PROTO_TCP, PROTO_UDP};
use crate::queue::Classify;

/// One replayed packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracePacket {
    /// Seconds since the epoch of the capture.
    pub time: f64,
    pub key: FlowKey,
    /// Bytes on the wire.
    pub size: u32,
}

impl Classify for TracePacket {
    fn flow_key(&self) -> FlowKey {
        self.key
    }

    fn size(&self) -> u32 {
        self.size
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub packets: Vec<TracePacket>,
    /// Frames that were not IPv4 TCP/UDP or could not be parsed.
    pub skipped: usize,
}

pub fn read_trace<P: AsRef<Path>>(path: P) -> RadarResult<Trace> {
    let mut buffer = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut buffer)?;
    let trace = parse_capture(&buffer)?;
    info!(
        path = %path.as_ref().display(),
        packets = trace.packets.len(),
        skipped = trace.skipped,
        "trace loaded"
    );
    Ok(trace)
}

/// Parses a legacy pcap capture held in memory.
pub fn parse_capture(buffer: &[u8]) -> RadarResult<Trace> {
    let capture =
        PcapCapture::from_file(buffer).map_err(|e| RadarError::Trace(format!("{:?}", e)))?;
    let mut linktype = capture.header.network;
    let mut trace = Trace::default();
    for block in capture.iter() {
        match block {
            PcapBlock::LegacyHeader(header) => linktype = header.network,
            PcapBlock::Legacy(record) => {
                let parsed = get_packetdata(record.data, linktype, record.caplen as usize)
                    .and_then(flow_key);
                match parsed {
                    Some(key) => trace.packets.push(TracePacket {
                        time: record.ts_sec as f64 + record.ts_usec as f64 / 1_000_000.0,
                        key,
                        size: record.origlen,
                    }),
                    None => trace.skipped += 1,
                }
            }
            PcapBlock::NG(_) => {
                debug!("pcapng block ignored");
                trace.skipped += 1;
            }
        }
    }
    Ok(trace)
}

/// Extracts the 5-tuple of an IPv4 TCP or UDP packet.
pub fn flow_key(data: PacketData) -> Option<FlowKey> {
    match data {
        PacketData::L2(frame) => {
            let ether = EthernetPacket::new(frame).ok()?;
            if ether.protocol() != packet::ether::Protocol::Ipv4 {
                return None;
            }
            ipv4_key(ether.payload())
        }
        PacketData::L3(_, datagram) => ipv4_key(datagram),
        PacketData::L4(_, _) | PacketData::Unsupported(_) => None,
    }
}

fn ipv4_key(datagram: &[u8]) -> Option<FlowKey> {
    let ip = match IpPacket::unchecked(datagram) {
        IpPacket::V4(p) => p,
        _ => return None,
    };
    let (proto, src_port, dst_port) = ports(&ip)?;
    Some(FlowKey::new(ip.source(), ip.destination(), proto, src_port, dst_port))
}

fn ports(ip: &Ipv4Packet<&[u8]>) -> Option<(u8, u16, u16)> {
    let payload = ip.payload();
    match ip.protocol() {
        packet::ip::Protocol::Tcp => {
            let tcp = TcpPacket::new(payload).ok()?;
            Some((PROTO_TCP, tcp.source(), tcp.destination()))
        }
        packet::ip::Protocol::Udp => match UdpPacket::new(payload) {
            Ok(udp) => Some((PROTO_UDP, udp.source(), udp.destination())),
            // truncated captures still carry the port words
            Err(_) if payload.len() >= 4 => Some((
                PROTO_UDP,
                u16::from_be_bytes([payload[0], payload[1]]),
                u16::from_be_bytes([payload[2], payload[3]]),
            )),
            Err(_) => None,
        },
        _ => None,
    }
}
