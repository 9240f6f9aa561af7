use std::fmt;
use std::net::Ipv4Addr;

pub const PROTO_TCP: u8 = 0x06;
pub const PROTO_UDP: u8 = 0x11;

/// The 5-tuple identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowKey {
    pub const ENCODED_LEN: usize = 13;

    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, src_port: u16, dst_port: u16) -> FlowKey {
        FlowKey {
            src_addr: u32::from(src),
            dst_addr: u32::from(dst),
            src_port,
            dst_port,
            proto,
        }
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }

    /// Canonical byte layout fed to every sketch hash.
    pub fn to_bytes(&self) -> [u8; FlowKey::ENCODED_LEN] {
        let mut buf = [0u8; FlowKey::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.src_addr.to_be_bytes());
        buf[4..8].copy_from_slice(&self.dst_addr.to_be_bytes());
        buf[8..10].copy_from_slice(&self.src_port.to_be_bytes());
        buf[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[12] = self.proto;
        buf
    }

    pub fn proto_name(&self) -> String {
        match self.proto {
            PROTO_TCP => "TCP".to_string(),
            PROTO_UDP => "UDP".to_string(),
            p => p.to_string(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.src(),
            self.dst(),
            self.proto_name(),
            self.src_port,
            self.dst_port
        )
    }
}

/// Packet and byte counters of one flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowStats {
    pub packets: u64,
    pub bytes: u64,
}

impl FlowStats {
    pub fn new(packets: u64, bytes: u64) -> FlowStats {
        FlowStats { packets, bytes }
    }

    pub fn record(&mut self, bytes: u32) {
        self.packets += 1;
        self.bytes += bytes as u64;
    }
}

impl std::ops::AddAssign for FlowStats {
    fn add_assign(&mut self, rhs: FlowStats) {
        self.packets += rhs.packets;
        self.bytes += rhs.bytes;
    }
}

/// One counter of a block's count table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterCell {
    pub packets: u64,
    pub bytes: u64,
    pub new_flows: u32,
}

impl CounterCell {
    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }
}

impl fmt::Display for CounterCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PckCnt {} ByteCnt {} FlowCnt {}", self.packets, self.bytes, self.new_flows)
    }
}

/// A flow reconstructed by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFlow {
    pub key: FlowKey,
    pub stats: FlowStats,
}
