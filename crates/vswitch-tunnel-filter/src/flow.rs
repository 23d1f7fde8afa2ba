//! Flow keys and classification verdicts
//!
//! The flow key identifies the *encapsulation* flow: the outer 5-tuple of a
//! tunnel packet, used consistently between classify-time lookup and
//! flow-teardown invalidation.

/// IANA-assigned VXLAN UDP port
pub const VXLAN_UDP_PORT: u16 = 4789;
/// IANA-assigned Geneve UDP port
pub const GENEVE_UDP_PORT: u16 = 6081;
/// STT TCP port
pub const STT_TCP_PORT: u16 = 7471;
/// GRE IP protocol number
pub const GRE_PROTOCOL: u8 = 47;

const TCP: u8 = 6;
const UDP: u8 = 17;

/// Packet metadata handed to the classifier by the filtering engine.
///
/// Only the outer headers matter here; inner (encapsulated) headers are the
/// datapath's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Outer source IP (IPv4 as u32)
    pub src_ip: u32,
    /// Outer destination IP
    pub dst_ip: u32,
    /// Outer source port
    pub src_port: u16,
    /// Outer destination port
    pub dst_port: u16,
    /// IP protocol (TCP=6, UDP=17, GRE=47)
    pub protocol: u8,
    /// Total packet length
    pub len: u16,
}

/// Outer 5-tuple flow key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source IP (IPv4 as u32)
    pub src_ip: u32,
    /// Destination IP
    pub dst_ip: u32,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol
    pub protocol: u8,
}

impl FlowKey {
    /// Create new flow key
    #[inline(always)]
    pub const fn new(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Key of the outer headers of `packet`
    #[inline(always)]
    pub const fn from_packet(packet: &PacketMeta) -> Self {
        Self::new(
            packet.src_ip,
            packet.dst_ip,
            packet.src_port,
            packet.dst_port,
            packet.protocol,
        )
    }

    /// Compute hash using FNV-1a (fast, good distribution)
    #[inline(always)]
    pub fn hash64(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        let words = [
            self.src_ip as u64,
            self.dst_ip as u64,
            ((self.src_port as u64) << 24) | ((self.dst_port as u64) << 8) | self.protocol as u64,
        ];
        for w in words {
            let mut w = w;
            while w != 0 {
                h ^= w & 0xff;
                h = h.wrapping_mul(FNV_PRIME);
                w >>= 8;
            }
            h ^= 0xff;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    /// Create reverse (reply) flow key
    #[inline(always)]
    pub const fn reverse(&self) -> Self {
        Self::new(
            self.dst_ip,
            self.src_ip,
            self.dst_port,
            self.src_port,
            self.protocol,
        )
    }
}

/// Tunnel encapsulation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    /// VXLAN over UDP
    Vxlan,
    /// Geneve over UDP
    Geneve,
    /// GRE (IP protocol 47)
    Gre,
    /// Stateless Transport Tunneling over TCP
    Stt,
}

impl TunnelKind {
    /// Cheap tunnel detection from outer headers.
    ///
    /// This is the fast-reject gate on the packet path: no allocation, no
    /// table access. Non-tunnel traffic (the vast majority) returns `None`.
    #[inline(always)]
    pub const fn detect(packet: &PacketMeta) -> Option<TunnelKind> {
        match packet.protocol {
            UDP => match packet.dst_port {
                VXLAN_UDP_PORT => Some(TunnelKind::Vxlan),
                GENEVE_UDP_PORT => Some(TunnelKind::Geneve),
                _ => None,
            },
            TCP => match packet.dst_port {
                STT_TCP_PORT => Some(TunnelKind::Stt),
                _ => None,
            },
            GRE_PROTOCOL => Some(TunnelKind::Gre),
            _ => None,
        }
    }
}

/// Classification verdict returned to the filtering engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    /// Not ours; continue normal processing
    Continue = 0,
    /// Tunnel flow, let it pass untouched
    Permit = 1,
    /// Tunnel flow, drop it
    Block = 2,
    /// Tunnel flow, handed to the switch datapath
    Redirect = 3,
}

/// Where a classified tunnel flow should be steered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Hand packets to the switch datapath on the given ingress port
    Datapath {
        /// Datapath ingress port number
        port: u32,
    },
    /// Classified but left on the normal stack path
    PassThrough,
    /// Drop packets for this flow
    Drop,
}
