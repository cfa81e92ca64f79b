//! Packet kinds exchanged between simulated nodes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::header::{Gos, Ipv4Header, IPV4_HEADER_SIZE};
use crate::label::{Label, LabelStack, GOS_MARKER_LABEL, LABEL_ENTRY_SIZE};

/// TCP header size carried by TLDP messages
pub const TCP_HEADER_SIZE: u32 = 20;

/// TLDP message body size
pub const TLDP_BODY_SIZE: u32 = 8;

/// GPSRP message body size
pub const GPSRP_BODY_SIZE: u32 = 12;

/// Discriminant of a packet, used by events and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Plain IPv4
    Ipv4,
    /// IPv4 carrying a GoS request
    Ipv4Gos,
    /// MPLS frame
    Mpls,
    /// MPLS frame carrying the GoS marker
    MplsGos,
    /// Label distribution signaling
    Tldp,
    /// Local recovery signaling
    Gpsrp,
    /// Anything the routers do not speak
    Raw,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Ipv4 => write!(f, "IPv4"),
            PacketKind::Ipv4Gos => write!(f, "IPv4-GoS"),
            PacketKind::Mpls => write!(f, "MPLS"),
            PacketKind::MplsGos => write!(f, "MPLS-GoS"),
            PacketKind::Tldp => write!(f, "TLDP"),
            PacketKind::Gpsrp => write!(f, "GPSRP"),
            PacketKind::Raw => write!(f, "raw"),
        }
    }
}

/// IPv4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    /// Header
    pub header: Ipv4Header,
    /// Opaque payload
    pub payload: Bytes,
}

impl Ipv4Packet {
    /// Create a packet
    pub fn new(header: Ipv4Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Size in octets
    pub fn size(&self) -> u32 {
        IPV4_HEADER_SIZE + self.payload.len() as u32
    }

    /// Requested GoS
    pub fn gos(&self) -> Gos {
        self.header.options.gos
    }
}

/// MPLS frame: an IPv4 packet below a label stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsPacket {
    /// Encapsulated IPv4 header
    pub header: Ipv4Header,
    /// Label stack
    pub label_stack: LabelStack,
    /// Opaque payload
    pub payload: Bytes,
}

impl MplsPacket {
    /// Wrap an IPv4 packet with an empty label stack
    pub fn from_ipv4(packet: Ipv4Packet) -> Self {
        Self {
            header: packet.header,
            label_stack: LabelStack::new(),
            payload: packet.payload,
        }
    }

    /// Unwrap the encapsulated IPv4 packet
    pub fn into_ipv4(self) -> Ipv4Packet {
        Ipv4Packet {
            header: self.header,
            payload: self.payload,
        }
    }

    /// Size in octets
    pub fn size(&self) -> u32 {
        IPV4_HEADER_SIZE + self.label_stack.len() as u32 * LABEL_ENTRY_SIZE + self.payload.len() as u32
    }

    /// Whether the top label is the GoS marker
    pub fn has_gos_marker(&self) -> bool {
        self.label_stack
            .top()
            .map(|entry| entry.label == GOS_MARKER_LABEL)
            .unwrap_or(false)
    }
}

/// TLDP message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TldpKind {
    /// Ask the downstream neighbour for a label toward a tail end
    LabelRequest,
    /// Downstream grants the label
    LabelRequestOk,
    /// Downstream refuses
    LabelRequestDenied,
    /// Tear down a label
    LabelRemovalRequest,
    /// Teardown acknowledged
    LabelRemovalRequestOk,
}

impl fmt::Display for TldpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TldpKind::LabelRequest => write!(f, "label request"),
            TldpKind::LabelRequestOk => write!(f, "label request ok"),
            TldpKind::LabelRequestDenied => write!(f, "label request denied"),
            TldpKind::LabelRemovalRequest => write!(f, "label removal request"),
            TldpKind::LabelRemovalRequestOk => write!(f, "label removal request ok"),
        }
    }
}

/// Which way a TLDP message travels along the LSP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TldpDirection {
    /// Toward the tail end (downstream)
    Forward,
    /// Toward the head end (upstream)
    Backward,
    /// Toward the head end of a backup LSP
    BackwardBackup,
}

/// TLDP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TldpPacket {
    /// Header, addressed to the adjacent neighbour
    pub header: Ipv4Header,
    /// Message kind
    pub kind: TldpKind,
    /// Direction tag
    pub direction: TldpDirection,
    /// Session identifier of the sending side of the exchange
    pub session_id: u32,
    /// Tail end the LSP routes toward
    pub target: Ipv4Addr,
    /// Advertised label (LabelRequestOk only)
    pub label: Option<Label>,
    /// The request builds a backup LSP
    pub for_backup: bool,
}

impl TldpPacket {
    /// Size in octets
    pub fn size(&self) -> u32 {
        IPV4_HEADER_SIZE + TCP_HEADER_SIZE + TLDP_BODY_SIZE
    }
}

/// GPSRP message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpsrpKind {
    /// Ask an active node to resend a cached frame
    RetransmissionRequest,
    /// The frame was resent
    RetransmissionOk,
    /// The frame is not cached
    RetransmissionNotPossible,
}

impl fmt::Display for GpsrpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpsrpKind::RetransmissionRequest => write!(f, "retransmission request"),
            GpsrpKind::RetransmissionOk => write!(f, "retransmission ok"),
            GpsrpKind::RetransmissionNotPossible => write!(f, "retransmission not possible"),
        }
    }
}

/// GPSRP message, routed hop by hop toward its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsrpPacket {
    /// Header
    pub header: Ipv4Header,
    /// Message kind
    pub kind: GpsrpKind,
    /// Flow of the lost frame
    pub flow_id: u32,
    /// Identifier of the lost frame
    pub packet_id: u64,
}

impl GpsrpPacket {
    /// Size in octets
    pub fn size(&self) -> u32 {
        IPV4_HEADER_SIZE + GPSRP_BODY_SIZE
    }
}

/// Frame of a protocol the routers do not speak
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Header
    pub header: Ipv4Header,
    /// Protocol number
    pub protocol: u8,
    /// Size in octets
    pub size: u32,
}

/// Any simulated packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// IPv4
    Ipv4(Ipv4Packet),
    /// MPLS
    Mpls(MplsPacket),
    /// TLDP
    Tldp(TldpPacket),
    /// GPSRP
    Gpsrp(GpsrpPacket),
    /// Unknown protocol
    Raw(RawPacket),
}

impl Packet {
    /// Kind of the packet
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Ipv4(p) if p.gos().is_gos() => PacketKind::Ipv4Gos,
            Packet::Ipv4(_) => PacketKind::Ipv4,
            Packet::Mpls(p) if p.has_gos_marker() => PacketKind::MplsGos,
            Packet::Mpls(_) => PacketKind::Mpls,
            Packet::Tldp(_) => PacketKind::Tldp,
            Packet::Gpsrp(_) => PacketKind::Gpsrp,
            Packet::Raw(_) => PacketKind::Raw,
        }
    }

    /// Size in octets
    pub fn size(&self) -> u32 {
        match self {
            Packet::Ipv4(p) => p.size(),
            Packet::Mpls(p) => p.size(),
            Packet::Tldp(p) => p.size(),
            Packet::Gpsrp(p) => p.size(),
            Packet::Raw(p) => p.size,
        }
    }

    /// IPv4 header
    pub fn header(&self) -> &Ipv4Header {
        match self {
            Packet::Ipv4(p) => &p.header,
            Packet::Mpls(p) => &p.header,
            Packet::Tldp(p) => &p.header,
            Packet::Gpsrp(p) => &p.header,
            Packet::Raw(p) => &p.header,
        }
    }

    /// GoS priority used by active ports; signaling is always served first
    pub fn priority(&self) -> u8 {
        match self {
            Packet::Tldp(_) | Packet::Gpsrp(_) => u8::MAX,
            Packet::Mpls(p) => p
                .label_stack
                .iter()
                .map(|entry| Gos::from_exp(entry.exp).level)
                .max()
                .unwrap_or(0)
                .max(p.header.options.gos.level),
            other => other.header().options.gos.level,
        }
    }
}

impl From<Ipv4Packet> for Packet {
    fn from(packet: Ipv4Packet) -> Self {
        Packet::Ipv4(packet)
    }
}

impl From<MplsPacket> for Packet {
    fn from(packet: MplsPacket) -> Self {
        Packet::Mpls(packet)
    }
}

impl From<TldpPacket> for Packet {
    fn from(packet: TldpPacket) -> Self {
        Packet::Tldp(packet)
    }
}

impl From<GpsrpPacket> for Packet {
    fn from(packet: GpsrpPacket) -> Self {
        Packet::Gpsrp(packet)
    }
}
