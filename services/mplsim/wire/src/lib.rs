//! In-memory packet model for the MPLS domain simulator.
//!
//! Packets never leave the process, so nothing here is byte-exact. What this
//! crate does model faithfully is the information the forwarding and
//! signaling engines act on:
//!
//! - **IPv4 header**: addresses, TTL, packet identifier and the options field
//!   carrying the requested GoS level and the crossed active nodes
//! - **MPLS label stack**: label, EXP bits, bottom-of-stack and TTL per entry
//! - **TLDP**: label request / confirm / deny / withdraw messages with their
//!   direction tag and session identifier
//! - **GPSRP**: local retransmission request / answer messages
//!
//! ## Sizes
//!
//! ```text
//! +----------------------+----------------------------+
//! | IPv4 header (20B)    | every packet kind          |
//! +----------------------+----------------------------+
//! | label entry (4B)     | one per MPLS label         |
//! +----------------------+----------------------------+
//! | TCP header (20B)     | TLDP only                  |
//! +----------------------+----------------------------+
//! | TLDP / GPSRP body    | fixed, see constants       |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fec;
pub mod header;
pub mod label;
pub mod packet;

// Re-export main types
pub use error::WireError;
pub use fec::{classify, flow_id, fnv1a_32};
pub use header::{ExpBits, Gos, Ipv4Header, Ipv4Options, DEFAULT_TTL, IPV4_HEADER_SIZE};
pub use label::{
    Label, LabelStack, LabelStackEntry, FIRST_UNRESERVED_LABEL, GOS_MARKER_LABEL,
    LABEL_ENTRY_SIZE, MAX_LABEL,
};
pub use packet::{
    GpsrpKind, GpsrpPacket, Ipv4Packet, MplsPacket, Packet, PacketKind, RawPacket,
    TldpDirection, TldpKind, TldpPacket, GPSRP_BODY_SIZE, TCP_HEADER_SIZE, TLDP_BODY_SIZE,
};
