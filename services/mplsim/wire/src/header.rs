//! IPv4 header and the options field used for Guarantee of Service (GoS).
//!
//! GoS is carried in three EXP bits: two bits of priority level and one bit
//! asking the domain to protect the flow with a backup LSP.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::WireError;

/// IPv4 header size in octets (no options on the wire)
pub const IPV4_HEADER_SIZE: u32 = 20;

/// Default TTL for generated packets
pub const DEFAULT_TTL: u8 = 64;

bitflags! {
    /// EXP bits of a label stack entry, as used for GoS marking
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExpBits: u8 {
        /// Low bit of the GoS priority level
        const LEVEL_LOW = 1 << 0;
        /// High bit of the GoS priority level
        const LEVEL_HIGH = 1 << 1;
        /// Flow asks for a backup LSP
        const BACKUP_LSP = 1 << 2;
    }
}

/// Requested Guarantee of Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gos {
    /// Priority level (0..=3), 0 means best effort
    pub level: u8,
    /// Whether a backup LSP should protect the flow
    pub backup_lsp: bool,
}

impl Gos {
    /// Best effort, no protection
    pub const BEST_EFFORT: Gos = Gos {
        level: 0,
        backup_lsp: false,
    };

    /// Create a GoS request; the level is clamped to two bits
    pub fn new(level: u8, backup_lsp: bool) -> Self {
        Self {
            level: level.min(3),
            backup_lsp,
        }
    }

    /// Whether the packet carries any GoS request at all
    pub fn is_gos(&self) -> bool {
        self.level > 0 || self.backup_lsp
    }

    /// Encode into EXP bits
    pub fn to_exp(self) -> ExpBits {
        let mut bits = ExpBits::from_bits_truncate(self.level & 0b11);
        if self.backup_lsp {
            bits |= ExpBits::BACKUP_LSP;
        }
        bits
    }

    /// Decode from EXP bits
    pub fn from_exp(bits: ExpBits) -> Self {
        Self {
            level: bits.bits() & 0b11,
            backup_lsp: bits.contains(ExpBits::BACKUP_LSP),
        }
    }

    /// Decode from a raw EXP value
    pub fn from_raw_exp(value: u8) -> Result<Self, WireError> {
        ExpBits::from_bits(value)
            .map(Self::from_exp)
            .ok_or(WireError::Exp(value))
    }
}

/// IPv4 options field as used by the GoS extensions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ipv4Options {
    /// Requested GoS
    pub gos: Gos,
    /// Active nodes that cached this packet, oldest first
    pub crossed_active_nodes: Vec<Ipv4Addr>,
}

impl Ipv4Options {
    /// Record an active node that handled the packet
    pub fn stamp_active_node(&mut self, addr: Ipv4Addr) {
        if self.crossed_active_nodes.last() != Some(&addr) {
            self.crossed_active_nodes.push(addr);
        }
    }

    /// Last active node that handled the packet, other than `me`
    pub fn last_active_node_except(&self, me: Ipv4Addr) -> Option<Ipv4Addr> {
        self.crossed_active_nodes
            .iter()
            .rev()
            .find(|addr| **addr != me)
            .copied()
    }
}

/// IPv4 header of every simulated packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Header {
    /// Packet identifier, unique per originating node
    pub packet_id: u64,
    /// Source address
    pub source: Ipv4Addr,
    /// Destination address
    pub destination: Ipv4Addr,
    /// Time to live
    pub ttl: u8,
    /// Options field
    pub options: Ipv4Options,
}

impl Ipv4Header {
    /// Create a header with default TTL and no options
    pub fn new(packet_id: u64, source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            packet_id,
            source,
            destination,
            ttl: DEFAULT_TTL,
            options: Ipv4Options::default(),
        }
    }

    /// Set the requested GoS
    pub fn with_gos(mut self, gos: Gos) -> Self {
        self.options.gos = gos;
        self
    }

    /// Decrement TTL, failing if it is already zero
    pub fn decrement_ttl(&mut self) -> Result<u8, WireError> {
        if self.ttl == 0 {
            return Err(WireError::TtlExpired);
        }
        self.ttl -= 1;
        Ok(self.ttl)
    }
}
