//! Timed point-to-point links.

use mplsim_wire::Packet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::node::NodeId;

/// Port index within a node
pub type PortId = usize;

/// Numeric link identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a link is inside the MPLS domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Joins two routers of the domain
    Internal,
    /// Joins the domain edge with the outside world
    External,
}

/// One end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEnd {
    /// Node attached to this end
    pub node: NodeId,
    /// Port of that node
    pub port: PortId,
}

/// Packet handed to a node by a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Receiving node
    pub node: NodeId,
    /// Receiving port
    pub port: PortId,
    /// The packet
    pub packet: Packet,
}

#[derive(Debug)]
struct InTransit {
    packet: Packet,
    toward: usize,
    remaining_ns: u64,
}

#[derive(Debug, Default)]
struct LinkState {
    broken: bool,
    lsps: u32,
    backup_lsps: u32,
    in_transit: Vec<InTransit>,
}

/// A link between two node ports
#[derive(Debug)]
pub struct Link {
    /// Identifier
    pub id: LinkId,
    /// Display name
    pub name: String,
    /// Internal or external
    pub kind: LinkKind,
    /// Propagation delay in nanoseconds
    pub delay_ns: u64,
    /// The two ends
    pub ends: [LinkEnd; 2],
    state: Mutex<LinkState>,
}

impl Link {
    /// Create a link in the up state
    pub fn new(id: LinkId, name: impl Into<String>, kind: LinkKind, delay_ns: u64, ends: [LinkEnd; 2]) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            delay_ns,
            ends,
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Link kind
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Whether the link is broken
    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// Break or restore the link; packets in transit on a breaking link are returned as lost
    pub fn set_broken(&self, broken: bool) -> Vec<Packet> {
        let mut state = self.state.lock();
        if state.broken == broken {
            return Vec::new();
        }
        state.broken = broken;
        if broken {
            info!("Link {} ({}) broken, {} packets lost in transit", self.name, self.id, state.in_transit.len());
            // LSPs crossing the link are torn down by the nodes
            state.lsps = 0;
            state.backup_lsps = 0;
            state.in_transit.drain(..).map(|t| t.packet).collect()
        } else {
            info!("Link {} ({}) restored", self.name, self.id);
            Vec::new()
        }
    }

    /// End attached to `node`, if any
    pub fn end_of(&self, node: NodeId) -> Option<&LinkEnd> {
        self.ends.iter().find(|end| end.node == node)
    }

    /// End opposite to `node`, if `node` is attached
    pub fn far_end(&self, node: NodeId) -> Option<&LinkEnd> {
        match self.ends.iter().position(|end| end.node == node) {
            Some(0) => Some(&self.ends[1]),
            Some(_) => Some(&self.ends[0]),
            None => None,
        }
    }

    /// Put a packet on the link toward the end opposite to `from`
    ///
    /// The packet is handed back if the link is broken or `from` is not attached.
    pub fn carry(&self, packet: Packet, from: NodeId) -> Result<(), Packet> {
        let toward = match self.ends.iter().position(|end| end.node == from) {
            Some(0) => 1,
            Some(_) => 0,
            None => return Err(packet),
        };

        let mut state = self.state.lock();
        if state.broken {
            return Err(packet);
        }
        state.in_transit.push(InTransit {
            packet,
            toward,
            remaining_ns: self.delay_ns,
        });
        Ok(())
    }

    /// Advance packets in transit by one tick and return those that arrived
    pub fn tick(&self, duration_ns: u64) -> Vec<Delivery> {
        let mut state = self.state.lock();
        if state.broken || state.in_transit.is_empty() {
            return Vec::new();
        }

        let mut delivered = Vec::new();
        let mut still_moving = Vec::with_capacity(state.in_transit.len());
        for mut transit in state.in_transit.drain(..) {
            transit.remaining_ns = transit.remaining_ns.saturating_sub(duration_ns);
            if transit.remaining_ns == 0 {
                let end = self.ends[transit.toward];
                delivered.push(Delivery {
                    node: end.node,
                    port: end.port,
                    packet: transit.packet,
                });
            } else {
                still_moving.push(transit);
            }
        }
        state.in_transit = still_moving;

        if !delivered.is_empty() {
            debug!("Link {} delivered {} packets", self.name, delivered.len());
        }
        delivered
    }

    /// Number of packets in transit
    pub fn packets_in_transit(&self) -> usize {
        self.state.lock().in_transit.len()
    }

    /// Plain routing weight (delay based)
    pub fn weight(&self) -> u64 {
        self.delay_ns
    }

    /// Composite RABAN weight
    ///
    /// Delay plus per-unit penalties of a tenth of the delay for each unit of
    /// endpoint routing weight, LSP and packet in transit, and a twentieth for
    /// each backup LSP.
    pub fn raban_weight(&self, head_routing_weight: u64, tail_routing_weight: u64) -> u64 {
        let state = self.state.lock();
        let delay = self.delay_ns as f64;
        let tenth = delay * 0.10;
        let twentieth = delay * 0.05;

        let penalty = tenth * head_routing_weight as f64
            + tenth * tail_routing_weight as f64
            + tenth * state.lsps as f64
            + twentieth * state.backup_lsps as f64
            + tenth * state.in_transit.len() as f64;

        self.delay_ns.saturating_add(penalty as u64)
    }

    /// Account one more LSP over this link
    pub fn link_to_lsp(&self) {
        self.state.lock().lsps += 1;
    }

    /// Account one LSP less over this link
    pub fn unlink_from_lsp(&self) {
        let mut state = self.state.lock();
        state.lsps = state.lsps.saturating_sub(1);
    }

    /// Account one more backup LSP over this link
    pub fn link_to_backup_lsp(&self) {
        self.state.lock().backup_lsps += 1;
    }

    /// Account one backup LSP less over this link
    pub fn unlink_from_backup_lsp(&self) {
        let mut state = self.state.lock();
        state.backup_lsps = state.backup_lsps.saturating_sub(1);
    }

    /// Turn one backup LSP into a primary one (traffic switched onto the backup)
    pub fn promote_backup_lsp(&self) {
        let mut state = self.state.lock();
        state.backup_lsps = state.backup_lsps.saturating_sub(1);
        state.lsps += 1;
    }

    /// Number of LSPs over this link
    pub fn lsps(&self) -> u32 {
        self.state.lock().lsps
    }

    /// Number of backup LSPs over this link
    pub fn backup_lsps(&self) -> u32 {
        self.state.lock().backup_lsps
    }
}
