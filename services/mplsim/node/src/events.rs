//! Simulation events and sinks.
//!
//! Nodes report what happens to packets through an [`EventSink`]. Events are
//! informative only: no engine decision depends on whether a sink consumed
//! them.

use mplsim_topology::{NodeId, PortId};
use mplsim_wire::PacketKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::NodeError;
use crate::ids::IdGenerator;

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscardReason {
    /// TTL reached zero
    TtlExpired,
    /// No route toward the destination
    Unreachable,
    /// Downstream refused a label for the flow
    LabelUnavailable,
    /// The LSP is being torn down
    Withdrawing,
    /// The entry does not allow this packet kind
    UndefinedOperation,
    /// The incoming port buffer is full
    BufferOverflow,
    /// Protocol this node does not speak
    Martian,
    /// The outgoing link is broken or missing
    LinkDown,
    /// Lost in transit on a link that broke
    LostInTransit,
    /// Signaling that matches no entry
    Unmatched,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DiscardReason::TtlExpired => "ttl expired",
            DiscardReason::Unreachable => "unreachable",
            DiscardReason::LabelUnavailable => "label unavailable",
            DiscardReason::Withdrawing => "lsp withdrawing",
            DiscardReason::UndefinedOperation => "undefined operation",
            DiscardReason::BufferOverflow => "buffer overflow",
            DiscardReason::Martian => "martian",
            DiscardReason::LinkDown => "link down",
            DiscardReason::LostInTransit => "lost in transit",
            DiscardReason::Unmatched => "unmatched",
        };
        write!(f, "{}", reason)
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A traffic source created a packet
    PacketGenerated {
        /// Packet kind
        packet: PacketKind,
        /// Size in octets
        size: u32,
    },
    /// A packet was put on a link
    PacketSent {
        /// Packet kind
        packet: PacketKind,
        /// Departure port
        port: PortId,
    },
    /// A router switched a packet
    PacketRouted {
        /// Packet kind
        packet: PacketKind,
    },
    /// A packet was dropped
    PacketDiscarded {
        /// Packet kind
        packet: PacketKind,
        /// Why
        reason: DiscardReason,
    },
    /// A traffic sink consumed a packet
    PacketReceived {
        /// Packet kind
        packet: PacketKind,
        /// Arrival port
        port: PortId,
    },
    /// Port occupancy changed
    NodeCongested {
        /// Occupancy of the fullest port, in percent
        percent: u32,
    },
}

/// One simulation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Unique event identifier
    pub id: u64,
    /// Simulated time in nanoseconds
    pub time_ns: u64,
    /// Node reporting the event
    pub node: NodeId,
    /// Event payload
    pub kind: EventKind,
}

/// Consumer of simulation events
pub trait EventSink: Send + Sync {
    /// Handle one event
    fn emit(&self, event: SimEvent);
}

/// Sink dropping every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SimEvent) {}
}

/// Sink forwarding events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<SimEvent>,
}

impl ChannelEventSink {
    /// Create a sink and its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SimEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: SimEvent) {
        let id = event.id;
        if let Err(e) = self.tx.send(event) {
            error!("Failed to send simulation event {}: {}", id, e);
        }
    }
}

/// Sink keeping every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SimEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded events
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SimEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SimEvent) {
        self.events.lock().push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: SimEvent) {
        (**self).emit(event)
    }
}

/// Stamps events of one node with identifiers
#[derive(Debug, Clone)]
pub struct EventEmitter {
    node: NodeId,
    ids: Arc<IdGenerator>,
}

impl EventEmitter {
    /// Create an emitter for `node` drawing from a shared identifier space
    pub fn new(node: NodeId, ids: Arc<IdGenerator>) -> Self {
        Self { node, ids }
    }

    /// Send one event
    pub fn emit(&self, sink: &dyn EventSink, time_ns: u64, kind: EventKind) -> Result<(), NodeError> {
        let id = self.ids.generate()?;
        debug!("Node {} event {}: {:?}", self.node, id, kind);
        sink.emit(SimEvent {
            id,
            time_ns,
            node: self.node,
            kind,
        });
        Ok(())
    }
}
