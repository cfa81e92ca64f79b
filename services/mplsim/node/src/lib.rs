//! Routers, traffic endpoints and the drivers that advance them.
//!
//! A [`Simulation`] owns the [`mplsim_topology::Topology`] and one
//! [`SimulatedNode`] per topology node. Each step it:
//!
//! 1. applies scheduled link events
//! 2. hands packets that finished crossing a link to their receiving node
//! 3. ticks every node in identifier order
//!
//! Routers ([`Node`]) run their engines inside the tick: connectivity check,
//! TLDP retransmission, GPSRP retransmission (active roles), then switching
//! within the tick's budget. Everything observable is reported to an
//! [`EventSink`].
//!
//! [`Runtime`] runs the same loop with one tokio task per node and a
//! per-tick barrier.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
mod forwarding;
pub mod gpsrp;
pub mod ids;
pub mod node;
pub mod port;
pub mod runtime;
pub mod simulation;
mod tldp;
pub mod traffic;

#[cfg(test)]
mod testing;

pub use error::NodeError;
pub use events::{ChannelEventSink, DiscardReason, EventEmitter, EventKind, EventSink, NullSink, RecordingSink, SimEvent};
pub use gpsrp::GpsrpRequestEntry;
pub use ids::IdGenerator;
pub use node::{
    Forwarder, GpsrpSpeaker, Node, NodeConfig, NodeStats, RoutingMode, SimulatedNode, Tick, TickContext, TldpSpeaker,
};
pub use port::{Port, PortSet};
pub use runtime::{NodeCommand, Runtime};
pub use simulation::{ScheduledLinkEvent, Simulation};
pub use traffic::{ReceiverStats, TrafficConfig, TrafficReceiver, TrafficSender};
