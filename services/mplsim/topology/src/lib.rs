//! Domain graph, timed links and next-hop computation for mplsim.
//!
//! This crate owns every node record and link of a simulated MPLS domain.
//! Nodes do not own the topology; they receive a shared reference on every
//! tick and use it to:
//!
//! - carry packets over links (`Link::carry`)
//! - resolve which port leads to a neighbour
//! - ask for next hops, either delay based (Floyd-Warshall) or load based
//!   (RABAN, optionally avoiding one neighbour for backup paths)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod link;
pub mod node;

pub use error::{ConfigCode, TopologyError};
pub use graph::{Topology, INFINITE_WEIGHT};
pub use link::{Delivery, Link, LinkEnd, LinkId, LinkKind, PortId};
pub use node::{NodeId, NodeRecord, NodeRole};
