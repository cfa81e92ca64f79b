//! Node records as seen by the topology.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Numeric node identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Label edge router
    EdgeRouter,
    /// Label edge router with GPSRP and a frame cache
    ActiveEdgeRouter,
    /// Label switch router
    LabelSwitchRouter,
    /// Label switch router with GPSRP and a frame cache
    ActiveLabelSwitchRouter,
    /// Traffic source outside the domain
    Sender,
    /// Traffic sink outside the domain
    Receiver,
}

impl NodeRole {
    /// Whether the node switches labels
    pub fn is_router(&self) -> bool {
        !matches!(self, NodeRole::Sender | NodeRole::Receiver)
    }

    /// Whether the node sits on the domain edge
    pub fn is_edge(&self) -> bool {
        matches!(self, NodeRole::EdgeRouter | NodeRole::ActiveEdgeRouter)
    }

    /// Whether the node runs GPSRP and keeps a frame cache
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeRole::ActiveEdgeRouter | NodeRole::ActiveLabelSwitchRouter
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::EdgeRouter => write!(f, "LER"),
            NodeRole::ActiveEdgeRouter => write!(f, "Active LER"),
            NodeRole::LabelSwitchRouter => write!(f, "LSR"),
            NodeRole::ActiveLabelSwitchRouter => write!(f, "Active LSR"),
            NodeRole::Sender => write!(f, "sender"),
            NodeRole::Receiver => write!(f, "receiver"),
        }
    }
}

/// A node as registered in the topology
///
/// The routing weight is published by the node itself at the end of each
/// tick and read concurrently by every RABAN computation.
#[derive(Debug)]
pub struct NodeRecord {
    /// Identifier
    pub id: NodeId,
    /// Display name
    pub name: String,
    /// Address
    pub address: Ipv4Addr,
    /// Role
    pub role: NodeRole,
    /// Number of ports
    pub ports: usize,
    /// Last published routing weight
    routing_weight: AtomicU64,
}

impl NodeRecord {
    /// Create a record
    pub fn new(id: NodeId, name: impl Into<String>, address: Ipv4Addr, role: NodeRole, ports: usize) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            role,
            ports,
            routing_weight: AtomicU64::new(0),
        }
    }

    /// Routing weight: `0.7 × congestion + 0.3 × (10 × matrix entries)`
    pub fn compute_routing_weight(congestion: u32, matrix_entries: usize) -> u64 {
        let weight = 0.7 * congestion as f64 + 0.3 * (10.0 * matrix_entries as f64);
        weight.round() as u64
    }

    /// Publish the routing weight for this tick
    pub fn publish_routing_weight(&self, congestion: u32, matrix_entries: usize) {
        let weight = Self::compute_routing_weight(congestion, matrix_entries);
        self.routing_weight.store(weight, Ordering::Relaxed);
    }

    /// Last published routing weight
    pub fn routing_weight(&self) -> u64 {
        self.routing_weight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_capabilities() {
        assert!(NodeRole::ActiveEdgeRouter.is_edge());
        assert!(NodeRole::ActiveEdgeRouter.is_active());
        assert!(!NodeRole::LabelSwitchRouter.is_edge());
        assert!(NodeRole::ActiveLabelSwitchRouter.is_active());
        assert!(!NodeRole::Sender.is_router());
        assert!(NodeRole::EdgeRouter.is_router());
    }

    #[test]
    fn test_routing_weight() {
        assert_eq!(NodeRecord::compute_routing_weight(0, 0), 0);
        assert_eq!(NodeRecord::compute_routing_weight(100, 0), 70);
        assert_eq!(NodeRecord::compute_routing_weight(10, 2), 13);

        let record = NodeRecord::new(NodeId(1), "lsr", Ipv4Addr::new(10, 0, 0, 1), NodeRole::LabelSwitchRouter, 4);
        record.publish_routing_weight(50, 3);
        assert_eq!(record.routing_weight(), 44);
    }
}
