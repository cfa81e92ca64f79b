//! The domain graph: node records, links and their validation.

mod paths;

use mplsim_wire::Packet;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use tracing::{debug, info};

use crate::error::{validate_name, ConfigCode, TopologyError};
use crate::link::{Delivery, Link, LinkEnd, LinkId, LinkKind, PortId};
use crate::node::{NodeId, NodeRecord, NodeRole};

/// Cost of a missing or broken edge
pub const INFINITE_WEIGHT: u64 = u64::MAX;

/// Owns every node record and link of the domain
///
/// Built mutably while the scenario is loaded, then shared (usually behind an
/// `Arc`) by every node. Link state and node routing weights use interior
/// mutability so shared readers observe breakage and load as it happens.
#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<NodeRecord>,
    links: Vec<Link>,
    floyd_lock: Mutex<()>,
    raban_lock: Mutex<()>,
}

impl Topology {
    /// Create an empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, returning its identifier
    pub fn add_node(
        &mut self,
        name: &str,
        address: Ipv4Addr,
        role: NodeRole,
        ports: usize,
    ) -> Result<NodeId, TopologyError> {
        let config_error = |code| TopologyError::Config {
            subject: name.to_string(),
            code,
        };

        validate_name(name, self.nodes.iter().map(|n| n.name.as_str())).map_err(config_error)?;
        if self.nodes.iter().any(|n| n.address == address) {
            return Err(config_error(ConfigCode::DuplicateAddress));
        }

        let id = NodeId(self.nodes.len() as u32 + 1);
        info!("Added {} {} ({}) with {} ports", role, name, address, ports);
        self.nodes.push(NodeRecord::new(id, name, address, role, ports));
        Ok(id)
    }

    /// Register a link between two node ports
    pub fn add_link(
        &mut self,
        name: &str,
        kind: LinkKind,
        delay_ns: u64,
        a: LinkEnd,
        b: LinkEnd,
    ) -> Result<LinkId, TopologyError> {
        if let Err(code) = self.check_link(name, kind, delay_ns, &a, &b) {
            return Err(TopologyError::Config {
                subject: name.to_string(),
                code,
            });
        }

        let id = LinkId(self.links.len() as u32 + 1);
        info!(
            "Added {:?} link {} between node {} port {} and node {} port {} ({} ns)",
            kind, name, a.node, a.port, b.node, b.port, delay_ns
        );
        self.links.push(Link::new(id, name, kind, delay_ns, [a, b]));
        Ok(id)
    }

    fn check_link(&self, name: &str, kind: LinkKind, delay_ns: u64, a: &LinkEnd, b: &LinkEnd) -> Result<(), ConfigCode> {
        validate_name(name, self.links.iter().map(|l| l.name.as_str()))?;
        if delay_ns == 0 {
            return Err(ConfigCode::ZeroDelay);
        }
        if a.node == b.node {
            return Err(ConfigCode::SelfLoop);
        }

        let head = self.node(a.node).ok_or(ConfigCode::UnknownNode)?;
        let tail = self.node(b.node).ok_or(ConfigCode::UnknownNode)?;
        for (record, end) in [(head, a), (tail, b)] {
            if end.port >= record.ports {
                return Err(ConfigCode::PortOutOfRange);
            }
            if self.link_at(end.node, end.port).is_some() {
                return Err(ConfigCode::PortInUse);
            }
        }

        let ends_ok = match kind {
            LinkKind::Internal => head.role.is_router() && tail.role.is_router(),
            LinkKind::External => {
                (head.role.is_edge() && !tail.role.is_router()) || (tail.role.is_edge() && !head.role.is_router())
            }
        };
        if !ends_ok {
            return Err(ConfigCode::InvalidLinkEnds);
        }
        Ok(())
    }

    /// Node by identifier
    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node by address
    pub fn node_by_address(&self, address: Ipv4Addr) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.address == address)
    }

    /// Node by name
    pub fn node_by_name(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// All nodes
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// All links
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Link by identifier
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    /// Link by name
    pub fn link_by_name(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Link attached to a node port
    pub fn link_at(&self, node: NodeId, port: PortId) -> Option<&Link> {
        self.links
            .iter()
            .find(|l| l.ends.iter().any(|end| end.node == node && end.port == port))
    }

    /// Node on the far side of a node port
    pub fn neighbor_at(&self, node: NodeId, port: PortId) -> Option<&NodeRecord> {
        let far = self.link_at(node, port)?.far_end(node)?;
        self.node(far.node)
    }

    /// Port of `node` leading to the neighbour with `neighbor` address
    pub fn port_towards(&self, node: NodeId, neighbor: Ipv4Addr) -> Option<(PortId, &Link)> {
        let neighbor = self.node_by_address(neighbor)?.id;
        self.links.iter().find_map(|link| {
            let near = link.end_of(node)?;
            let far = link.far_end(node)?;
            (far.node == neighbor).then_some((near.port, link))
        })
    }

    /// Break or restore a link, returning the packets lost in transit
    pub fn set_link_broken(&self, id: LinkId, broken: bool) -> Result<Vec<Packet>, TopologyError> {
        let link = self.link(id).ok_or(TopologyError::UnknownLink(id))?;
        Ok(link.set_broken(broken))
    }

    /// Advance every link by one tick and collect the arrivals
    pub fn tick_links(&self, duration_ns: u64) -> Vec<Delivery> {
        let deliveries: Vec<Delivery> = self.links.iter().flat_map(|link| link.tick(duration_ns)).collect();
        if !deliveries.is_empty() {
            debug!("{} packets arrived this tick", deliveries.len());
        }
        deliveries
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == address)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    pub(crate) fn end(node: NodeId, port: PortId) -> LinkEnd {
        LinkEnd { node, port }
    }

    #[test]
    fn test_add_node_validation() {
        let mut topology = Topology::new();
        topology.add_node("ler-1", addr(1), NodeRole::EdgeRouter, 4).unwrap();

        let err = topology.add_node("ler-1", addr(2), NodeRole::EdgeRouter, 4).unwrap_err();
        assert_eq!(err.code(), Some(ConfigCode::DuplicateName));

        let err = topology.add_node("ler-2", addr(1), NodeRole::EdgeRouter, 4).unwrap_err();
        assert_eq!(err.code(), Some(ConfigCode::DuplicateAddress));

        let err = topology.add_node(" ", addr(3), NodeRole::EdgeRouter, 4).unwrap_err();
        assert_eq!(err.code(), Some(ConfigCode::BlankName));

        assert_eq!(topology.nodes().len(), 1);
    }

    #[test]
    fn test_add_link_validation() {
        let mut topology = Topology::new();
        let sender = topology.add_node("src", addr(1), NodeRole::Sender, 1).unwrap();
        let ler = topology.add_node("ler", addr(2), NodeRole::EdgeRouter, 2).unwrap();
        let lsr = topology.add_node("lsr", addr(3), NodeRole::LabelSwitchRouter, 2).unwrap();

        let code = |r: Result<LinkId, TopologyError>| r.unwrap_err().code();

        assert_eq!(
            code(topology.add_link("x", LinkKind::Internal, 10, end(sender, 0), end(ler, 0))),
            Some(ConfigCode::InvalidLinkEnds)
        );
        assert_eq!(
            code(topology.add_link("x", LinkKind::External, 10, end(sender, 0), end(lsr, 0))),
            Some(ConfigCode::InvalidLinkEnds)
        );
        assert_eq!(
            code(topology.add_link("x", LinkKind::Internal, 0, end(ler, 1), end(lsr, 0))),
            Some(ConfigCode::ZeroDelay)
        );
        assert_eq!(
            code(topology.add_link("x", LinkKind::Internal, 10, end(ler, 1), end(ler, 0))),
            Some(ConfigCode::SelfLoop)
        );
        assert_eq!(
            code(topology.add_link("x", LinkKind::Internal, 10, end(ler, 5), end(lsr, 0))),
            Some(ConfigCode::PortOutOfRange)
        );

        topology
            .add_link("src-ler", LinkKind::External, 10, end(sender, 0), end(ler, 0))
            .unwrap();
        assert_eq!(
            code(topology.add_link("x", LinkKind::Internal, 10, end(ler, 0), end(lsr, 0))),
            Some(ConfigCode::PortInUse)
        );
        topology
            .add_link("ler-lsr", LinkKind::Internal, 10, end(ler, 1), end(lsr, 0))
            .unwrap();

        let (port, link) = topology.port_towards(ler, addr(3)).unwrap();
        assert_eq!(port, 1);
        assert_eq!(link.name, "ler-lsr");
        assert_eq!(topology.neighbor_at(lsr, 0).map(|n| n.id), Some(ler));
        assert!(topology.neighbor_at(lsr, 1).is_none());
    }

    #[test]
    fn test_set_link_broken_unknown() {
        let topology = Topology::new();
        assert_eq!(
            topology.set_link_broken(LinkId(4), true).unwrap_err(),
            TopologyError::UnknownLink(LinkId(4))
        );
    }
}
