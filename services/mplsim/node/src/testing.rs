//! Fixtures shared by the unit tests.

use mplsim_topology::{LinkEnd, LinkKind, NodeId, NodeRole, Topology};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::events::EventSink;
use crate::ids::IdGenerator;
use crate::node::{Node, NodeConfig, Tick, TickContext};

/// sender - ler-a - lsr - ler-b - receiver
pub(crate) struct Line {
    pub topology: Topology,
    pub ingress: Node,
    pub lsr: Node,
    pub egress: Node,
    pub sender_addr: Ipv4Addr,
    pub ingress_addr: Ipv4Addr,
    pub lsr_addr: Ipv4Addr,
    pub egress_addr: Ipv4Addr,
    pub receiver_addr: Ipv4Addr,
}

pub(crate) fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn router(id: NodeId, name: &str, last: u8, role: NodeRole, ids: &Arc<IdGenerator>) -> Node {
    let config = NodeConfig {
        name: name.to_string(),
        address: addr(last),
        role,
        ports: 2,
        ..NodeConfig::default()
    };
    Node::new(id, config, ids.clone()).unwrap()
}

/// Line of plain routers
pub(crate) fn line() -> Line {
    line_of(false)
}

/// Line of routers, all of them active when `active` is set
pub(crate) fn line_of(active: bool) -> Line {
    let (edge, core) = if active {
        (NodeRole::ActiveEdgeRouter, NodeRole::ActiveLabelSwitchRouter)
    } else {
        (NodeRole::EdgeRouter, NodeRole::LabelSwitchRouter)
    };

    let mut topology = Topology::new();
    let sender = topology.add_node("sender", addr(1), NodeRole::Sender, 1).unwrap();
    let ingress = topology.add_node("ler-a", addr(2), edge, 2).unwrap();
    let lsr = topology.add_node("lsr", addr(3), core, 2).unwrap();
    let egress = topology.add_node("ler-b", addr(4), edge, 2).unwrap();
    let receiver = topology.add_node("receiver", addr(5), NodeRole::Receiver, 1).unwrap();

    let end = |node, port| LinkEnd { node, port };
    let links = [
        ("sender-ler-a", LinkKind::External, end(sender, 0), end(ingress, 0)),
        ("ler-a-lsr", LinkKind::Internal, end(ingress, 1), end(lsr, 0)),
        ("lsr-ler-b", LinkKind::Internal, end(lsr, 1), end(egress, 0)),
        ("ler-b-receiver", LinkKind::External, end(egress, 1), end(receiver, 0)),
    ];
    for (name, kind, a, b) in links {
        topology.add_link(name, kind, 1_000, a, b).unwrap();
    }

    let ids = Arc::new(IdGenerator::new("events"));
    Line {
        ingress: router(ingress, "ler-a", 2, edge, &ids),
        lsr: router(lsr, "lsr", 3, core, &ids),
        egress: router(egress, "ler-b", 4, edge, &ids),
        topology,
        sender_addr: addr(1),
        ingress_addr: addr(2),
        lsr_addr: addr(3),
        egress_addr: addr(4),
        receiver_addr: addr(5),
    }
}

/// Context for a tick of `duration_ns`
pub(crate) fn tick<'a>(topology: &'a Topology, sink: &'a dyn EventSink, duration_ns: u64) -> TickContext<'a> {
    TickContext {
        topology,
        sink,
        tick: Tick {
            duration_ns,
            upper_limit_ns: duration_ns,
        },
    }
}
