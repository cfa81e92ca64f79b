//! Fixtures shared by the scenario tests.

#![allow(dead_code)]

use mplsim_node::{EventKind, NodeConfig, RecordingSink, Simulation, TrafficConfig};
use mplsim_topology::{LinkEnd, LinkKind, NodeId, NodeRole, PortId, Topology};
use mplsim_wire::PacketKind;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const TICK_NS: u64 = 5_000;

pub fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

/// sender - ler-a - lsr - ler-b - receiver, driven by a simulation
pub struct Line {
    pub sim: Simulation,
    pub sink: Arc<RecordingSink>,
    pub sender: NodeId,
    pub ingress: NodeId,
    pub lsr: NodeId,
    pub egress: NodeId,
    pub receiver: NodeId,
}

/// Build the line with one flow from sender to receiver
pub fn line(active: bool, flow: TrafficConfig) -> Line {
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

    let sink = Arc::new(RecordingSink::new());
    let mut sim = Simulation::new(topology, sink.clone(), TICK_NS).unwrap();
    sim.add_sender(
        "sender",
        TrafficConfig {
            destination: addr(5),
            ..flow
        },
    )
    .unwrap();
    for (name, last, role) in [("ler-a", 2, edge), ("lsr", 3, core), ("ler-b", 4, edge)] {
        sim.add_router(NodeConfig {
            name: name.to_string(),
            address: addr(last),
            role,
            ports: 2,
            ..NodeConfig::default()
        })
        .unwrap();
    }
    sim.add_receiver("receiver").unwrap();

    Line {
        sim,
        sink,
        sender,
        ingress,
        lsr,
        egress,
        receiver,
    }
}

/// Packets of `packet` kind `node` put on the link of `port`
pub fn sent(sink: &RecordingSink, node: NodeId, packet: PacketKind, port: PortId) -> usize {
    sink.count(|e| e.node == node && e.kind == EventKind::PacketSent { packet, port })
}

/// Every discard, whatever the node
pub fn discarded(sink: &RecordingSink) -> usize {
    sink.count(|e| matches!(e.kind, EventKind::PacketDiscarded { .. }))
}
