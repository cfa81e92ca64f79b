//! Protecting a flow with a backup LSP over a second core router.

mod common;

use common::{addr, TICK_NS};
use mplsim_node::{NodeConfig, RecordingSink, ScheduledLinkEvent, Simulation, TrafficConfig};
use mplsim_topology::{LinkEnd, LinkKind, NodeRole, Topology};
use std::sync::Arc;

const PACKETS: u64 = 20;
const BREAK_AT_NS: u64 = 8_000_000;

/// sender - ler-a, two parallel routers lsr-1 and lsr-2, ler-b - receiver
fn diamond() -> Simulation {
    let mut topology = Topology::new();
    let sender = topology.add_node("sender", addr(1), NodeRole::Sender, 1).unwrap();
    let ingress = topology.add_node("ler-a", addr(2), NodeRole::EdgeRouter, 3).unwrap();
    let upper = topology.add_node("lsr-1", addr(3), NodeRole::LabelSwitchRouter, 2).unwrap();
    let lower = topology.add_node("lsr-2", addr(4), NodeRole::LabelSwitchRouter, 2).unwrap();
    let egress = topology.add_node("ler-b", addr(5), NodeRole::EdgeRouter, 3).unwrap();
    let receiver = topology.add_node("receiver", addr(6), NodeRole::Receiver, 1).unwrap();

    let end = |node, port| LinkEnd { node, port };
    let links = [
        ("sender-ler-a", LinkKind::External, end(sender, 0), end(ingress, 0)),
        ("ler-a-lsr-1", LinkKind::Internal, end(ingress, 1), end(upper, 0)),
        ("ler-a-lsr-2", LinkKind::Internal, end(ingress, 2), end(lower, 0)),
        ("lsr-1-ler-b", LinkKind::Internal, end(upper, 1), end(egress, 0)),
        ("lsr-2-ler-b", LinkKind::Internal, end(lower, 1), end(egress, 1)),
        ("ler-b-receiver", LinkKind::External, end(egress, 2), end(receiver, 0)),
    ];
    for (name, kind, a, b) in links {
        topology.add_link(name, kind, 1_000, a, b).unwrap();
    }

    let mut sim = Simulation::new(topology, Arc::new(RecordingSink::new()), TICK_NS).unwrap();
    sim.add_sender(
        "sender",
        TrafficConfig {
            destination: addr(6),
            rate_mbps: 1,
            payload_bytes: 100,
            backup_lsp: true,
            count: Some(PACKETS),
            ..TrafficConfig::default()
        },
    )
    .unwrap();
    let routers = [
        ("ler-a", 2, NodeRole::EdgeRouter, 3),
        ("lsr-1", 3, NodeRole::LabelSwitchRouter, 2),
        ("lsr-2", 4, NodeRole::LabelSwitchRouter, 2),
        ("ler-b", 5, NodeRole::EdgeRouter, 3),
    ];
    for (name, last, role, ports) in routers {
        sim.add_router(NodeConfig {
            name: name.to_string(),
            address: addr(last),
            role,
            ports,
            ..NodeConfig::default()
        })
        .unwrap();
    }
    sim.add_receiver("receiver").unwrap();
    sim
}

/// Names of the ingress links carrying the primary and the backup LSP
fn established(sim: &mut Simulation) -> (&'static str, &'static str) {
    sim.run_until(5_000_000).unwrap();
    let topology = sim.topology();
    let carried = |name: &str| {
        let link = topology.link_by_name(name).unwrap();
        (link.lsps(), link.backup_lsps())
    };
    let paths = match (carried("ler-a-lsr-1"), carried("ler-a-lsr-2")) {
        ((1, 0), (0, 1)) => ("ler-a-lsr-1", "ler-a-lsr-2"),
        ((0, 1), (1, 0)) => ("ler-a-lsr-2", "ler-a-lsr-1"),
        other => panic!("no protected LSP at the ingress: {:?}", other),
    };

    let entries = sim.router("ler-a").unwrap().matrix().snapshot();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].has_usable_backup());
    assert_ne!(entries[0].backup_outgoing_port, entries[0].outgoing_port);
    paths
}

#[test]
fn test_backup_takes_the_other_core_router() {
    let mut sim = diamond();
    established(&mut sim);

    // Both core routers carry the flow's LSPs toward the egress
    for name in ["lsr-1", "lsr-2"] {
        assert_eq!(sim.router(name).unwrap().matrix().len(), 1, "{}", name);
    }
    assert_eq!(sim.router("ler-b").unwrap().matrix().len(), 2);
}

#[test]
fn test_traffic_survives_primary_link_failure() {
    let mut sim = diamond();
    let (primary, backup) = established(&mut sim);
    let before = sim.receiver("receiver").unwrap().stats().packets;
    assert!(before > 0);

    let link = sim.topology().link_by_name(primary).unwrap().id;
    sim.schedule_link_event(ScheduledLinkEvent {
        at_ns: BREAK_AT_NS,
        link,
        broken: true,
    })
    .unwrap();
    sim.run_until(40_000_000).unwrap();

    // The ingress moved the flow onto the backup path without losing a packet
    assert_eq!(sim.receiver("receiver").unwrap().stats().packets, PACKETS);
    let topology = sim.topology();
    assert_eq!(topology.link_by_name(primary).unwrap().lsps(), 0);
    assert_eq!(topology.link_by_name(backup).unwrap().lsps(), 1);
    assert_eq!(topology.link_by_name(backup).unwrap().backup_lsps(), 0);

    let ingress = topology.node_by_name("ler-a").unwrap().id;
    let backup_port = topology.link_by_name(backup).unwrap().end_of(ingress).map(|end| end.port);
    let entries = sim.router("ler-a").unwrap().matrix().snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outgoing_port, backup_port);
}
