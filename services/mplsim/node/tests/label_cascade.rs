//! One IPv4 packet crossing a domain with no LSP yet.

mod common;

use common::{discarded, line, sent};
use mplsim_node::TrafficConfig;
use mplsim_switching::{LabelStackOperation, OutgoingLabel};
use mplsim_wire::PacketKind;

fn single_packet() -> TrafficConfig {
    TrafficConfig {
        rate_mbps: 1,
        payload_bytes: 100,
        count: Some(1),
        ..TrafficConfig::default()
    }
}

#[test]
fn test_first_packet_builds_lsp_and_arrives_as_ipv4() {
    let mut line = line(false, single_packet());
    line.sim.run_until(2_000_000).unwrap();
    let sink = &line.sink;

    // One request per hop toward the egress, one confirmation per hop back
    assert_eq!(sent(sink, line.ingress, PacketKind::Tldp, 1), 1);
    assert_eq!(sent(sink, line.lsr, PacketKind::Tldp, 1), 1);
    assert_eq!(sent(sink, line.egress, PacketKind::Tldp, 0), 1);
    assert_eq!(sent(sink, line.lsr, PacketKind::Tldp, 0), 1);

    // Labelled across the domain, plain IPv4 out of it
    assert_eq!(sent(sink, line.ingress, PacketKind::Mpls, 1), 1);
    assert_eq!(sent(sink, line.lsr, PacketKind::Mpls, 1), 1);
    assert_eq!(sent(sink, line.egress, PacketKind::Ipv4, 1), 1);
    assert_eq!(discarded(sink), 0);

    let stats = line.sim.receiver("receiver").unwrap().stats();
    assert_eq!(stats.packets, 1);
    assert_eq!(stats.by_kind.get("IPv4"), Some(&1));
}

#[test]
fn test_each_hop_keeps_one_entry() {
    let mut line = line(false, single_packet());
    line.sim.run_until(2_000_000).unwrap();

    let entry = |name: &str| {
        let entries = line.sim.router(name).unwrap().matrix().snapshot();
        assert_eq!(entries.len(), 1, "{} entries", name);
        entries.into_iter().next().unwrap()
    };

    let ingress = entry("ler-a");
    assert_eq!(ingress.label_stack_operation, LabelStackOperation::Push);
    let OutgoingLabel::Label(pushed) = ingress.outgoing_label else {
        panic!("ingress has no label: {:?}", ingress.outgoing_label);
    };

    let transit = entry("lsr");
    assert_eq!(transit.label_stack_operation, LabelStackOperation::Swap);
    assert_eq!(transit.label_or_fec, Some(pushed));
    let OutgoingLabel::Label(swapped) = transit.outgoing_label else {
        panic!("transit has no label: {:?}", transit.outgoing_label);
    };

    let egress = entry("ler-b");
    assert_eq!(egress.label_stack_operation, LabelStackOperation::Pop);
    assert_eq!(egress.label_or_fec, Some(swapped));
    assert_eq!(egress.outgoing_label, OutgoingLabel::Assigned);

    let topology = line.sim.topology();
    assert_eq!(topology.link_by_name("ler-a-lsr").unwrap().lsps(), 1);
    assert_eq!(topology.link_by_name("lsr-ler-b").unwrap().lsps(), 1);
}

#[test]
fn test_later_packets_reuse_the_lsp() {
    let mut line = line(
        false,
        TrafficConfig {
            count: Some(4),
            ..single_packet()
        },
    );
    line.sim.run_until(5_000_000).unwrap();

    assert_eq!(sent(&line.sink, line.ingress, PacketKind::Tldp, 1), 1);
    assert_eq!(sent(&line.sink, line.ingress, PacketKind::Mpls, 1), 4);
    assert_eq!(line.sim.receiver("receiver").unwrap().stats().packets, 4);
    assert_eq!(line.sim.router("lsr").unwrap().stats().routed, 4);
}
