//! Tearing an LSP down after its downstream link breaks.

mod common;

use common::{line, sent, Line};
use mplsim_node::{DiscardReason, EventKind, ScheduledLinkEvent, TrafficConfig};
use mplsim_wire::PacketKind;

const BREAK_AT_NS: u64 = 3_500_000;

/// Line carrying three packets, with the LSP still in place afterwards
fn established() -> Line {
    let mut line = line(
        false,
        TrafficConfig {
            rate_mbps: 1,
            payload_bytes: 100,
            count: Some(3),
            ..TrafficConfig::default()
        },
    );
    line.sim.run_until(3_400_000).unwrap();
    assert_eq!(line.sim.receiver("receiver").unwrap().stats().packets, 3);
    for name in ["ler-a", "lsr", "ler-b"] {
        assert_eq!(line.sim.router(name).unwrap().matrix().len(), 1, "{}", name);
    }
    line
}

fn break_lsr_egress(line: &mut Line) {
    let link = line.sim.topology().link_by_name("lsr-ler-b").unwrap().id;
    line.sim
        .schedule_link_event(ScheduledLinkEvent {
            at_ns: BREAK_AT_NS,
            link,
            broken: true,
        })
        .unwrap();
    line.sink.clear();
}

#[test]
fn test_removal_travels_toward_ingress() {
    let mut line = established();
    break_lsr_egress(&mut line);

    // The lsr notices within the tick of the break and waits for the ingress
    line.sim.run_until(BREAK_AT_NS).unwrap();
    assert_eq!(sent(&line.sink, line.lsr, PacketKind::Tldp, 0), 1);
    assert_eq!(line.sim.router("lsr").unwrap().matrix().len(), 1);
    assert!(line.sim.router("ler-b").unwrap().matrix().is_empty());

    line.sim.run_until(4_000_000).unwrap();
    assert_eq!(sent(&line.sink, line.ingress, PacketKind::Tldp, 1), 1);
    assert_eq!(sent(&line.sink, line.lsr, PacketKind::Tldp, 0), 1);
}

#[test]
fn test_entries_removed_once_acknowledged() {
    let mut line = established();
    break_lsr_egress(&mut line);
    line.sim.run_until(4_000_000).unwrap();

    for name in ["ler-a", "lsr", "ler-b"] {
        assert!(line.sim.router(name).unwrap().matrix().is_empty(), "{}", name);
    }
    let topology = line.sim.topology();
    assert_eq!(topology.link_by_name("ler-a-lsr").unwrap().lsps(), 0);
    assert_eq!(topology.link_by_name("lsr-ler-b").unwrap().lsps(), 0);

    // Nothing was sent over the broken link
    assert_eq!(
        line.sink.count(|e| matches!(
            e.kind,
            EventKind::PacketDiscarded {
                reason: DiscardReason::LinkDown,
                ..
            }
        )),
        0
    );
}
