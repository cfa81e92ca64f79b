//! Traffic endpoints outside the domain.

use bytes::Bytes;
use mplsim_topology::{NodeId, NodeRole, PortId, Topology};
use mplsim_wire::{Gos, Ipv4Header, Ipv4Packet, Packet, PacketKind, IPV4_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::NodeError;
use crate::events::{DiscardReason, EventEmitter, EventKind};
use crate::ids::IdGenerator;
use crate::node::{SimulatedNode, TickContext};

/// One traffic flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Receiver the flow is addressed to
    pub destination: Ipv4Addr,
    /// Sending rate in Mbps
    pub rate_mbps: u32,
    /// Payload size in octets
    pub payload_bytes: u32,
    /// Requested GoS level, 0 for best effort
    pub gos_level: u8,
    /// Ask for a backup LSP
    pub backup_lsp: bool,
    /// First instant packets may be generated
    pub start_ns: u64,
    /// Stop generating after this instant
    pub stop_ns: Option<u64>,
    /// Stop after this many packets
    pub count: Option<u64>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            destination: Ipv4Addr::UNSPECIFIED,
            rate_mbps: 1,
            payload_bytes: 1024,
            gos_level: 0,
            backup_lsp: false,
            start_ns: 0,
            stop_ns: None,
            count: None,
        }
    }
}

impl TrafficConfig {
    /// Time needed to send one packet at the configured rate
    fn interval_ns(&self) -> u64 {
        let bits = (IPV4_HEADER_SIZE + self.payload_bytes) as f64 * 8.0;
        (bits * 1e9 / (self.rate_mbps.max(1) as f64 * 1_048_576.0)).ceil() as u64
    }
}

/// The single port an endpoint is attached through
fn attached_port(topology: &Topology, node: NodeId) -> Option<PortId> {
    topology
        .links()
        .iter()
        .find_map(|link| link.end_of(node).map(|end| end.port))
}

/// Traffic source
#[derive(Debug)]
pub struct TrafficSender {
    id: NodeId,
    name: String,
    address: Ipv4Addr,
    flow: TrafficConfig,
    credit_ns: u64,
    generated: u64,
    packet_ids: IdGenerator,
    events: EventEmitter,
}

impl TrafficSender {
    /// Create a source sending `flow`
    pub fn new(id: NodeId, name: &str, address: Ipv4Addr, flow: TrafficConfig, event_ids: Arc<IdGenerator>) -> Self {
        info!(
            "Traffic from {} to {} at {} Mbps, GoS {}",
            name, flow.destination, flow.rate_mbps, flow.gos_level
        );
        Self {
            id,
            name: name.to_string(),
            address,
            flow,
            credit_ns: 0,
            generated: 0,
            packet_ids: IdGenerator::new("packet ids"),
            events: EventEmitter::new(id, event_ids),
        }
    }

    /// Packets generated so far
    pub fn generated(&self) -> u64 {
        self.generated
    }

    fn active_at(&self, now_ns: u64) -> bool {
        now_ns >= self.flow.start_ns
            && self.flow.stop_ns.map_or(true, |stop| now_ns <= stop)
            && self.flow.count.map_or(true, |count| self.generated < count)
    }

    fn generate(&mut self, ctx: &TickContext<'_>, port: Option<PortId>) -> Result<(), NodeError> {
        let gos = Gos::new(self.flow.gos_level, self.flow.backup_lsp);
        let header = Ipv4Header::new(self.packet_ids.generate()?, self.address, self.flow.destination).with_gos(gos);
        let packet = Packet::Ipv4(Ipv4Packet::new(
            header,
            Bytes::from(vec![0u8; self.flow.payload_bytes as usize]),
        ));
        let kind = packet.kind();
        self.generated += 1;
        self.events.emit(
            ctx.sink,
            ctx.now_ns(),
            EventKind::PacketGenerated {
                packet: kind,
                size: packet.size(),
            },
        )?;

        let carried = match port.and_then(|p| ctx.topology.link_at(self.id, p).map(|link| (p, link))) {
            Some((port, link)) => link.carry(packet, self.id).is_ok().then_some(port),
            None => None,
        };
        let event = match carried {
            Some(port) => EventKind::PacketSent { packet: kind, port },
            None => EventKind::PacketDiscarded {
                packet: kind,
                reason: DiscardReason::LinkDown,
            },
        };
        self.events.emit(ctx.sink, ctx.now_ns(), event)
    }
}

impl SimulatedNode for TrafficSender {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn role(&self) -> NodeRole {
        NodeRole::Sender
    }

    fn receive(&mut self, _ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<(), NodeError> {
        debug!("{}: ignoring {} packet on port {}", self.name, packet.kind(), port);
        Ok(())
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        if !self.active_at(ctx.now_ns()) {
            self.credit_ns = 0;
            return Ok(());
        }

        self.credit_ns = self.credit_ns.saturating_add(ctx.tick.duration_ns);
        let interval = self.flow.interval_ns();
        let port = attached_port(ctx.topology, self.id);
        while self.credit_ns >= interval && self.active_at(ctx.now_ns()) {
            self.credit_ns -= interval;
            self.generate(ctx, port)?;
        }
        Ok(())
    }
}

/// What a receiver has consumed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverStats {
    /// Packets received
    pub packets: u64,
    /// Octets received
    pub bytes: u64,
    /// Packets per kind
    pub by_kind: BTreeMap<String, u64>,
}

/// Traffic sink
#[derive(Debug)]
pub struct TrafficReceiver {
    id: NodeId,
    name: String,
    address: Ipv4Addr,
    stats: ReceiverStats,
    events: EventEmitter,
}

impl TrafficReceiver {
    /// Create a sink
    pub fn new(id: NodeId, name: &str, address: Ipv4Addr, event_ids: Arc<IdGenerator>) -> Self {
        Self {
            id,
            name: name.to_string(),
            address,
            stats: ReceiverStats::default(),
            events: EventEmitter::new(id, event_ids),
        }
    }

    /// Counters
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }
}

impl SimulatedNode for TrafficReceiver {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn role(&self) -> NodeRole {
        NodeRole::Receiver
    }

    fn receive(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<(), NodeError> {
        let kind = packet.kind();
        if !matches!(kind, PacketKind::Ipv4 | PacketKind::Ipv4Gos) {
            debug!("{}: unexpected {} packet", self.name, kind);
        }
        self.stats.packets += 1;
        self.stats.bytes += packet.size() as u64;
        *self.stats.by_kind.entry(kind.to_string()).or_default() += 1;
        self.events
            .emit(ctx.sink, ctx.now_ns(), EventKind::PacketReceived { packet: kind, port })
    }

    fn tick(&mut self, _ctx: &TickContext<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    fn as_receiver(&self) -> Option<&TrafficReceiver> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::testing::{addr, tick};
    use mplsim_topology::{LinkEnd, LinkKind};

    fn edge() -> (Topology, NodeId) {
        let mut topology = Topology::new();
        let sender = topology.add_node("sender", addr(1), NodeRole::Sender, 1).unwrap();
        let ler = topology.add_node("ler", addr(2), NodeRole::EdgeRouter, 1).unwrap();
        topology
            .add_link(
                "sender-ler",
                LinkKind::External,
                1_000,
                LinkEnd { node: sender, port: 0 },
                LinkEnd { node: ler, port: 0 },
            )
            .unwrap();
        (topology, sender)
    }

    #[test]
    fn test_interval() {
        let flow = TrafficConfig {
            rate_mbps: 1,
            payload_bytes: 108,
            ..TrafficConfig::default()
        };
        // 128 octets at 1 Mbps
        assert_eq!(flow.interval_ns(), 976_563);
    }

    #[test]
    fn test_sender_respects_count_and_rate() {
        let (topology, id) = edge();
        let sink = RecordingSink::new();
        let flow = TrafficConfig {
            destination: addr(9),
            rate_mbps: 1024,
            payload_bytes: 108,
            count: Some(5),
            ..TrafficConfig::default()
        };
        let mut sender = TrafficSender::new(id, "sender", addr(1), flow, Arc::new(IdGenerator::new("events")));

        // One packet per microsecond at this rate
        sender.tick(&tick(&topology, &sink, 2_000)).unwrap();
        assert_eq!(sender.generated(), 2);
        sender.tick(&tick(&topology, &sink, 10_000)).unwrap();
        assert_eq!(sender.generated(), 5);

        let sent = sink.count(|e| matches!(e.kind, EventKind::PacketSent { port: 0, .. }));
        assert_eq!(sent, 5);
        assert_eq!(topology.link_by_name("sender-ler").unwrap().packets_in_transit(), 5);
    }

    #[test]
    fn test_sender_waits_for_start() {
        let (topology, id) = edge();
        let sink = RecordingSink::new();
        let flow = TrafficConfig {
            destination: addr(9),
            rate_mbps: 1024,
            start_ns: 1_000_000,
            ..TrafficConfig::default()
        };
        let mut sender = TrafficSender::new(id, "sender", addr(1), flow, Arc::new(IdGenerator::new("events")));
        sender.tick(&tick(&topology, &sink, 500_000)).unwrap();
        assert_eq!(sender.generated(), 0);
    }

    #[test]
    fn test_receiver_counts() {
        let (topology, _) = edge();
        let sink = RecordingSink::new();
        let mut receiver = TrafficReceiver::new(NodeId(9), "receiver", addr(9), Arc::new(IdGenerator::new("events")));
        let header = Ipv4Header::new(1, addr(1), addr(9)).with_gos(Gos::new(1, false));
        let packet = Packet::Ipv4(Ipv4Packet::new(header, Bytes::from_static(&[0u8; 80])));

        receiver.receive(&tick(&topology, &sink, 1), 0, packet).unwrap();
        assert_eq!(receiver.stats().packets, 1);
        assert_eq!(receiver.stats().bytes, 100);
        assert_eq!(receiver.stats().by_kind.get("IPv4-GoS"), Some(&1));
        assert!(receiver.as_receiver().is_some());
    }
}
