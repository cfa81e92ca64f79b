//! Routers of the MPLS domain.
//!
//! One [`Node`] type covers every router role. The role decides which
//! capabilities are switched on: edge routers push and pop labels, active
//! routers additionally cache GoS frames and speak GPSRP. The engines live
//! in their own modules as implementations of [`Forwarder`], [`TldpSpeaker`]
//! and [`GpsrpSpeaker`].

use mplsim_storage::{FrameKey, MemoryFrameCache};
use mplsim_switching::{RetryState, SwitchingMatrix};
use mplsim_topology::error::validate_name;
use mplsim_topology::{ConfigCode, NodeId, NodeRole, PortId, Topology};
use mplsim_wire::{GpsrpPacket, MplsPacket, Packet, PacketKind, TldpPacket};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::events::{DiscardReason, EventEmitter, EventKind, EventSink};
use crate::gpsrp::GpsrpRequestEntry;
use crate::ids::IdGenerator;
use crate::port::PortSet;
use crate::traffic::TrafficReceiver;

/// One tick of simulated time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Length of the tick
    pub duration_ns: u64,
    /// Simulated time at the end of the tick
    pub upper_limit_ns: u64,
}

/// What a node sees while handling a tick or a delivery
#[derive(Clone, Copy)]
pub struct TickContext<'a> {
    /// The domain
    pub topology: &'a Topology,
    /// Event consumer
    pub sink: &'a dyn EventSink,
    /// Current tick
    pub tick: Tick,
}

impl TickContext<'_> {
    /// Timestamp used for events
    pub fn now_ns(&self) -> u64 {
        self.tick.upper_limit_ns
    }
}

/// Which next-hop computation a router uses for label requests
///
/// Label requests follow RABAN unless configured otherwise. The delay-based
/// mode exists to compare runs against shortest-delay routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Floyd-Warshall over link delays, for comparison runs only
    DelayBased,
    /// RABAN over link and node load
    LoadBased,
}

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name
    pub name: String,
    /// Address
    pub address: Ipv4Addr,
    /// Role
    pub role: NodeRole,
    /// Number of ports
    pub ports: usize,
    /// Switching power in Mbps
    pub routing_power_mbps: u32,
    /// Buffer of each port in MB
    pub buffer_mb: u64,
    /// Frame cache size in KB (active roles only)
    pub dmgp_kb: u64,
    /// Next-hop computation for label requests, RABAN by default
    pub routing: RoutingMode,
    /// TLDP retransmission timeout
    pub tldp_timeout_ns: u64,
    /// TLDP retransmissions before giving up
    pub tldp_attempts: u32,
    /// GPSRP retransmission timeout
    pub gpsrp_timeout_ns: u64,
    /// GPSRP retransmissions before giving up
    pub gpsrp_attempts: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: Ipv4Addr::UNSPECIFIED,
            role: NodeRole::LabelSwitchRouter,
            ports: 8,
            routing_power_mbps: 1024,
            buffer_mb: 1,
            dmgp_kb: 64,
            routing: RoutingMode::LoadBased,
            tldp_timeout_ns: 50_000,
            tldp_attempts: 8,
            gpsrp_timeout_ns: 50_000,
            gpsrp_attempts: 8,
        }
    }
}

impl NodeConfig {
    /// Check the node-local parameters
    pub fn validate(&self) -> Result<(), ConfigCode> {
        validate_name(&self.name, std::iter::empty())?;
        if self.routing_power_mbps == 0 {
            return Err(ConfigCode::ZeroRoutingPower);
        }
        if self.buffer_mb == 0 {
            return Err(ConfigCode::ZeroBufferSize);
        }
        if self.role.is_active() && self.dmgp_kb == 0 {
            return Err(ConfigCode::ZeroCacheSize);
        }
        Ok(())
    }

    /// Nanoseconds needed to switch one bit
    pub fn ns_per_bit(&self) -> f64 {
        1e9 / (self.routing_power_mbps as f64 * 1_048_576.0)
    }

    pub(crate) fn tldp_retry(&self) -> RetryState {
        RetryState::new(self.tldp_timeout_ns, self.tldp_attempts)
    }

    pub(crate) fn gpsrp_retry(&self) -> RetryState {
        RetryState::new(self.gpsrp_timeout_ns, self.gpsrp_attempts)
    }
}

/// Per-node counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Packets switched
    pub routed: u64,
    /// Packets put on links
    pub sent: u64,
    /// Packets dropped
    pub discarded: u64,
}

/// Per-tick packet processing
pub trait Forwarder {
    /// Drain the ports within this tick's switching budget; returns packets routed
    fn forward(&mut self, ctx: &TickContext<'_>) -> Result<usize, NodeError>;
}

/// Label distribution
pub trait TldpSpeaker {
    /// Handle a TLDP message that arrived on `port`
    fn handle_tldp(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError>;

    /// Clean up entries whose links broke
    fn check_connectivity(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError>;

    /// Retransmit outstanding requests and withdrawals, purging exhausted entries
    fn retry_tldp(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError>;
}

/// Local recovery of lost GoS frames
pub trait GpsrpSpeaker {
    /// Handle a GPSRP message that arrived on `port`
    fn handle_gpsrp(&mut self, ctx: &TickContext<'_>, port: PortId, message: GpsrpPacket) -> Result<(), NodeError>;

    /// Ask the last crossed active node to resend a frame lost here
    fn request_retransmission(&mut self, ctx: &TickContext<'_>, frame: &MplsPacket) -> Result<(), NodeError>;

    /// Resend expired requests
    fn retry_gpsrp(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError>;
}

/// Anything the simulation loop can drive
pub trait SimulatedNode: Send {
    /// Identifier
    fn id(&self) -> NodeId;

    /// Display name
    fn name(&self) -> &str;

    /// Address
    fn address(&self) -> Ipv4Addr;

    /// Role
    fn role(&self) -> NodeRole;

    /// Accept a packet handed over by a link
    fn receive(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<(), NodeError>;

    /// Run one tick to completion
    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError>;

    /// The router behind this node, if it is one
    fn as_router(&self) -> Option<&Node> {
        None
    }

    /// The traffic sink behind this node, if it is one
    fn as_receiver(&self) -> Option<&TrafficReceiver> {
        None
    }
}

/// A router of the domain
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) config: NodeConfig,
    well_configured: bool,
    pub(crate) ports: PortSet,
    pub(crate) matrix: SwitchingMatrix,
    pub(crate) cache: Option<MemoryFrameCache<MplsPacket>>,
    pub(crate) gpsrp_requests: BTreeMap<FrameKey, GpsrpRequestEntry>,
    pub(crate) sessions: IdGenerator,
    pub(crate) packet_ids: IdGenerator,
    events: EventEmitter,
    pub(crate) available_ns: u64,
    pub(crate) ticks_without_emitting: u64,
    last_congestion: u32,
    pub(crate) stats: NodeStats,
}

impl Node {
    /// Create a router from a validated configuration
    pub fn new(id: NodeId, config: NodeConfig, event_ids: Arc<IdGenerator>) -> Result<Self, NodeError> {
        config.validate().map_err(NodeError::Config)?;
        if !config.role.is_router() {
            return Err(NodeError::Config(ConfigCode::WrongRole));
        }

        let cache = if config.role.is_active() {
            Some(MemoryFrameCache::with_capacity_kb(config.dmgp_kb)?)
        } else {
            None
        };

        info!(
            "Created {} {} ({}) with {} ports at {} Mbps",
            config.role, config.name, config.address, config.ports, config.routing_power_mbps
        );

        Ok(Self {
            id,
            ports: PortSet::new(config.ports, config.buffer_mb, config.role.is_active()),
            matrix: SwitchingMatrix::new(),
            cache,
            gpsrp_requests: BTreeMap::new(),
            sessions: IdGenerator::new_u32("tldp sessions"),
            packet_ids: IdGenerator::new("packet ids"),
            events: EventEmitter::new(id, event_ids),
            available_ns: 0,
            ticks_without_emitting: 0,
            last_congestion: 0,
            stats: NodeStats::default(),
            well_configured: true,
            config,
        })
    }

    /// Apply new switching power, buffer and cache sizes
    ///
    /// An invalid configuration is rejected, the previous one stays in force
    /// and the node is flagged as not well configured until corrected.
    pub fn reconfigure(&mut self, config: NodeConfig) -> Result<(), NodeError> {
        if let Err(code) = config.validate() {
            warn!("Rejected configuration for {}: {}", self.config.name, code);
            self.well_configured = false;
            return Err(NodeError::Config(code));
        }

        if config.buffer_mb != self.config.buffer_mb {
            self.ports.resize(config.buffer_mb);
        }
        if config.dmgp_kb != self.config.dmgp_kb && self.config.role.is_active() {
            self.cache = Some(MemoryFrameCache::with_capacity_kb(config.dmgp_kb)?);
        }
        self.config.routing_power_mbps = config.routing_power_mbps;
        self.config.buffer_mb = config.buffer_mb;
        self.config.dmgp_kb = config.dmgp_kb;
        self.config.routing = config.routing;
        self.well_configured = true;
        Ok(())
    }

    /// Configuration in force
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether the last configuration attempt was valid
    pub fn is_well_configured(&self) -> bool {
        self.well_configured
    }

    /// Switching power in Mbps
    pub fn routing_power_mbps(&self) -> u32 {
        self.config.routing_power_mbps
    }

    /// Port buffer size in MB
    pub fn buffer_mb(&self) -> u64 {
        self.config.buffer_mb
    }

    /// Frame cache size in KB
    pub fn dmgp_kb(&self) -> u64 {
        self.config.dmgp_kb
    }

    /// Switching matrix
    pub fn matrix(&self) -> &SwitchingMatrix {
        &self.matrix
    }

    /// Incoming ports
    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    /// Frame cache of an active router
    pub fn cache(&self) -> Option<&MemoryFrameCache<MplsPacket>> {
        self.cache.as_ref()
    }

    /// Pending GPSRP requests
    pub fn gpsrp_requests(&self) -> impl Iterator<Item = &GpsrpRequestEntry> {
        self.gpsrp_requests.values()
    }

    /// Consecutive ticks in which nothing was routed
    pub fn ticks_without_emitting(&self) -> u64 {
        self.ticks_without_emitting
    }

    /// Counters
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// Next hop toward `destination` with the configured routing
    pub(crate) fn route(&self, topology: &Topology, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        match self.config.routing {
            RoutingMode::DelayBased => topology.next_hop_delay_based(self.config.address, destination),
            RoutingMode::LoadBased => topology.next_hop_load_based(self.config.address, destination),
        }
    }

    /// Report an event
    pub(crate) fn emit(&self, ctx: &TickContext<'_>, kind: EventKind) -> Result<(), NodeError> {
        self.events.emit(ctx.sink, ctx.now_ns(), kind)
    }

    /// Drop a packet
    pub(crate) fn discard(
        &mut self,
        ctx: &TickContext<'_>,
        packet: PacketKind,
        reason: DiscardReason,
    ) -> Result<(), NodeError> {
        debug!("{} discarded {} packet: {}", self.config.name, packet, reason);
        self.stats.discarded += 1;
        self.emit(ctx, EventKind::PacketDiscarded { packet, reason })
    }

    /// Put a packet on the link attached to `port`; false if it was dropped
    pub(crate) fn transmit(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<bool, NodeError> {
        let kind = packet.kind();
        let Some(link) = ctx.topology.link_at(self.id, port) else {
            self.discard(ctx, kind, DiscardReason::LinkDown)?;
            return Ok(false);
        };

        match link.carry(packet, self.id) {
            Ok(()) => {
                self.stats.sent += 1;
                self.emit(ctx, EventKind::PacketSent { packet: kind, port })?;
                Ok(true)
            }
            Err(_) => {
                self.discard(ctx, kind, DiscardReason::LinkDown)?;
                Ok(false)
            }
        }
    }

    /// Publish load for RABAN and report congestion changes
    fn publish_load(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        let congestion = self.ports.congestion();
        if let Some(record) = ctx.topology.node(self.id) {
            record.publish_routing_weight(congestion, self.matrix.len());
        }
        if congestion != self.last_congestion {
            self.last_congestion = congestion;
            self.emit(ctx, EventKind::NodeCongested { percent: congestion })?;
        }
        Ok(())
    }
}

impl SimulatedNode for Node {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn address(&self) -> Ipv4Addr {
        self.config.address
    }

    fn role(&self) -> NodeRole {
        self.config.role
    }

    fn receive(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<(), NodeError> {
        let packet = match self.ports.enqueue(port, packet) {
            Ok(()) => return Ok(()),
            Err(packet) => packet,
        };

        self.discard(ctx, packet.kind(), DiscardReason::BufferOverflow)?;
        if let Packet::Mpls(frame) = &packet {
            if self.config.role.is_active() && frame.has_gos_marker() {
                self.request_retransmission(ctx, frame)?;
            }
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        self.check_connectivity(ctx)?;
        self.retry_tldp(ctx)?;
        if self.config.role.is_active() {
            self.retry_gpsrp(ctx)?;
        }
        self.forward(ctx)?;
        self.publish_load(ctx)
    }

    fn as_router(&self) -> Option<&Node> {
        Some(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn config(name: &str, last: u8, role: NodeRole) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            address: Ipv4Addr::new(10, 0, 0, last),
            role,
            ports: 4,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config("lsr", 1, NodeRole::LabelSwitchRouter);
        assert_eq!(cfg.validate(), Ok(()));

        cfg.routing_power_mbps = 0;
        assert_eq!(cfg.validate(), Err(ConfigCode::ZeroRoutingPower));

        let mut cfg = config("a-lsr", 1, NodeRole::ActiveLabelSwitchRouter);
        cfg.dmgp_kb = 0;
        assert_eq!(cfg.validate(), Err(ConfigCode::ZeroCacheSize));

        let cfg = config("  ", 1, NodeRole::EdgeRouter);
        assert_eq!(cfg.validate(), Err(ConfigCode::BlankName));
    }

    #[test]
    fn test_label_requests_default_to_raban() {
        let cfg = config("lsr", 1, NodeRole::LabelSwitchRouter);
        assert_eq!(cfg.routing, RoutingMode::LoadBased);
        let parsed: NodeConfig = serde_json::from_str(r#"{"name": "lsr"}"#).unwrap();
        assert_eq!(parsed.routing, RoutingMode::LoadBased);
    }

    #[test]
    fn test_ns_per_bit() {
        let mut cfg = config("lsr", 1, NodeRole::LabelSwitchRouter);
        cfg.routing_power_mbps = 1000;
        let expected = 1e9 / (1000.0 * 1_048_576.0);
        assert!((cfg.ns_per_bit() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_reconfigure_keeps_previous_on_error() {
        let ids = Arc::new(IdGenerator::new("events"));
        let mut node = Node::new(NodeId(1), config("lsr", 1, NodeRole::LabelSwitchRouter), ids).unwrap();

        let mut bad = node.config().clone();
        bad.buffer_mb = 0;
        assert_eq!(node.reconfigure(bad), Err(NodeError::Config(ConfigCode::ZeroBufferSize)));
        assert!(!node.is_well_configured());
        assert_eq!(node.buffer_mb(), 1);

        let mut good = node.config().clone();
        good.routing_power_mbps = 2048;
        node.reconfigure(good).unwrap();
        assert!(node.is_well_configured());
        assert_eq!(node.routing_power_mbps(), 2048);
    }

    #[test]
    fn test_active_role_gets_cache() {
        let ids = Arc::new(IdGenerator::new("events"));
        let active = Node::new(NodeId(1), config("a", 1, NodeRole::ActiveEdgeRouter), ids.clone()).unwrap();
        assert!(active.cache().is_some());
        let plain = Node::new(NodeId(2), config("b", 2, NodeRole::EdgeRouter), ids.clone()).unwrap();
        assert!(plain.cache().is_none());

        let err = Node::new(NodeId(3), config("c", 3, NodeRole::Sender), ids).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn test_overflow_is_discarded() {
        let topology = Topology::new();
        let sink = crate::events::RecordingSink::new();
        let ctx = TickContext {
            topology: &topology,
            sink: &sink,
            tick: Tick {
                duration_ns: 100,
                upper_limit_ns: 100,
            },
        };
        let ids = Arc::new(IdGenerator::new("events"));
        let mut node = Node::new(NodeId(1), config("lsr", 1, NodeRole::LabelSwitchRouter), ids).unwrap();

        let header = mplsim_wire::Ipv4Header::new(1, Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(10, 0, 0, 8));
        let big = Packet::from(mplsim_wire::Ipv4Packet::new(header, bytes::Bytes::from(vec![0u8; 2 << 20])));
        node.receive(&ctx, 0, big).unwrap();

        assert_eq!(node.stats().discarded, 1);
        assert_eq!(
            sink.count(|e| matches!(
                e.kind,
                EventKind::PacketDiscarded {
                    reason: DiscardReason::BufferOverflow,
                    ..
                }
            )),
            1
        );
    }
}
