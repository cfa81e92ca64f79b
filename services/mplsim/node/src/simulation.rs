//! Sequential simulation loop.
//!
//! Every step advances the clock by one tick, applies the link events that
//! fell due, hands the packets that finished crossing a link to their
//! receiving node and then runs each node's tick in identifier order.

use mplsim_topology::{LinkId, NodeId, PortId, Topology, TopologyError};
use mplsim_wire::Packet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::events::{DiscardReason, EventEmitter, EventKind, EventSink};
use crate::ids::IdGenerator;
use crate::node::{Node, NodeConfig, SimulatedNode, Tick, TickContext};
use crate::traffic::{TrafficConfig, TrafficReceiver, TrafficSender};

/// A link breaking or coming back at a given time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledLinkEvent {
    /// When it happens
    pub at_ns: u64,
    /// Which link
    pub link: LinkId,
    /// Broken after the event
    pub broken: bool,
}

/// Pending link events, earliest first
#[derive(Debug, Default)]
pub(crate) struct LinkSchedule {
    pending: VecDeque<ScheduledLinkEvent>,
}

impl LinkSchedule {
    pub(crate) fn insert(&mut self, event: ScheduledLinkEvent) {
        let at = self.pending.partition_point(|e| e.at_ns <= event.at_ns);
        self.pending.insert(at, event);
    }

    /// Apply every event due by the end of `tick`
    pub(crate) fn apply(
        &mut self,
        topology: &Topology,
        tick: Tick,
        sink: &dyn EventSink,
        event_ids: &Arc<IdGenerator>,
    ) -> Result<(), NodeError> {
        while self.pending.front().map_or(false, |e| e.at_ns <= tick.upper_limit_ns) {
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            let link = topology.link(event.link).ok_or(TopologyError::UnknownLink(event.link))?;
            let lost = topology.set_link_broken(event.link, event.broken)?;
            info!(
                "Link {} {} at {} ns",
                link.name,
                if event.broken { "broken" } else { "restored" },
                tick.upper_limit_ns
            );
            if lost.is_empty() {
                continue;
            }

            warn!("{} packets lost in transit on link {}", lost.len(), link.name);
            let emitter = EventEmitter::new(link.ends[0].node, event_ids.clone());
            for packet in lost {
                emitter.emit(
                    sink,
                    tick.upper_limit_ns,
                    EventKind::PacketDiscarded {
                        packet: packet.kind(),
                        reason: DiscardReason::LostInTransit,
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Check that `node` is a node of `topology` and not driven yet
pub(crate) fn check_node(
    topology: &Topology,
    nodes: &BTreeMap<NodeId, Box<dyn SimulatedNode>>,
    node: &dyn SimulatedNode,
) -> Result<(), NodeError> {
    let record = topology
        .node(node.id())
        .filter(|record| record.address == node.address())
        .ok_or(TopologyError::UnknownNode(node.id()))?;
    if nodes.contains_key(&record.id) {
        return Err(NodeError::DuplicateNode(record.id));
    }
    Ok(())
}

/// A domain and the nodes driving it, advanced one tick at a time
pub struct Simulation {
    pub(crate) topology: Arc<Topology>,
    pub(crate) nodes: BTreeMap<NodeId, Box<dyn SimulatedNode>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) event_ids: Arc<IdGenerator>,
    pub(crate) schedule: LinkSchedule,
    pub(crate) tick_ns: u64,
    pub(crate) now_ns: u64,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("now_ns", &self.now_ns)
            .field("tick_ns", &self.tick_ns)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("pending_link_events", &self.schedule.pending.len())
            .finish()
    }
}

impl Simulation {
    /// Create a simulation over `topology` with ticks of `tick_ns`
    pub fn new(topology: Topology, sink: Arc<dyn EventSink>, tick_ns: u64) -> Result<Self, NodeError> {
        if tick_ns == 0 {
            return Err(NodeError::ZeroTick);
        }
        Ok(Self {
            topology: Arc::new(topology),
            nodes: BTreeMap::new(),
            sink,
            event_ids: Arc::new(IdGenerator::new("event ids")),
            schedule: LinkSchedule::default(),
            tick_ns,
            now_ns: 0,
        })
    }

    /// Identifier space shared by all event emitters
    pub fn event_ids(&self) -> Arc<IdGenerator> {
        self.event_ids.clone()
    }

    /// Drive `node` from now on
    pub fn add_node(&mut self, node: Box<dyn SimulatedNode>) -> Result<NodeId, NodeError> {
        check_node(&self.topology, &self.nodes, node.as_ref())?;
        let id = node.id();
        debug!("Driving node {} ({})", node.name(), id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn record(&self, name: &str) -> Result<(NodeId, std::net::Ipv4Addr), NodeError> {
        self.topology
            .node_by_name(name)
            .map(|record| (record.id, record.address))
            .ok_or_else(|| {
                TopologyError::Config {
                    subject: name.to_string(),
                    code: mplsim_topology::ConfigCode::UnknownNode,
                }
                .into()
            })
    }

    /// Create the router registered in the topology under `config.name`
    pub fn add_router(&mut self, config: NodeConfig) -> Result<NodeId, NodeError> {
        let (id, _) = self.record(&config.name)?;
        let node = Node::new(id, config, self.event_ids.clone())?;
        self.add_node(Box::new(node))
    }

    /// Create a traffic source for the topology node `name`
    pub fn add_sender(&mut self, name: &str, flow: TrafficConfig) -> Result<NodeId, NodeError> {
        let (id, address) = self.record(name)?;
        let sender = TrafficSender::new(id, name, address, flow, self.event_ids.clone());
        self.add_node(Box::new(sender))
    }

    /// Create a traffic sink for the topology node `name`
    pub fn add_receiver(&mut self, name: &str) -> Result<NodeId, NodeError> {
        let (id, address) = self.record(name)?;
        let receiver = TrafficReceiver::new(id, name, address, self.event_ids.clone());
        self.add_node(Box::new(receiver))
    }

    /// Break or restore a link at `event.at_ns`
    pub fn schedule_link_event(&mut self, event: ScheduledLinkEvent) -> Result<(), NodeError> {
        self.topology
            .link(event.link)
            .ok_or(TopologyError::UnknownLink(event.link))?;
        self.schedule.insert(event);
        Ok(())
    }

    /// Hand `packet` to node `id` as if a link had just delivered it on `port`
    pub fn deliver(&mut self, id: NodeId, port: PortId, packet: Packet) -> Result<(), NodeError> {
        let ctx = TickContext {
            topology: &self.topology,
            sink: self.sink.as_ref(),
            tick: Tick {
                duration_ns: self.tick_ns,
                upper_limit_ns: self.now_ns,
            },
        };
        let node = self.nodes.get_mut(&id).ok_or(TopologyError::UnknownNode(id))?;
        node.receive(&ctx, port, packet)
    }

    /// Advance by one tick
    pub fn step(&mut self) -> Result<(), NodeError> {
        let tick = Tick {
            duration_ns: self.tick_ns,
            upper_limit_ns: self.now_ns + self.tick_ns,
        };
        self.now_ns = tick.upper_limit_ns;
        self.schedule
            .apply(&self.topology, tick, self.sink.as_ref(), &self.event_ids)?;

        let ctx = TickContext {
            topology: &self.topology,
            sink: self.sink.as_ref(),
            tick,
        };
        for delivery in self.topology.tick_links(tick.duration_ns) {
            match self.nodes.get_mut(&delivery.node) {
                Some(node) => node.receive(&ctx, delivery.port, delivery.packet)?,
                None => warn!("No node {} to receive a {} packet", delivery.node, delivery.packet.kind()),
            }
        }
        for node in self.nodes.values_mut() {
            node.tick(&ctx)?;
        }
        Ok(())
    }

    /// Advance by `steps` ticks
    pub fn run(&mut self, steps: u64) -> Result<(), NodeError> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Advance until the clock reaches `time_ns`
    pub fn run_until(&mut self, time_ns: u64) -> Result<(), NodeError> {
        while self.now_ns < time_ns {
            self.step()?;
        }
        Ok(())
    }

    /// Simulated time
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Tick length
    pub fn tick_ns(&self) -> u64 {
        self.tick_ns
    }

    /// The domain
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Every driven node, by identifier
    pub fn nodes(&self) -> impl Iterator<Item = &dyn SimulatedNode> {
        self.nodes.values().map(|node| node.as_ref())
    }

    /// Node by identifier
    pub fn node(&self, id: NodeId) -> Option<&dyn SimulatedNode> {
        self.nodes.get(&id).map(|node| node.as_ref())
    }

    /// Router by topology name
    pub fn router(&self, name: &str) -> Option<&Node> {
        let record = self.topology.node_by_name(name)?;
        self.node(record.id)?.as_router()
    }

    /// Traffic sink by topology name
    pub fn receiver(&self, name: &str) -> Option<&TrafficReceiver> {
        let record = self.topology.node_by_name(name)?;
        self.node(record.id)?.as_receiver()
    }
}
