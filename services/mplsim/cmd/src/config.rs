//! Scenario configuration.
//!
//! A scenario is a YAML file describing the simulation timing, the nodes and
//! links of the domain, the traffic flows and the link events to replay.
//! Anything missing falls back to the built-in three-router line, and a few
//! environment variables override the file.

use anyhow::{bail, Context, Result};
use mplsim_node::{EventSink, NodeConfig, RoutingMode, ScheduledLinkEvent, Simulation, TrafficConfig};
use mplsim_topology::{LinkEnd, LinkKind, NodeRole, PortId, Topology};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Simulation timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Length of one tick
    pub tick_ns: u64,
    /// Ticks to run
    pub steps: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_ns: 10_000,
            steps: 2_000,
        }
    }
}

/// One node of the domain or of its surroundings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique name
    pub name: String,
    /// Unique address
    pub address: Ipv4Addr,
    /// Role
    pub role: NodeRole,
    /// Number of ports
    #[serde(default = "default_ports")]
    pub ports: usize,
    /// Switching power in Mbps (routers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_power_mbps: Option<u32>,
    /// Buffer of each port in MB (routers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_mb: Option<u64>,
    /// Frame cache in KB (active routers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmgp_kb: Option<u64>,
    /// Next-hop computation (routers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingMode>,
}

fn default_ports() -> usize {
    8
}

impl NodeSpec {
    fn new(name: &str, address: Ipv4Addr, role: NodeRole, ports: usize) -> Self {
        Self {
            name: name.to_string(),
            address,
            role,
            ports,
            routing_power_mbps: None,
            buffer_mb: None,
            dmgp_kb: None,
            routing: None,
        }
    }

    fn router_config(&self) -> NodeConfig {
        let defaults = NodeConfig::default();
        NodeConfig {
            name: self.name.clone(),
            address: self.address,
            role: self.role,
            ports: self.ports,
            routing_power_mbps: self.routing_power_mbps.unwrap_or(defaults.routing_power_mbps),
            buffer_mb: self.buffer_mb.unwrap_or(defaults.buffer_mb),
            dmgp_kb: self.dmgp_kb.unwrap_or(defaults.dmgp_kb),
            routing: self.routing.unwrap_or(defaults.routing),
            ..defaults
        }
    }
}

/// A node port a link is plugged into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRef {
    /// Node name
    pub node: String,
    /// Port index
    pub port: PortId,
}

/// One link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Unique name
    pub name: String,
    /// Inside the domain or on its edge
    pub kind: LinkKind,
    /// Propagation delay
    pub delay_ns: u64,
    /// First end
    pub a: PortRef,
    /// Second end
    pub b: PortRef,
}

/// Traffic from a sender to a receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Sender node name
    pub from: String,
    /// Receiver node name
    pub to: String,
    /// Rate, size, GoS and timing of the flow
    #[serde(flatten)]
    pub traffic: TrafficConfig,
}

/// A link breaking or coming back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEventSpec {
    /// Simulated time of the event
    pub at_ns: u64,
    /// Link name
    pub link: String,
    /// Broken after the event
    pub broken: bool,
}

/// Complete scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Timing
    pub simulation: SimulationConfig,
    /// Nodes
    pub nodes: Vec<NodeSpec>,
    /// Links
    pub links: Vec<LinkSpec>,
    /// Traffic flows, at most one per sender
    pub flows: Vec<FlowSpec>,
    /// Link events
    pub link_events: Vec<LinkEventSpec>,
}

impl Default for ScenarioConfig {
    /// sender - ler-a - lsr - ler-b - receiver with one best-effort flow
    fn default() -> Self {
        let addr = |last| Ipv4Addr::new(10, 0, 0, last);
        let port = |node: &str, port| PortRef {
            node: node.to_string(),
            port,
        };
        let link = |name: &str, kind, a, b| LinkSpec {
            name: name.to_string(),
            kind,
            delay_ns: 1_000,
            a,
            b,
        };

        Self {
            simulation: SimulationConfig::default(),
            nodes: vec![
                NodeSpec::new("sender", addr(1), NodeRole::Sender, 1),
                NodeSpec::new("ler-a", addr(2), NodeRole::EdgeRouter, 2),
                NodeSpec::new("lsr", addr(3), NodeRole::LabelSwitchRouter, 2),
                NodeSpec::new("ler-b", addr(4), NodeRole::EdgeRouter, 2),
                NodeSpec::new("receiver", addr(5), NodeRole::Receiver, 1),
            ],
            links: vec![
                link("sender-ler-a", LinkKind::External, port("sender", 0), port("ler-a", 0)),
                link("ler-a-lsr", LinkKind::Internal, port("ler-a", 1), port("lsr", 0)),
                link("lsr-ler-b", LinkKind::Internal, port("lsr", 1), port("ler-b", 0)),
                link("ler-b-receiver", LinkKind::External, port("ler-b", 1), port("receiver", 0)),
            ],
            flows: vec![FlowSpec {
                from: "sender".to_string(),
                to: "receiver".to_string(),
                traffic: TrafficConfig {
                    rate_mbps: 2,
                    ..TrafficConfig::default()
                },
            }],
            link_events: Vec::new(),
        }
    }
}

impl ScenarioConfig {
    /// Read a scenario file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&content).with_context(|| format!("parsing scenario {}", path.display()))?;
        info!(
            "Loaded scenario {} with {} nodes, {} links and {} flows",
            path.display(),
            config.nodes.len(),
            config.links.len(),
            config.flows.len()
        );
        Ok(config)
    }

    /// Apply `MPLSIM_TICK_NS` and `MPLSIM_STEPS`
    pub fn apply_environment_overrides(&mut self) {
        if let Ok(value) = std::env::var("MPLSIM_TICK_NS") {
            match value.parse::<u64>() {
                Ok(tick_ns) => {
                    self.simulation.tick_ns = tick_ns;
                    info!("Tick overridden by environment: {} ns", tick_ns);
                }
                Err(_) => warn!("Ignoring MPLSIM_TICK_NS={}", value),
            }
        }

        if let Ok(value) = std::env::var("MPLSIM_STEPS") {
            match value.parse::<u64>() {
                Ok(steps) => {
                    self.simulation.steps = steps;
                    info!("Steps overridden by environment: {}", steps);
                }
                Err(_) => warn!("Ignoring MPLSIM_STEPS={}", value),
            }
        }
    }

    fn node(&self, name: &str) -> Result<&NodeSpec> {
        match self.nodes.iter().find(|n| n.name == name) {
            Some(node) => Ok(node),
            None => bail!("unknown node {}", name),
        }
    }

    fn topology(&self) -> Result<Topology> {
        let mut topology = Topology::new();
        for node in &self.nodes {
            topology.add_node(&node.name, node.address, node.role, node.ports)?;
        }
        for link in &self.links {
            let end = |port: &PortRef| -> Result<LinkEnd> {
                let record = topology
                    .node_by_name(&port.node)
                    .with_context(|| format!("link {} refers to unknown node {}", link.name, port.node))?;
                Ok(LinkEnd {
                    node: record.id,
                    port: port.port,
                })
            };
            let (a, b) = (end(&link.a)?, end(&link.b)?);
            topology.add_link(&link.name, link.kind, link.delay_ns, a, b)?;
        }
        Ok(topology)
    }

    /// Build the simulation this scenario describes
    pub fn build(&self, sink: Arc<dyn EventSink>) -> Result<Simulation> {
        let mut sim = Simulation::new(self.topology()?, sink, self.simulation.tick_ns)?;

        let mut senders = BTreeSet::new();
        for flow in &self.flows {
            let from = self.node(&flow.from)?;
            let to = self.node(&flow.to)?;
            if from.role != NodeRole::Sender || to.role != NodeRole::Receiver {
                bail!("flow {} -> {} must go from a sender to a receiver", flow.from, flow.to);
            }
            if !senders.insert(flow.from.as_str()) {
                bail!("sender {} has more than one flow", flow.from);
            }
            let traffic = TrafficConfig {
                destination: to.address,
                ..flow.traffic.clone()
            };
            sim.add_sender(&flow.from, traffic)?;
        }

        for node in &self.nodes {
            match node.role {
                NodeRole::Sender if !senders.contains(node.name.as_str()) => {
                    warn!("Sender {} has no flow and stays silent", node.name);
                }
                NodeRole::Sender => {}
                NodeRole::Receiver => {
                    sim.add_receiver(&node.name)?;
                }
                _ => {
                    sim.add_router(node.router_config())?;
                }
            }
        }

        for event in &self.link_events {
            let link = sim
                .topology()
                .link_by_name(&event.link)
                .with_context(|| format!("link event refers to unknown link {}", event.link))?
                .id;
            sim.schedule_link_event(ScheduledLinkEvent {
                at_ns: event.at_ns,
                link,
                broken: event.broken,
            })?;
        }
        Ok(sim)
    }
}
