//! Actor runtime: one tokio task per node.
//!
//! The scheduler owns the clock and the links. Each tick it sends every node
//! the packets that reached it, then a tick command, and waits until every
//! node has acknowledged before the next tick starts. Commands to one node
//! are handled in the order they were sent, so deliveries always precede the
//! tick they belong to.

use futures::future::join_all;
use mplsim_topology::{NodeId, PortId, Topology};
use mplsim_wire::Packet;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::events::EventSink;
use crate::ids::IdGenerator;
use crate::node::{SimulatedNode, Tick, TickContext};
use crate::simulation::{LinkSchedule, ScheduledLinkEvent, Simulation};

/// Message to a node task
#[derive(Debug)]
pub enum NodeCommand {
    /// A packet reached the node on `port`
    Deliver {
        /// Tick the packet arrived in
        tick: Tick,
        /// Arrival port
        port: PortId,
        /// The packet
        packet: Packet,
    },
    /// Run one tick and report back
    Tick {
        /// The tick
        tick: Tick,
        /// Completion of the tick
        ack: oneshot::Sender<Result<(), NodeError>>,
    },
}

struct NodeHandle {
    tx: mpsc::UnboundedSender<NodeCommand>,
    task: JoinHandle<Box<dyn SimulatedNode>>,
}

async fn run_node(
    mut node: Box<dyn SimulatedNode>,
    topology: Arc<Topology>,
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<NodeCommand>,
) -> Box<dyn SimulatedNode> {
    debug!("Node task {} started", node.name());
    // first delivery failure of the tick, reported with its ack
    let mut failed: Option<NodeError> = None;
    while let Some(command) = rx.recv().await {
        match command {
            NodeCommand::Deliver { tick, port, packet } => {
                let ctx = TickContext {
                    topology: &topology,
                    sink: sink.as_ref(),
                    tick,
                };
                if let Err(e) = node.receive(&ctx, port, packet) {
                    error!("Node {} failed to receive on port {}: {}", node.name(), port, e);
                    failed.get_or_insert(e);
                }
            }
            NodeCommand::Tick { tick, ack } => {
                let ctx = TickContext {
                    topology: &topology,
                    sink: sink.as_ref(),
                    tick,
                };
                let result = match failed.take() {
                    Some(e) => Err(e),
                    None => node.tick(&ctx),
                };
                if ack.send(result).is_err() {
                    warn!("Scheduler went away during tick of {}", node.name());
                    break;
                }
            }
        }
    }
    debug!("Node task {} stopped", node.name());
    node
}

/// Concurrent driver of a simulation
pub struct Runtime {
    topology: Arc<Topology>,
    sink: Arc<dyn EventSink>,
    event_ids: Arc<IdGenerator>,
    schedule: LinkSchedule,
    handles: BTreeMap<NodeId, NodeHandle>,
    tick_ns: u64,
    now_ns: u64,
}

impl Runtime {
    /// Spawn one task per node of `simulation`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(simulation: Simulation) -> Self {
        let Simulation {
            topology,
            nodes,
            sink,
            event_ids,
            schedule,
            tick_ns,
            now_ns,
        } = simulation;

        let handles = nodes
            .into_iter()
            .map(|(id, node)| {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_node(node, topology.clone(), sink.clone(), rx));
                (id, NodeHandle { tx, task })
            })
            .collect::<BTreeMap<_, _>>();
        info!("Started {} node tasks", handles.len());

        Self {
            topology,
            sink,
            event_ids,
            schedule,
            handles,
            tick_ns,
            now_ns,
        }
    }

    /// Break or restore a link at `event.at_ns`
    pub fn schedule_link_event(&mut self, event: ScheduledLinkEvent) {
        self.schedule.insert(event);
    }

    /// Advance by one tick, returning once every node has finished it
    pub async fn step(&mut self) -> Result<(), NodeError> {
        let tick = Tick {
            duration_ns: self.tick_ns,
            upper_limit_ns: self.now_ns + self.tick_ns,
        };
        self.now_ns = tick.upper_limit_ns;
        self.schedule
            .apply(&self.topology, tick, self.sink.as_ref(), &self.event_ids)?;

        for delivery in self.topology.tick_links(tick.duration_ns) {
            let Some(handle) = self.handles.get(&delivery.node) else {
                warn!("No node {} to receive a {} packet", delivery.node, delivery.packet.kind());
                continue;
            };
            let command = NodeCommand::Deliver {
                tick,
                port: delivery.port,
                packet: delivery.packet,
            };
            if handle.tx.send(command).is_err() {
                return Err(NodeError::TaskFailed(format!("node {} stopped", delivery.node)));
            }
        }

        let mut acks = Vec::with_capacity(self.handles.len());
        for (id, handle) in &self.handles {
            let (ack, done) = oneshot::channel();
            if handle.tx.send(NodeCommand::Tick { tick, ack }).is_err() {
                return Err(NodeError::TaskFailed(format!("node {} stopped", id)));
            }
            acks.push((*id, done));
        }

        let results = join_all(acks.into_iter().map(|(id, done)| async move { (id, done.await) })).await;
        for (id, result) in results {
            match result {
                Ok(outcome) => outcome?,
                Err(_) => return Err(NodeError::TaskFailed(format!("node {} dropped its tick", id))),
            }
        }
        Ok(())
    }

    /// Advance by `steps` ticks
    pub async fn run(&mut self, steps: u64) -> Result<(), NodeError> {
        for _ in 0..steps {
            self.step().await?;
        }
        Ok(())
    }

    /// Simulated time
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Stop every task and hand the simulation back
    pub async fn shutdown(self) -> Result<Simulation, NodeError> {
        let mut nodes = BTreeMap::new();
        for (id, handle) in self.handles {
            drop(handle.tx);
            let node = handle
                .task
                .await
                .map_err(|e| NodeError::TaskFailed(format!("node {}: {}", id, e)))?;
            nodes.insert(id, node);
        }
        info!("Stopped {} node tasks at {} ns", nodes.len(), self.now_ns);

        Ok(Simulation {
            topology: self.topology,
            nodes,
            sink: self.sink,
            event_ids: self.event_ids,
            schedule: self.schedule,
            tick_ns: self.tick_ns,
            now_ns: self.now_ns,
        })
    }
}
