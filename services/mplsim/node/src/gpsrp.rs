//! Local retransmission of lost GoS frames.
//!
//! An active node dropping a GoS frame asks the last active node the frame
//! crossed to resend it from its frame cache. Requests and answers are
//! routed hop by hop with the load-based next hop; only the addressed node
//! acts on them.

use mplsim_storage::{FrameCache, FrameKey};
use mplsim_switching::RetryState;
use mplsim_topology::{PortId, Topology};
use mplsim_wire::{flow_id, GpsrpKind, GpsrpPacket, Ipv4Header, MplsPacket, Packet, PacketKind};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::events::DiscardReason;
use crate::node::{GpsrpSpeaker, Node, TickContext};

/// A retransmission this node is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpsrpRequestEntry {
    /// Flow of the lost frame
    pub flow_id: u32,
    /// Identifier of the lost frame
    pub packet_id: u64,
    /// Active node asked to resend
    pub crossed_active_node: Ipv4Addr,
    /// Port the request leaves on
    pub outgoing_port: PortId,
    /// Retransmission timer
    pub retry: RetryState,
}

impl GpsrpRequestEntry {
    fn key(&self) -> FrameKey {
        FrameKey::new(self.flow_id, self.packet_id)
    }
}

impl Node {
    /// Port leading toward `destination` for GPSRP traffic
    fn gpsrp_port(&self, topology: &Topology, destination: Ipv4Addr) -> Option<PortId> {
        let hop = topology.next_hop_load_based(self.config.address, destination)?;
        topology.port_towards(self.id, hop).map(|(port, _)| port)
    }

    fn send_gpsrp(
        &mut self,
        ctx: &TickContext<'_>,
        port: PortId,
        kind: GpsrpKind,
        destination: Ipv4Addr,
        key: FrameKey,
    ) -> Result<(), NodeError> {
        let message = GpsrpPacket {
            header: Ipv4Header::new(self.packet_ids.generate()?, self.config.address, destination),
            kind,
            flow_id: key.flow_id,
            packet_id: key.packet_id,
        };
        debug!("{}: {} for {} to {}", self.config.name, kind, key, destination);
        self.transmit(ctx, port, message.into())?;
        Ok(())
    }

    /// Store a forwarded GoS frame for later retransmission
    pub(crate) fn cache_frame(&self, frame: &MplsPacket) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let key = FrameKey::new(flow_id(frame.header.source), frame.header.packet_id);
        match cache.insert(key, frame.clone(), frame.size() as u64) {
            Ok(evicted) if !evicted.is_empty() => {
                debug!("{}: cached {}, evicted {} frames", self.config.name, key, evicted.len());
            }
            Ok(_) => {}
            Err(e) => warn!("{}: could not cache {}: {}", self.config.name, key, e),
        }
    }
}

impl GpsrpSpeaker for Node {
    fn handle_gpsrp(&mut self, ctx: &TickContext<'_>, port: PortId, message: GpsrpPacket) -> Result<(), NodeError> {
        let destination = message.header.destination;
        if destination != self.config.address {
            return match self.gpsrp_port(ctx.topology, destination) {
                Some(out) => self.transmit(ctx, out, message.into()).map(|_| ()),
                None => self.discard(ctx, PacketKind::Gpsrp, DiscardReason::Unreachable),
            };
        }

        let key = FrameKey::new(message.flow_id, message.packet_id);
        match message.kind {
            GpsrpKind::RetransmissionRequest => {
                let cached = self.cache.as_ref().and_then(|cache| cache.get(&key));
                let requester = message.header.source;
                match cached {
                    Some(frame) => {
                        info!("{}: resending {} for {}", self.config.name, key, requester);
                        self.transmit(ctx, port, Packet::Mpls(frame))?;
                        self.send_gpsrp(ctx, port, GpsrpKind::RetransmissionOk, requester, key)
                    }
                    None => {
                        debug!("{}: {} is no longer cached", self.config.name, key);
                        self.send_gpsrp(ctx, port, GpsrpKind::RetransmissionNotPossible, requester, key)
                    }
                }
            }
            GpsrpKind::RetransmissionOk => {
                if self.gpsrp_requests.remove(&key).is_some() {
                    info!("{}: frame {} recovered", self.config.name, key);
                }
                Ok(())
            }
            GpsrpKind::RetransmissionNotPossible => {
                let Some(mut request) = self.gpsrp_requests.remove(&key) else {
                    return Ok(());
                };
                if !request.retry.take_attempt() {
                    warn!("{}: giving up on frame {}", self.config.name, key);
                    return Ok(());
                }
                let (target, out) = (request.crossed_active_node, request.outgoing_port);
                self.gpsrp_requests.insert(key, request);
                self.send_gpsrp(ctx, out, GpsrpKind::RetransmissionRequest, target, key)
            }
        }
    }

    fn request_retransmission(&mut self, ctx: &TickContext<'_>, frame: &MplsPacket) -> Result<(), NodeError> {
        if !self.config.role.is_active() {
            return Ok(());
        }
        let key = FrameKey::new(flow_id(frame.header.source), frame.header.packet_id);
        if self.gpsrp_requests.contains_key(&key) {
            return Ok(());
        }

        let Some(target) = frame.header.options.last_active_node_except(self.config.address) else {
            debug!("{}: no active node upstream of {}", self.config.name, key);
            return Ok(());
        };
        let Some(port) = self.gpsrp_port(ctx.topology, target) else {
            debug!("{}: active node {} unreachable", self.config.name, target);
            return Ok(());
        };

        info!("{}: asking {} to resend {}", self.config.name, target, key);
        let request = GpsrpRequestEntry {
            flow_id: key.flow_id,
            packet_id: key.packet_id,
            crossed_active_node: target,
            outgoing_port: port,
            retry: self.config.gpsrp_retry(),
        };
        self.gpsrp_requests.insert(key, request);
        self.send_gpsrp(ctx, port, GpsrpKind::RetransmissionRequest, target, key)
    }

    fn retry_gpsrp(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        let elapsed = ctx.tick.duration_ns;
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for request in self.gpsrp_requests.values_mut() {
            if !request.retry.advance(elapsed) {
                continue;
            }
            if request.retry.take_attempt() {
                due.push((request.key(), request.crossed_active_node, request.outgoing_port));
            } else {
                exhausted.push(request.key());
            }
        }

        for key in exhausted {
            self.gpsrp_requests.remove(&key);
            warn!("{}: GPSRP retries exhausted for frame {}", self.config.name, key);
        }
        for (key, target, port) in due {
            self.send_gpsrp(ctx, port, GpsrpKind::RetransmissionRequest, target, key)?;
        }
        Ok(())
    }
}
