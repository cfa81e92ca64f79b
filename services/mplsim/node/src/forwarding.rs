//! Per-tick switching of queued packets.
//!
//! Each tick grants the node `duration_ns` of switching time, carried over
//! while packets are waiting. Packets are read round-robin from the ports and
//! each costs `size * 8 * ns_per_bit`. Packets whose LSP is still being
//! signaled are parked and go back to their port at the end of the tick.

use mplsim_switching::{Entry, EntryKey, EntryType, LabelStackOperation, OutgoingLabel};
use mplsim_topology::PortId;
use mplsim_wire::{
    classify, ExpBits, Ipv4Packet, LabelStackEntry, MplsPacket, Packet, PacketKind, GOS_MARKER_LABEL,
};
use tracing::{debug, trace};

use crate::error::NodeError;
use crate::events::{DiscardReason, EventKind};
use crate::node::{Forwarder, GpsrpSpeaker, Node, TickContext, TldpSpeaker};
use crate::tldp::Side;

/// What became of a packet taken from a port
enum Outcome {
    /// Switched onto a link
    Routed,
    /// Waiting for its LSP
    Parked(Packet),
    /// Handled locally or dropped
    Consumed,
    /// Dropped without using switching time
    Refunded,
}

/// What the matrix says about a flow
enum Lookup {
    Ready(Entry),
    Wait,
    Drop(DiscardReason),
}

fn restore_marker(frame: &mut MplsPacket, marker: Option<LabelStackEntry>) {
    if let Some(marker) = marker {
        frame.label_stack.push(marker);
    }
}

impl Node {
    fn drop_packet(&mut self, ctx: &TickContext<'_>, kind: PacketKind, reason: DiscardReason) -> Result<Outcome, NodeError> {
        self.discard(ctx, kind, reason)?;
        Ok(Outcome::Consumed)
    }

    fn send(&mut self, ctx: &TickContext<'_>, entry: &Entry, packet: Packet) -> Result<Outcome, NodeError> {
        let Some(port) = entry.outgoing_port else {
            return self.drop_packet(ctx, packet.kind(), DiscardReason::Unreachable);
        };
        Ok(if self.transmit(ctx, port, packet)? {
            Outcome::Routed
        } else {
            Outcome::Consumed
        })
    }

    /// Find or create the entry for a flow and check whether it can carry traffic now
    fn lookup(
        &mut self,
        ctx: &TickContext<'_>,
        key: EntryKey,
        destination: std::net::Ipv4Addr,
    ) -> Result<Lookup, NodeError> {
        let entry = match self.matrix.find(&key) {
            Some(entry) => entry,
            None => {
                let Some(mut entry) = self.new_entry(ctx.topology, key.entry_type, key.incoming_port, destination)? else {
                    return Ok(Lookup::Drop(DiscardReason::Unreachable));
                };
                entry.label_or_fec = Some(key.label_or_fec);
                debug!("{}: new {:?} entry for {} toward {}", self.config.name, key.entry_type, key, destination);
                self.store_entry(entry)?
            }
        };

        match entry.outgoing_label {
            OutgoingLabel::Undefined => {
                let mut entry = entry;
                self.request_label(ctx, &mut entry, Side::Primary)?;
                self.matrix.upsert(entry)?;
                Ok(Lookup::Wait)
            }
            OutgoingLabel::Requested => Ok(Lookup::Wait),
            OutgoingLabel::Unavailable => Ok(Lookup::Drop(DiscardReason::LabelUnavailable)),
            OutgoingLabel::Removing | OutgoingLabel::Withdrawn => Ok(Lookup::Drop(DiscardReason::Withdrawing)),
            OutgoingLabel::Assigned | OutgoingLabel::Label(_) => Ok(Lookup::Ready(entry)),
        }
    }

    /// FEC entry key of an IPv4 flow entering on `port`
    ///
    /// Flows whose addresses hash to the same FEC are spread over the
    /// following values: the first entry toward the packet's destination
    /// wins, otherwise the first free value is used.
    fn fec_key(&self, port: PortId, packet: &Ipv4Packet) -> EntryKey {
        let destination = packet.header.destination;
        let key_for = |label_or_fec| EntryKey {
            incoming_port: port,
            label_or_fec,
            entry_type: EntryType::Fec,
        };

        let mut fec = classify(packet.header.source, destination);
        let mut free = None;
        for _ in 0..=self.matrix.len() {
            match self.matrix.find(&key_for(fec)) {
                Some(entry) if entry.tail_end == destination => return key_for(fec),
                Some(_) => {}
                None => {
                    free.get_or_insert(fec);
                }
            }
            fec = fec.wrapping_add(1);
        }
        key_for(free.unwrap_or(fec))
    }

    /// Ask for a backup LSP for flows requesting one
    fn protect(&mut self, ctx: &TickContext<'_>, entry: &mut Entry, backup_lsp: bool) -> Result<(), NodeError> {
        let protectable = matches!(
            entry.label_stack_operation,
            LabelStackOperation::Push | LabelStackOperation::Swap
        );
        if backup_lsp && protectable && entry.backup_outgoing_label == OutgoingLabel::Undefined {
            self.request_backup(ctx, entry)?;
            self.matrix.upsert(entry.clone())?;
        }
        Ok(())
    }

    /// Stamp and keep a GoS frame leaving an active node
    fn remember(&self, frame: &mut MplsPacket) {
        if self.config.role.is_active() && frame.has_gos_marker() {
            frame.header.options.stamp_active_node(self.config.address);
            self.cache_frame(frame);
        }
    }

    fn switch_ipv4(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Ipv4Packet) -> Result<Outcome, NodeError> {
        let kind = if packet.gos().is_gos() {
            PacketKind::Ipv4Gos
        } else {
            PacketKind::Ipv4
        };
        let key = self.fec_key(port, &packet);

        let mut entry = match self.lookup(ctx, key, packet.header.destination)? {
            Lookup::Ready(entry) => entry,
            Lookup::Wait => return Ok(Outcome::Parked(Packet::Ipv4(packet))),
            Lookup::Drop(reason) => return self.drop_packet(ctx, kind, reason),
        };

        let gos = packet.gos();
        self.protect(ctx, &mut entry, gos.backup_lsp)?;

        match entry.label_stack_operation {
            LabelStackOperation::Noop => self.send(ctx, &entry, Packet::Ipv4(packet)),
            LabelStackOperation::Push => {
                let Some(label) = entry.outgoing_label.label() else {
                    return self.drop_packet(ctx, kind, DiscardReason::LabelUnavailable);
                };
                let ttl = packet.header.ttl.saturating_sub(1);
                if ttl == 0 {
                    return self.drop_packet(ctx, kind, DiscardReason::TtlExpired);
                }

                let mut frame = MplsPacket::from_ipv4(packet);
                frame.label_stack.push(LabelStackEntry::new(label, gos.to_exp(), ttl)?);
                if gos.is_gos() {
                    frame
                        .label_stack
                        .push(LabelStackEntry::new(GOS_MARKER_LABEL, gos.to_exp(), ttl)?);
                }
                self.remember(&mut frame);
                self.send(ctx, &entry, Packet::Mpls(frame))
            }
            LabelStackOperation::Pop | LabelStackOperation::Swap | LabelStackOperation::Undefined => {
                self.drop_packet(ctx, kind, DiscardReason::UndefinedOperation)
            }
        }
    }

    fn switch_mpls(&mut self, ctx: &TickContext<'_>, port: PortId, mut frame: MplsPacket) -> Result<Outcome, NodeError> {
        let marker = if frame.has_gos_marker() {
            Some(frame.label_stack.pop()?)
        } else {
            None
        };
        let kind = if marker.is_some() { PacketKind::MplsGos } else { PacketKind::Mpls };
        let Some(top) = frame.label_stack.top().copied() else {
            return self.drop_packet(ctx, kind, DiscardReason::UndefinedOperation);
        };

        let key = EntryKey {
            incoming_port: port,
            label_or_fec: top.label,
            entry_type: EntryType::Label,
        };
        let mut entry = match self.lookup(ctx, key, frame.header.destination)? {
            Lookup::Ready(entry) => entry,
            Lookup::Wait => {
                restore_marker(&mut frame, marker);
                return Ok(Outcome::Parked(Packet::Mpls(frame)));
            }
            Lookup::Drop(reason) => return self.drop_packet(ctx, kind, reason),
        };

        self.protect(ctx, &mut entry, frame.header.options.gos.backup_lsp)?;

        let ttl = top.ttl.saturating_sub(1);
        if ttl == 0 {
            return self.drop_packet(ctx, kind, DiscardReason::TtlExpired);
        }

        match entry.label_stack_operation {
            LabelStackOperation::Swap | LabelStackOperation::Push => {
                let Some(label) = entry.outgoing_label.label() else {
                    return self.drop_packet(ctx, kind, DiscardReason::LabelUnavailable);
                };
                if entry.label_stack_operation == LabelStackOperation::Swap {
                    frame.label_stack.swap_top(label, ttl)?;
                } else {
                    frame.label_stack.push(LabelStackEntry::new(label, ExpBits::empty(), ttl)?);
                }
                restore_marker(&mut frame, marker);
                self.remember(&mut frame);
                self.send(ctx, &entry, Packet::Mpls(frame))
            }
            LabelStackOperation::Pop => {
                frame.label_stack.pop()?;
                if !frame.label_stack.is_empty() {
                    restore_marker(&mut frame, marker);
                    return self.send(ctx, &entry, Packet::Mpls(frame));
                }
                let mut packet = frame.into_ipv4();
                packet.header.ttl = packet.header.ttl.min(top.ttl);
                match packet.header.decrement_ttl() {
                    Ok(ttl) if ttl > 0 => self.send(ctx, &entry, Packet::Ipv4(packet)),
                    _ => self.drop_packet(ctx, kind, DiscardReason::TtlExpired),
                }
            }
            LabelStackOperation::Noop => {
                restore_marker(&mut frame, marker);
                self.send(ctx, &entry, Packet::Mpls(frame))
            }
            LabelStackOperation::Undefined => self.drop_packet(ctx, kind, DiscardReason::UndefinedOperation),
        }
    }

    fn switch(&mut self, ctx: &TickContext<'_>, port: PortId, packet: Packet) -> Result<Outcome, NodeError> {
        match packet {
            Packet::Tldp(message) => {
                self.handle_tldp(ctx, port, message)?;
                Ok(Outcome::Consumed)
            }
            Packet::Gpsrp(message) => {
                self.handle_gpsrp(ctx, port, message)?;
                Ok(Outcome::Consumed)
            }
            Packet::Ipv4(packet) if self.config.role.is_edge() => self.switch_ipv4(ctx, port, packet),
            Packet::Mpls(frame) => self.switch_mpls(ctx, port, frame),
            other => {
                self.discard(ctx, other.kind(), DiscardReason::Martian)?;
                Ok(Outcome::Refunded)
            }
        }
    }
}

impl Forwarder for Node {
    fn forward(&mut self, ctx: &TickContext<'_>) -> Result<usize, NodeError> {
        if self.ports.has_pending() {
            self.available_ns = self.available_ns.saturating_add(ctx.tick.duration_ns);
        } else {
            self.available_ns = ctx.tick.duration_ns;
        }

        let ns_per_bit = self.config.ns_per_bit();
        let mut parked = Vec::new();
        let mut routed = 0;

        loop {
            let max_octets = (self.available_ns as f64 / ns_per_bit / 8.0) as u64;
            let Some((port, packet)) = self.ports.next_packet(max_octets) else {
                break;
            };
            let cost = (packet.size() as f64 * 8.0 * ns_per_bit).ceil() as u64;
            self.available_ns = self.available_ns.saturating_sub(cost);

            let kind = packet.kind();
            trace!("{}: switching {} packet from port {}", self.config.name, kind, port);
            match self.switch(ctx, port, packet)? {
                Outcome::Routed => {
                    routed += 1;
                    self.stats.routed += 1;
                    self.emit(ctx, EventKind::PacketRouted { packet: kind })?;
                }
                Outcome::Parked(packet) => parked.push((port, packet)),
                Outcome::Consumed => {}
                Outcome::Refunded => self.available_ns = self.available_ns.saturating_add(cost),
            }
        }

        for (port, packet) in parked {
            self.ports.re_enqueue(port, packet);
        }

        if routed > 0 {
            self.ticks_without_emitting = 0;
        } else {
            self.ticks_without_emitting += 1;
        }
        Ok(routed)
    }
}
