//! Label distribution engine.
//!
//! LSPs are built on demand, hop by hop toward the tail end. A node needing
//! a label sends a `LabelRequest` to its next hop and parks the traffic; the
//! answer travels back upstream one hop at a time, each hop allocating the
//! label it wants to receive on. Teardown uses `LabelRemovalRequest` and
//! its acknowledgement in either direction.
//!
//! Messages travelling toward the tail end (`Forward`) carry the upstream
//! node's local session and are matched on `(incoming port, upstream
//! session)`. Messages travelling back (`Backward`, `BackwardBackup`) carry
//! our own local session and are matched on it plus the arrival port, which
//! tells the primary and backup paths apart.

use mplsim_switching::{Entry, EntryType, LabelStackOperation, OutgoingLabel, RetryState, Withdrawal};
use mplsim_topology::{LinkKind, PortId, Topology};
use mplsim_wire::{Ipv4Header, Label, PacketKind, TldpDirection, TldpKind, TldpPacket};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::events::DiscardReason;
use crate::node::{Node, TickContext, TldpSpeaker};

/// Path of an entry a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Primary,
    Backup,
}

impl Side {
    fn label(self, entry: &Entry) -> OutgoingLabel {
        match self {
            Side::Primary => entry.outgoing_label,
            Side::Backup => entry.backup_outgoing_label,
        }
    }

    fn label_mut(self, entry: &mut Entry) -> &mut OutgoingLabel {
        match self {
            Side::Primary => &mut entry.outgoing_label,
            Side::Backup => &mut entry.backup_outgoing_label,
        }
    }

    fn port(self, entry: &Entry) -> Option<PortId> {
        match self {
            Side::Primary => entry.outgoing_port,
            Side::Backup => entry.backup_outgoing_port,
        }
    }

    fn retry_mut(self, entry: &mut Entry) -> &mut RetryState {
        match self {
            Side::Primary => &mut entry.retry,
            Side::Backup => &mut entry.backup_retry,
        }
    }

    /// Whether the links of this side are accounted as backup LSPs
    fn is_backup_path(self, entry: &Entry) -> bool {
        self == Side::Backup || entry.is_for_backup_lsp
    }
}

/// A TLDP message before it is addressed
struct Signal {
    kind: TldpKind,
    direction: TldpDirection,
    session_id: u32,
    target: Ipv4Addr,
    label: Option<Label>,
    for_backup: bool,
}

impl Signal {
    fn new(kind: TldpKind, direction: TldpDirection, session_id: u32, target: Ipv4Addr) -> Self {
        Self {
            kind,
            direction,
            session_id,
            target,
            label: None,
            for_backup: false,
        }
    }

    fn with_label(mut self, label: Option<Label>) -> Self {
        self.label = label;
        self
    }

    fn for_backup(mut self, for_backup: bool) -> Self {
        self.for_backup = for_backup;
        self
    }

    /// Answer to a request or withdrawal coming from upstream
    fn reply_to(message: &TldpPacket, kind: TldpKind) -> Self {
        let direction = match kind {
            TldpKind::LabelRemovalRequestOk if message.direction != TldpDirection::Forward => TldpDirection::Forward,
            _ if message.for_backup => TldpDirection::BackwardBackup,
            _ => TldpDirection::Backward,
        };
        Self::new(kind, direction, message.session_id, message.target).for_backup(message.for_backup)
    }
}

/// Direction of messages sent upstream for `entry`
fn upstream_direction(entry: &Entry) -> TldpDirection {
    if entry.is_for_backup_lsp {
        TldpDirection::BackwardBackup
    } else {
        TldpDirection::Backward
    }
}

/// Which path a message coming back from downstream refers to
fn downstream_side(entry: &Entry, direction: TldpDirection, port: PortId) -> Option<Side> {
    if direction == TldpDirection::BackwardBackup && entry.backup_outgoing_port == Some(port) {
        Some(Side::Backup)
    } else if entry.outgoing_port == Some(port) {
        Some(Side::Primary)
    } else if entry.backup_outgoing_port == Some(port) {
        Some(Side::Backup)
    } else {
        None
    }
}

/// A path that still carries or expects traffic
fn is_alive(label: OutgoingLabel) -> bool {
    label.is_usable() || Entry::is_outstanding(label)
}

impl Node {
    /// Address a TLDP message to the neighbour on `port` and send it
    fn signal(&mut self, ctx: &TickContext<'_>, port: PortId, signal: Signal) -> Result<(), NodeError> {
        let Some(neighbor) = ctx.topology.neighbor_at(self.id, port) else {
            warn!("{}: no neighbour on port {} for {}", self.config.name, port, signal.kind);
            return Ok(());
        };

        let header = Ipv4Header::new(self.packet_ids.generate()?, self.config.address, neighbor.address);
        debug!(
            "{} -> {}: {} session {} toward {}",
            self.config.name, neighbor.name, signal.kind, signal.session_id, signal.target
        );
        let message = TldpPacket {
            header,
            kind: signal.kind,
            direction: signal.direction,
            session_id: signal.session_id,
            target: signal.target,
            label: signal.label,
            for_backup: signal.for_backup,
        };
        self.transmit(ctx, port, message.into())?;
        Ok(())
    }

    /// Build an entry routed toward `tail_end`; `None` if the tail end is unreachable
    ///
    /// The entry is not stored. Egress entries (leaving the domain) start
    /// with the outgoing label already assigned.
    pub(crate) fn new_entry(
        &self,
        topology: &Topology,
        entry_type: EntryType,
        incoming_port: PortId,
        tail_end: Ipv4Addr,
    ) -> Result<Option<Entry>, NodeError> {
        let Some(incoming) = topology.link_at(self.id, incoming_port) else {
            return Ok(None);
        };
        let Some(next_hop) = self.route(topology, tail_end) else {
            return Ok(None);
        };
        let Some((outgoing_port, outgoing)) = topology.port_towards(self.id, next_hop) else {
            return Ok(None);
        };

        let mut entry = Entry::new(
            entry_type,
            incoming_port,
            tail_end,
            self.sessions.generate_u32()?,
            self.config.tldp_retry(),
        );
        entry.outgoing_port = Some(outgoing_port);
        entry.label_stack_operation = LabelStackOperation::for_links(incoming.kind(), outgoing.kind());
        if outgoing.kind() == LinkKind::External {
            entry.outgoing_label = OutgoingLabel::Assigned;
        }
        Ok(Some(entry))
    }

    /// Store a new entry and return it with its identifier
    pub(crate) fn store_entry(&self, mut entry: Entry) -> Result<Entry, NodeError> {
        entry.id = self.matrix.insert(entry.clone())?;
        Ok(entry)
    }

    /// Ask the downstream neighbour of `side` for a label
    pub(crate) fn request_label(&mut self, ctx: &TickContext<'_>, entry: &mut Entry, side: Side) -> Result<(), NodeError> {
        let Some(port) = side.port(entry) else {
            return Ok(());
        };
        side.label_mut(entry).transition(OutgoingLabel::Requested)?;
        *side.retry_mut(entry) = self.config.tldp_retry();

        let signal = Signal::new(
            TldpKind::LabelRequest,
            TldpDirection::Forward,
            entry.local_session_id,
            entry.tail_end,
        )
        .for_backup(side.is_backup_path(entry));
        self.signal(ctx, port, signal)
    }

    /// Set up a backup path that avoids the primary next hop
    pub(crate) fn request_backup(&mut self, ctx: &TickContext<'_>, entry: &mut Entry) -> Result<(), NodeError> {
        let primary_hop = entry
            .outgoing_port
            .and_then(|port| ctx.topology.neighbor_at(self.id, port))
            .map(|n| n.address);
        let backup = primary_hop
            .and_then(|avoid| {
                ctx.topology
                    .next_hop_load_based_avoiding(self.config.address, entry.tail_end, avoid)
            })
            .and_then(|hop| ctx.topology.port_towards(self.id, hop));

        match backup {
            Some((port, link)) if link.kind() == LinkKind::Internal => {
                entry.backup_outgoing_port = Some(port);
                info!("{}: requesting backup LSP toward {} on port {}", self.config.name, entry.tail_end, port);
                self.request_label(ctx, entry, Side::Backup)
            }
            _ => {
                debug!("{}: no backup path toward {}", self.config.name, entry.tail_end);
                entry.backup_outgoing_label.transition(OutgoingLabel::Requested)?;
                entry.backup_outgoing_label.transition(OutgoingLabel::Unavailable)?;
                Ok(())
            }
        }
    }

    /// Release the LSP accounting still held by `entry`
    fn release_links(&self, topology: &Topology, entry: &Entry) {
        for side in [Side::Primary, Side::Backup] {
            let label = side.label(entry);
            let releasing = match entry.withdrawal {
                Some(Withdrawal::Downstream) => true,
                Some(Withdrawal::Upstream) => side == Side::Backup,
                None => false,
            };
            let holds = label.label().is_some() || (label == OutgoingLabel::Removing && releasing);
            if !holds {
                continue;
            }
            if let Some(link) = side.port(entry).and_then(|p| topology.link_at(self.id, p)) {
                if side.is_backup_path(entry) {
                    link.unlink_from_backup_lsp();
                } else {
                    link.unlink_from_lsp();
                }
            }
        }
    }

    fn unlink_side(&self, topology: &Topology, entry: &Entry, side: Side, port: PortId) {
        if let Some(link) = topology.link_at(self.id, port) {
            if side.is_backup_path(entry) {
                link.unlink_from_backup_lsp();
            } else {
                link.unlink_from_lsp();
            }
        }
    }

    /// Drop an entry without further signaling
    pub(crate) fn purge_entry(&self, topology: &Topology, entry: &Entry, why: &str) {
        self.release_links(topology, entry);
        if self.matrix.remove(entry.id).is_some() {
            info!("{}: purged entry {} toward {} ({})", self.config.name, entry.id, entry.tail_end, why);
        }
    }

    /// Store `entry`, or delete it once its teardown is complete
    fn settle(&self, topology: &Topology, entry: Entry) -> Result<(), NodeError> {
        if entry.teardown_complete() {
            self.release_links(topology, &entry);
            self.matrix.remove(entry.id);
            info!("{}: LSP entry {} toward {} withdrawn", self.config.name, entry.id, entry.tail_end);
            return Ok(());
        }
        self.matrix.upsert(entry)?;
        Ok(())
    }

    /// Start tearing down both paths toward the tail end
    fn withdraw_downstream(&mut self, ctx: &TickContext<'_>, entry: &mut Entry) -> Result<(), NodeError> {
        entry.withdrawal = Some(Withdrawal::Downstream);
        for side in [Side::Primary, Side::Backup] {
            self.release_side(ctx, entry, side)?;
        }
        Ok(())
    }

    /// Give back the label `side` holds from its downstream neighbour
    fn release_side(&mut self, ctx: &TickContext<'_>, entry: &mut Entry, side: Side) -> Result<(), NodeError> {
        match side.label(entry) {
            OutgoingLabel::Label(_) => {
                side.label_mut(entry).transition(OutgoingLabel::Removing)?;
                *side.retry_mut(entry) = self.config.tldp_retry();
                if let Some(port) = side.port(entry) {
                    let signal = Signal::new(
                        TldpKind::LabelRemovalRequest,
                        TldpDirection::Forward,
                        entry.local_session_id,
                        entry.tail_end,
                    )
                    .for_backup(side.is_backup_path(entry));
                    self.signal(ctx, port, signal)?;
                }
            }
            OutgoingLabel::Assigned | OutgoingLabel::Unavailable => {
                // No downstream peer holds state for this path
                let label = side.label_mut(entry);
                label.transition(OutgoingLabel::Removing)?;
                label.transition(OutgoingLabel::Withdrawn)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Tell the upstream neighbour the LSP is gone and wait for its acknowledgement
    fn withdraw_upstream(&mut self, ctx: &TickContext<'_>, entry: &mut Entry) -> Result<(), NodeError> {
        let Some(upstream_session) = entry.upstream_session_id else {
            return Ok(());
        };
        entry.withdrawal = Some(Withdrawal::Upstream);
        entry.retry = self.config.tldp_retry();
        let signal = Signal::new(
            TldpKind::LabelRemovalRequest,
            upstream_direction(entry),
            upstream_session,
            entry.tail_end,
        )
        .for_backup(entry.is_for_backup_lsp);
        self.signal(ctx, entry.incoming_port, signal)?;
        // The backup path dies with the entry
        self.release_side(ctx, entry, Side::Backup)
    }

    /// Move traffic onto the backup path
    fn switch_to_backup(&self, topology: &Topology, entry: &mut Entry) {
        if let Some(link) = entry.backup_outgoing_port.and_then(|p| topology.link_at(self.id, p)) {
            link.promote_backup_lsp();
        }
        entry.promote_backup();
        info!(
            "{}: entry {} toward {} switched to its backup path",
            self.config.name, entry.id, entry.tail_end
        );
    }

    fn on_label_request(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        let mut entry = match self.matrix.find_by_upstream_session(port, message.session_id) {
            Some(entry) => entry,
            None => {
                let Some(mut entry) = self.new_entry(ctx.topology, EntryType::Label, port, message.target)? else {
                    debug!("{}: {} unreachable, denying label", self.config.name, message.target);
                    return self.signal(ctx, port, Signal::reply_to(&message, TldpKind::LabelRequestDenied));
                };
                entry.upstream_session_id = Some(message.session_id);
                entry.is_for_backup_lsp = message.for_backup;
                if entry.outgoing_label == OutgoingLabel::Assigned {
                    entry.label_or_fec = Some(self.matrix.allocate_label()?);
                }
                self.store_entry(entry)?
            }
        };

        match entry.outgoing_label {
            OutgoingLabel::Undefined => {
                self.request_label(ctx, &mut entry, Side::Primary)?;
                self.matrix.upsert(entry)?;
            }
            OutgoingLabel::Requested => {
                debug!("{}: label toward {} already requested", self.config.name, entry.tail_end);
            }
            OutgoingLabel::Unavailable => {
                self.signal(ctx, port, Signal::reply_to(&message, TldpKind::LabelRequestDenied))?;
            }
            OutgoingLabel::Assigned | OutgoingLabel::Label(_) => {
                if entry.label_or_fec.is_none() {
                    entry.label_or_fec = Some(self.matrix.allocate_label()?);
                    self.matrix.upsert(entry.clone())?;
                }
                let reply = Signal::reply_to(&message, TldpKind::LabelRequestOk).with_label(entry.label_or_fec);
                self.signal(ctx, port, reply)?;
            }
            OutgoingLabel::Removing | OutgoingLabel::Withdrawn => {
                let direction = upstream_direction(&entry);
                let signal = Signal::new(
                    TldpKind::LabelRemovalRequest,
                    direction,
                    message.session_id,
                    message.target,
                )
                .for_backup(message.for_backup);
                self.signal(ctx, port, signal)?;
            }
        }
        Ok(())
    }

    fn on_label_ok(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        let Some(mut entry) = self.matrix.find_by_local_session(message.session_id) else {
            return self.discard(ctx, PacketKind::Tldp, DiscardReason::Unmatched);
        };
        let Some(side) = downstream_side(&entry, message.direction, port) else {
            return self.discard(ctx, PacketKind::Tldp, DiscardReason::Unmatched);
        };
        if side.label(&entry) != OutgoingLabel::Requested {
            debug!("{}: stale label confirmation for entry {}", self.config.name, entry.id);
            return Ok(());
        }
        let Some(label) = message.label else {
            warn!("{}: label confirmation without a label", self.config.name);
            return Ok(());
        };

        side.label_mut(&mut entry).transition(OutgoingLabel::Label(label))?;
        if let Some(link) = ctx.topology.link_at(self.id, port) {
            if side.is_backup_path(&entry) {
                link.link_to_backup_lsp();
            } else {
                link.link_to_lsp();
            }
        }

        // Torn down while the request was in flight
        if entry.withdrawal.is_some() {
            self.release_side(ctx, &mut entry, side)?;
            self.matrix.upsert(entry)?;
            return Ok(());
        }

        match side {
            Side::Primary => info!(
                "{}: LSP toward {} established, out label {} on port {}",
                self.config.name, entry.tail_end, label, port
            ),
            Side::Backup => info!(
                "{}: backup LSP toward {} established, out label {} on port {}",
                self.config.name, entry.tail_end, label, port
            ),
        }

        let upstream = match (side, entry.upstream_session_id) {
            (Side::Primary, Some(session)) => Some(session),
            _ => None,
        };
        let Some(upstream_session) = upstream else {
            self.matrix.upsert(entry)?;
            return Ok(());
        };

        if entry.label_or_fec.is_none() {
            entry.label_or_fec = Some(self.matrix.allocate_label()?);
        }
        let reply = Signal::new(
            TldpKind::LabelRequestOk,
            upstream_direction(&entry),
            upstream_session,
            entry.tail_end,
        )
        .with_label(entry.label_or_fec)
        .for_backup(entry.is_for_backup_lsp);
        let incoming_port = entry.incoming_port;
        self.matrix.upsert(entry)?;
        self.signal(ctx, incoming_port, reply)
    }

    fn on_label_denied(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        let Some(mut entry) = self.matrix.find_by_local_session(message.session_id) else {
            return self.discard(ctx, PacketKind::Tldp, DiscardReason::Unmatched);
        };
        let Some(side) = downstream_side(&entry, message.direction, port) else {
            return self.discard(ctx, PacketKind::Tldp, DiscardReason::Unmatched);
        };
        if side.label(&entry) != OutgoingLabel::Requested {
            return Ok(());
        }

        side.label_mut(&mut entry).transition(OutgoingLabel::Unavailable)?;
        info!("{}: label toward {} denied on port {}", self.config.name, entry.tail_end, port);

        if side == Side::Primary && entry.withdrawal.is_none() {
            if let Some(upstream_session) = entry.upstream_session_id {
                let reply = Signal::new(
                    TldpKind::LabelRequestDenied,
                    upstream_direction(&entry),
                    upstream_session,
                    entry.tail_end,
                )
                .for_backup(entry.is_for_backup_lsp);
                let incoming_port = entry.incoming_port;
                self.matrix.upsert(entry)?;
                return self.signal(ctx, incoming_port, reply);
            }
        }
        self.settle(ctx.topology, entry)
    }

    fn on_removal_from_upstream(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        let ack = Signal::reply_to(&message, TldpKind::LabelRemovalRequestOk);
        let Some(mut entry) = self.matrix.find_by_upstream_session(port, message.session_id) else {
            return self.signal(ctx, port, ack);
        };

        if entry.withdrawal.is_none() {
            self.withdraw_downstream(ctx, &mut entry)?;
        }
        self.settle(ctx.topology, entry)?;
        self.signal(ctx, port, ack)
    }

    fn on_removal_from_downstream(
        &mut self,
        ctx: &TickContext<'_>,
        port: PortId,
        message: TldpPacket,
    ) -> Result<(), NodeError> {
        self.signal(ctx, port, Signal::reply_to(&message, TldpKind::LabelRemovalRequestOk))?;

        let Some(mut entry) = self.matrix.find_by_local_session(message.session_id) else {
            return Ok(());
        };
        let Some(side) = downstream_side(&entry, message.direction, port) else {
            return Ok(());
        };

        if side == Side::Backup {
            if entry.backup_outgoing_label.label().is_some() {
                self.unlink_side(ctx.topology, &entry, side, port);
            }
            // The backup goes away at once; the entry survives only with a live primary
            if is_alive(entry.outgoing_label) {
                entry.reset_backup(self.config.tldp_retry());
                self.matrix.upsert(entry)?;
            } else {
                self.matrix.remove(entry.id);
                info!("{}: entry {} dropped with its backup path", self.config.name, entry.id);
            }
            return Ok(());
        }

        match entry.outgoing_label {
            OutgoingLabel::Requested => {
                entry.outgoing_label.transition(OutgoingLabel::Unavailable)?;
                if let (Some(upstream_session), None) = (entry.upstream_session_id, entry.withdrawal) {
                    let reply = Signal::new(
                        TldpKind::LabelRequestDenied,
                        upstream_direction(&entry),
                        upstream_session,
                        entry.tail_end,
                    )
                    .for_backup(entry.is_for_backup_lsp);
                    let incoming_port = entry.incoming_port;
                    self.matrix.upsert(entry)?;
                    return self.signal(ctx, incoming_port, reply);
                }
                self.settle(ctx.topology, entry)
            }
            OutgoingLabel::Label(_) | OutgoingLabel::Assigned | OutgoingLabel::Unavailable => {
                if entry.outgoing_label.label().is_some() {
                    self.unlink_side(ctx.topology, &entry, side, port);
                }

                let backup_up = entry
                    .backup_outgoing_port
                    .and_then(|p| ctx.topology.link_at(self.id, p))
                    .map(|link| !link.is_broken())
                    .unwrap_or(false);
                if entry.has_usable_backup() && backup_up {
                    self.switch_to_backup(ctx.topology, &mut entry);
                    self.matrix.upsert(entry)?;
                    return Ok(());
                }

                entry.outgoing_label.transition(OutgoingLabel::Removing)?;
                if entry.upstream_session_id.is_some() && entry.withdrawal.is_none() {
                    self.withdraw_upstream(ctx, &mut entry)?;
                    self.matrix.upsert(entry)?;
                    return Ok(());
                }

                // Head of the LSP: nothing upstream to tell
                entry.outgoing_label.transition(OutgoingLabel::Withdrawn)?;
                if entry.withdrawal.is_none() {
                    self.withdraw_downstream(ctx, &mut entry)?;
                }
                self.settle(ctx.topology, entry)
            }
            OutgoingLabel::Removing if entry.withdrawal == Some(Withdrawal::Downstream) => {
                // Both ends withdrew at once: take it as the acknowledgement
                entry.outgoing_label.transition(OutgoingLabel::Withdrawn)?;
                self.unlink_side(ctx.topology, &entry, side, port);
                self.settle(ctx.topology, entry)
            }
            _ => Ok(()),
        }
    }

    fn on_removal_ok(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        if message.direction == TldpDirection::Forward {
            let Some(mut entry) = self.matrix.find_by_upstream_session(port, message.session_id) else {
                return Ok(());
            };
            if entry.withdrawal == Some(Withdrawal::Upstream) && entry.outgoing_label == OutgoingLabel::Removing {
                entry.outgoing_label.transition(OutgoingLabel::Withdrawn)?;
                return self.settle(ctx.topology, entry);
            }
            return Ok(());
        }

        let Some(mut entry) = self.matrix.find_by_local_session(message.session_id) else {
            return Ok(());
        };
        let Some(side) = downstream_side(&entry, message.direction, port) else {
            return Ok(());
        };
        if side.label(&entry) != OutgoingLabel::Removing || entry.withdrawal.is_none() {
            return Ok(());
        }
        side.label_mut(&mut entry).transition(OutgoingLabel::Withdrawn)?;
        self.unlink_side(ctx.topology, &entry, side, port);
        self.settle(ctx.topology, entry)
    }

    /// Resend whatever `side` of `entry` is waiting on
    fn retransmit(&mut self, ctx: &TickContext<'_>, entry: &Entry, side: Side) -> Result<(), NodeError> {
        match side.label(entry) {
            OutgoingLabel::Requested => {
                let Some(port) = side.port(entry) else {
                    return Ok(());
                };
                let signal = Signal::new(
                    TldpKind::LabelRequest,
                    TldpDirection::Forward,
                    entry.local_session_id,
                    entry.tail_end,
                )
                .for_backup(side.is_backup_path(entry));
                self.signal(ctx, port, signal)
            }
            OutgoingLabel::Removing if side == Side::Primary && entry.withdrawal == Some(Withdrawal::Upstream) => {
                let Some(upstream_session) = entry.upstream_session_id else {
                    return Ok(());
                };
                let signal = Signal::new(
                    TldpKind::LabelRemovalRequest,
                    upstream_direction(entry),
                    upstream_session,
                    entry.tail_end,
                )
                .for_backup(entry.is_for_backup_lsp);
                self.signal(ctx, entry.incoming_port, signal)
            }
            OutgoingLabel::Removing => {
                let Some(port) = side.port(entry) else {
                    return Ok(());
                };
                let signal = Signal::new(
                    TldpKind::LabelRemovalRequest,
                    TldpDirection::Forward,
                    entry.local_session_id,
                    entry.tail_end,
                )
                .for_backup(side.is_backup_path(entry));
                self.signal(ctx, port, signal)
            }
            _ => Ok(()),
        }
    }

    fn is_link_broken(&self, topology: &Topology, port: Option<PortId>) -> bool {
        port.and_then(|p| topology.link_at(self.id, p))
            .map(|link| link.is_broken())
            .unwrap_or(true)
    }
}

impl TldpSpeaker for Node {
    fn handle_tldp(&mut self, ctx: &TickContext<'_>, port: PortId, message: TldpPacket) -> Result<(), NodeError> {
        if message.header.destination != self.config.address {
            return self.discard(ctx, PacketKind::Tldp, DiscardReason::Unmatched);
        }
        debug!(
            "{}: {} ({:?}) session {} on port {}",
            self.config.name, message.kind, message.direction, message.session_id, port
        );

        match (message.kind, message.direction) {
            (TldpKind::LabelRequest, _) => self.on_label_request(ctx, port, message),
            (TldpKind::LabelRequestOk, _) => self.on_label_ok(ctx, port, message),
            (TldpKind::LabelRequestDenied, _) => self.on_label_denied(ctx, port, message),
            (TldpKind::LabelRemovalRequest, TldpDirection::Forward) => {
                self.on_removal_from_upstream(ctx, port, message)
            }
            (TldpKind::LabelRemovalRequest, _) => self.on_removal_from_downstream(ctx, port, message),
            (TldpKind::LabelRemovalRequestOk, _) => self.on_removal_ok(ctx, port, message),
        }
    }

    fn check_connectivity(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        let topology = ctx.topology;
        for mut entry in self.matrix.snapshot() {
            let in_broken = self.is_link_broken(topology, Some(entry.incoming_port));
            let out_broken = self.is_link_broken(topology, entry.outgoing_port);
            let backup_broken =
                entry.backup_outgoing_port.is_some() && self.is_link_broken(topology, entry.backup_outgoing_port);

            match entry.withdrawal {
                Some(Withdrawal::Upstream) if in_broken => {
                    self.purge_entry(topology, &entry, "upstream link lost while withdrawing");
                    continue;
                }
                Some(Withdrawal::Downstream)
                    if (entry.outgoing_label == OutgoingLabel::Removing && out_broken)
                        || (entry.backup_outgoing_label == OutgoingLabel::Removing && backup_broken) =>
                {
                    self.purge_entry(topology, &entry, "downstream link lost while withdrawing");
                    continue;
                }
                Some(_) => continue,
                None => {}
            }

            if in_broken && out_broken {
                self.purge_entry(topology, &entry, "both links down");
                continue;
            }

            if out_broken {
                if entry.has_usable_backup() && !backup_broken {
                    self.switch_to_backup(topology, &mut entry);
                    self.matrix.upsert(entry)?;
                    continue;
                }
                if entry.upstream_session_id.is_none() {
                    self.purge_entry(topology, &entry, "outgoing link down");
                    continue;
                }

                match entry.outgoing_label {
                    OutgoingLabel::Requested => {
                        entry.outgoing_label.transition(OutgoingLabel::Unavailable)?;
                        entry.outgoing_label.transition(OutgoingLabel::Removing)?;
                    }
                    OutgoingLabel::Label(_) => {
                        if let Some(port) = entry.outgoing_port {
                            self.unlink_side(topology, &entry, Side::Primary, port);
                        }
                        entry.outgoing_label.transition(OutgoingLabel::Removing)?;
                    }
                    OutgoingLabel::Assigned | OutgoingLabel::Unavailable => {
                        entry.outgoing_label.transition(OutgoingLabel::Removing)?;
                    }
                    _ => {
                        self.purge_entry(topology, &entry, "outgoing link down");
                        continue;
                    }
                }
                info!(
                    "{}: outgoing link of entry {} toward {} is down, withdrawing upstream",
                    self.config.name, entry.id, entry.tail_end
                );
                self.withdraw_upstream(ctx, &mut entry)?;
                self.matrix.upsert(entry)?;
                continue;
            }

            if in_broken {
                info!(
                    "{}: incoming link of entry {} toward {} is down, withdrawing downstream",
                    self.config.name, entry.id, entry.tail_end
                );
                self.withdraw_downstream(ctx, &mut entry)?;
                self.settle(topology, entry)?;
                continue;
            }

            if backup_broken && entry.backup_outgoing_label != OutgoingLabel::Undefined {
                debug!("{}: backup link of entry {} is down", self.config.name, entry.id);
                entry.reset_backup(self.config.tldp_retry());
                self.matrix.upsert(entry)?;
            }
        }
        Ok(())
    }

    fn retry_tldp(&mut self, ctx: &TickContext<'_>) -> Result<(), NodeError> {
        let elapsed = ctx.tick.duration_ns;
        for mut entry in self.matrix.snapshot() {
            let mut changed = false;
            let mut exhausted = false;

            for side in [Side::Primary, Side::Backup] {
                if !Entry::is_outstanding(side.label(&entry)) {
                    continue;
                }
                changed = true;
                let retry = side.retry_mut(&mut entry);
                if !retry.advance(elapsed) {
                    continue;
                }
                if !retry.take_attempt() {
                    exhausted = true;
                    break;
                }
                debug!("{}: retransmitting for entry {} ({:?})", self.config.name, entry.id, side);
                self.retransmit(ctx, &entry, side)?;
            }

            if exhausted {
                warn!(
                    "{}: TLDP retries exhausted for entry {} toward {}",
                    self.config.name, entry.id, entry.tail_end
                );
                self.purge_entry(ctx.topology, &entry, "retries exhausted");
            } else if changed {
                self.matrix.upsert(entry)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, RecordingSink};
    use crate::node::SimulatedNode;
    use crate::testing::{line, tick};
    use mplsim_wire::Packet;

    fn request(from: Ipv4Addr, to: Ipv4Addr, session: u32, target: Ipv4Addr) -> TldpPacket {
        TldpPacket {
            header: Ipv4Header::new(1, from, to),
            kind: TldpKind::LabelRequest,
            direction: TldpDirection::Forward,
            session_id: session,
            target,
            label: None,
            for_backup: false,
        }
    }

    fn sent_tldp(sink: &RecordingSink, node: mplsim_topology::NodeId) -> usize {
        sink.count(|e| {
            e.node == node
                && matches!(
                    e.kind,
                    EventKind::PacketSent {
                        packet: PacketKind::Tldp,
                        ..
                    }
                )
        })
    }

    #[test]
    fn test_egress_answers_with_local_label() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);

        // ler-b receives a request from lsr on its port 0
        let message = request(line.lsr_addr, line.egress_addr, 77, line.receiver_addr);
        line.egress.handle_tldp(&ctx, 0, message).unwrap();

        let entries = line.egress.matrix().snapshot();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.outgoing_label, OutgoingLabel::Assigned);
        assert_eq!(entry.label_stack_operation, LabelStackOperation::Pop);
        assert_eq!(entry.label_or_fec, Some(mplsim_wire::FIRST_UNRESERVED_LABEL));
        assert_eq!(entry.upstream_session_id, Some(77));

        // The OK is on its way back to the lsr
        let link = line.topology.link_by_name("lsr-ler-b").unwrap();
        assert_eq!(link.packets_in_transit(), 1);
        let delivered = link.tick(u64::MAX);
        match &delivered[0].packet {
            Packet::Tldp(reply) => {
                assert_eq!(reply.kind, TldpKind::LabelRequestOk);
                assert_eq!(reply.direction, TldpDirection::Backward);
                assert_eq!(reply.session_id, 77);
                assert_eq!(reply.label, Some(mplsim_wire::FIRST_UNRESERVED_LABEL));
            }
            other => panic!("unexpected {:?}", other),
        }

        // A retransmitted request is answered from the existing entry
        let again = request(line.lsr_addr, line.egress_addr, 77, line.receiver_addr);
        line.egress.handle_tldp(&ctx, 0, again).unwrap();
        assert_eq!(line.egress.matrix().len(), 1);
        assert_eq!(sent_tldp(&sink, line.egress.id()), 2);
    }

    #[test]
    fn test_unreachable_target_is_denied() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);

        let message = request(line.ingress_addr, line.lsr_addr, 5, Ipv4Addr::new(192, 168, 1, 1));
        line.lsr.handle_tldp(&ctx, 0, message).unwrap();
        assert!(line.lsr.matrix().is_empty());

        let link = line.topology.link_by_name("ler-a-lsr").unwrap();
        let delivered = link.tick(u64::MAX);
        match &delivered[0].packet {
            Packet::Tldp(reply) => assert_eq!(reply.kind, TldpKind::LabelRequestDenied),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transit_request_then_confirmation() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);

        let message = request(line.ingress_addr, line.lsr_addr, 9, line.receiver_addr);
        line.lsr.handle_tldp(&ctx, 0, message).unwrap();
        let entry = line.lsr.matrix().snapshot().remove(0);
        assert_eq!(entry.outgoing_label, OutgoingLabel::Requested);
        assert_eq!(entry.label_stack_operation, LabelStackOperation::Swap);
        assert_eq!(entry.label_or_fec, None);

        let ok = TldpPacket {
            header: Ipv4Header::new(2, line.egress_addr, line.lsr_addr),
            kind: TldpKind::LabelRequestOk,
            direction: TldpDirection::Backward,
            session_id: entry.local_session_id,
            target: line.receiver_addr,
            label: Some(40),
            for_backup: false,
        };
        line.lsr.handle_tldp(&ctx, 1, ok).unwrap();

        let entry = line.lsr.matrix().get(entry.id).unwrap();
        assert_eq!(entry.outgoing_label, OutgoingLabel::Label(40));
        assert!(entry.label_or_fec.is_some());
        assert_eq!(line.topology.link_by_name("lsr-ler-b").unwrap().lsps(), 1);
    }

    fn with_backup(line: &crate::testing::Line, primary: OutgoingLabel) -> Entry {
        let mut entry = line
            .lsr
            .new_entry(&line.topology, EntryType::Label, 0, line.receiver_addr)
            .unwrap()
            .unwrap();
        entry.label_or_fec = Some(30);
        entry.outgoing_label = primary;
        entry.backup_outgoing_port = Some(1);
        entry.backup_outgoing_label = OutgoingLabel::Label(50);
        line.topology.link_by_name("lsr-ler-b").unwrap().link_to_backup_lsp();
        line.lsr.store_entry(entry).unwrap()
    }

    fn backup_removal(line: &crate::testing::Line, entry: &Entry) -> TldpPacket {
        TldpPacket {
            kind: TldpKind::LabelRemovalRequest,
            direction: TldpDirection::BackwardBackup,
            ..request(line.egress_addr, line.lsr_addr, entry.local_session_id, line.receiver_addr)
        }
    }

    #[test]
    fn test_backup_withdrawal_keeps_live_primary() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);
        let entry = with_backup(&line, OutgoingLabel::Label(40));

        let message = backup_removal(&line, &entry);
        line.lsr.handle_tldp(&ctx, 1, message).unwrap();

        let entry = line.lsr.matrix().get(entry.id).unwrap();
        assert_eq!(entry.outgoing_label, OutgoingLabel::Label(40));
        assert_eq!(entry.backup_outgoing_label, OutgoingLabel::Undefined);
        assert_eq!(entry.backup_outgoing_port, None);
        assert_eq!(line.topology.link_by_name("lsr-ler-b").unwrap().backup_lsps(), 0);
    }

    #[test]
    fn test_backup_withdrawal_never_orphans_entry() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);
        let entry = with_backup(&line, OutgoingLabel::Unavailable);

        let message = backup_removal(&line, &entry);
        line.lsr.handle_tldp(&ctx, 1, message).unwrap();

        assert!(line.lsr.matrix().is_empty());
        assert_eq!(line.topology.link_by_name("lsr-ler-b").unwrap().backup_lsps(), 0);
    }

    #[test]
    fn test_late_backup_label_released_after_upstream_withdrawal() {
        let mut line = line();
        let sink = RecordingSink::new();
        let ctx = tick(&line.topology, &sink, 1);
        let mut entry = with_backup(&line, OutgoingLabel::Label(40));
        entry.upstream_session_id = Some(21);
        entry.backup_outgoing_label = OutgoingLabel::Requested;
        line.lsr.matrix().upsert(entry.clone()).unwrap();
        let link = line.topology.link_by_name("lsr-ler-b").unwrap();
        link.unlink_from_backup_lsp();
        link.link_to_lsp();

        // ler-b withdraws the primary path while the backup is still pending
        let removal = TldpPacket {
            kind: TldpKind::LabelRemovalRequest,
            direction: TldpDirection::Backward,
            ..request(line.egress_addr, line.lsr_addr, entry.local_session_id, line.receiver_addr)
        };
        line.lsr.handle_tldp(&ctx, 1, removal).unwrap();
        let entry = line.lsr.matrix().get(entry.id).unwrap();
        assert_eq!(entry.withdrawal, Some(Withdrawal::Upstream));

        // ler-a acknowledges; the pending backup keeps the entry
        let ack = TldpPacket {
            kind: TldpKind::LabelRemovalRequestOk,
            ..request(line.ingress_addr, line.lsr_addr, 21, line.receiver_addr)
        };
        line.lsr.handle_tldp(&ctx, 0, ack).unwrap();
        let entry = line.lsr.matrix().get(entry.id).unwrap();
        assert_eq!(entry.outgoing_label, OutgoingLabel::Withdrawn);
        assert_eq!(entry.backup_outgoing_label, OutgoingLabel::Requested);

        // The backup label arrives late and is handed straight back
        let sent = sent_tldp(&sink, line.lsr.id());
        let ok = TldpPacket {
            kind: TldpKind::LabelRequestOk,
            direction: TldpDirection::BackwardBackup,
            label: Some(50),
            ..request(line.egress_addr, line.lsr_addr, entry.local_session_id, line.receiver_addr)
        };
        line.lsr.handle_tldp(&ctx, 1, ok).unwrap();
        let entry = line.lsr.matrix().get(entry.id).unwrap();
        assert_eq!(entry.backup_outgoing_label, OutgoingLabel::Removing);
        assert_eq!(sent_tldp(&sink, line.lsr.id()), sent + 1);

        let backup_ack = TldpPacket {
            kind: TldpKind::LabelRemovalRequestOk,
            direction: TldpDirection::BackwardBackup,
            ..request(line.egress_addr, line.lsr_addr, entry.local_session_id, line.receiver_addr)
        };
        line.lsr.handle_tldp(&ctx, 1, backup_ack).unwrap();
        assert!(line.lsr.matrix().is_empty());
        assert_eq!(link.backup_lsps(), 0);
        assert_eq!(link.lsps(), 0);
    }

    #[test]
    fn test_retry_bound() {
        let mut line = line();
        let sink = RecordingSink::new();

        let message = request(line.ingress_addr, line.lsr_addr, 9, line.receiver_addr);
        line.lsr
            .handle_tldp(&tick(&line.topology, &sink, 1), 0, message)
            .unwrap();
        let attempts = line.lsr.config().tldp_attempts as usize;
        let timeout = line.lsr.config().tldp_timeout_ns;

        // Nobody answers: one request plus one per attempt, then the entry goes
        for _ in 0..=attempts {
            line.lsr.retry_tldp(&tick(&line.topology, &sink, timeout)).unwrap();
        }

        let requests = sink.count(|e| {
            e.node == line.lsr.id()
                && matches!(
                    e.kind,
                    EventKind::PacketSent {
                        packet: PacketKind::Tldp,
                        port: 1
                    }
                )
        });
        assert_eq!(requests, 1 + attempts);
        assert!(line.lsr.matrix().is_empty());
    }
}
