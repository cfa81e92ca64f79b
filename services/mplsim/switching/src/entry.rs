//! Switching matrix entries.

use mplsim_topology::{LinkKind, PortId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::label::OutgoingLabel;

/// Identifier of an entry within one matrix
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What `label_or_fec` holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// FEC hash of an unlabelled IPv4 flow
    Fec,
    /// Incoming MPLS label
    Label,
}

/// Operation applied to the label stack when switching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelStackOperation {
    /// Not decided
    Undefined,
    /// Add a label
    Push,
    /// Remove the top label
    Pop,
    /// Replace the top label
    Swap,
    /// Forward unchanged
    Noop,
}

impl LabelStackOperation {
    /// Operation implied by the kinds of the incoming and outgoing links
    pub fn for_links(incoming: LinkKind, outgoing: LinkKind) -> Self {
        match (incoming, outgoing) {
            (LinkKind::External, LinkKind::External) => LabelStackOperation::Noop,
            (LinkKind::External, LinkKind::Internal) => LabelStackOperation::Push,
            (LinkKind::Internal, LinkKind::External) => LabelStackOperation::Pop,
            (LinkKind::Internal, LinkKind::Internal) => LabelStackOperation::Swap,
        }
    }
}

impl fmt::Display for LabelStackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabelStackOperation::Undefined => "undefined",
            LabelStackOperation::Push => "push",
            LabelStackOperation::Pop => "pop",
            LabelStackOperation::Swap => "swap",
            LabelStackOperation::Noop => "noop",
        };
        write!(f, "{}", name)
    }
}

/// Direction a withdrawal was sent in, and so where its acknowledgement comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Withdrawal {
    /// Toward the tail end, over the outgoing port(s)
    Downstream,
    /// Toward the head end, over the incoming port
    Upstream,
}

/// Uniqueness key of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    /// Arrival port
    pub incoming_port: PortId,
    /// FEC hash or incoming label
    pub label_or_fec: u32,
    /// Interpretation of `label_or_fec`
    pub entry_type: EntryType,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} {:?} {}", self.incoming_port, self.entry_type, self.label_or_fec)
    }
}

/// Retransmission timer with a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Time left before the next retransmission
    pub timeout_ns: u64,
    /// Retransmissions still allowed
    pub attempts_left: u32,
    initial_timeout_ns: u64,
}

impl RetryState {
    /// Fresh timer
    pub fn new(timeout_ns: u64, attempts: u32) -> Self {
        Self {
            timeout_ns,
            attempts_left: attempts,
            initial_timeout_ns: timeout_ns,
        }
    }

    /// Rearm the timeout without consuming an attempt
    pub fn reset_timeout(&mut self) {
        self.timeout_ns = self.initial_timeout_ns;
    }

    /// Let `duration_ns` elapse; true once the timeout has run out
    pub fn advance(&mut self, duration_ns: u64) -> bool {
        self.timeout_ns = self.timeout_ns.saturating_sub(duration_ns);
        self.timeout_ns == 0
    }

    /// Consume one attempt and rearm; false if none was left
    pub fn take_attempt(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        self.reset_timeout();
        true
    }

    /// No attempts left
    pub fn is_exhausted(&self) -> bool {
        self.attempts_left == 0
    }
}

/// One flow crossing one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Identifier, set by the matrix on insertion
    pub id: EntryId,
    /// FEC or label entry
    pub entry_type: EntryType,
    /// Arrival port
    pub incoming_port: PortId,
    /// FEC hash or incoming label; a label entry has none until one is allocated
    pub label_or_fec: Option<u32>,
    /// Departure port of the primary path
    pub outgoing_port: Option<PortId>,
    /// Departure port of the backup path
    pub backup_outgoing_port: Option<PortId>,
    /// Primary label state
    pub outgoing_label: OutgoingLabel,
    /// Backup label state
    pub backup_outgoing_label: OutgoingLabel,
    /// Stack operation
    pub label_stack_operation: LabelStackOperation,
    /// Session of the upstream neighbour that asked for this entry
    pub upstream_session_id: Option<u32>,
    /// Session used toward the downstream neighbour(s)
    pub local_session_id: u32,
    /// Final destination of the flow
    pub tail_end: Ipv4Addr,
    /// Primary side retransmission timer
    pub retry: RetryState,
    /// Backup side retransmission timer
    pub backup_retry: RetryState,
    /// Created on behalf of a backup LSP request
    pub is_for_backup_lsp: bool,
    /// Teardown in progress
    pub withdrawal: Option<Withdrawal>,
}

impl Entry {
    /// New entry with both label sides undefined
    pub fn new(
        entry_type: EntryType,
        incoming_port: PortId,
        tail_end: Ipv4Addr,
        local_session_id: u32,
        retry: RetryState,
    ) -> Self {
        Self {
            id: EntryId(0),
            entry_type,
            incoming_port,
            label_or_fec: None,
            outgoing_port: None,
            backup_outgoing_port: None,
            outgoing_label: OutgoingLabel::Undefined,
            backup_outgoing_label: OutgoingLabel::Undefined,
            label_stack_operation: LabelStackOperation::Undefined,
            upstream_session_id: None,
            local_session_id,
            tail_end,
            retry,
            backup_retry: retry,
            is_for_backup_lsp: false,
            withdrawal: None,
        }
    }

    /// Uniqueness key, once `label_or_fec` is known
    pub fn key(&self) -> Option<EntryKey> {
        self.label_or_fec.map(|label_or_fec| EntryKey {
            incoming_port: self.incoming_port,
            label_or_fec,
            entry_type: self.entry_type,
        })
    }

    /// Whether a backup path is up
    pub fn has_usable_backup(&self) -> bool {
        self.backup_outgoing_port.is_some() && self.backup_outgoing_label.is_usable()
    }

    /// Switch traffic onto the backup path
    ///
    /// The backup fields become the primary ones and the backup side starts
    /// over from undefined. This is a reassignment of both fields, not a move
    /// of the label state machine.
    pub fn promote_backup(&mut self) {
        self.outgoing_port = self.backup_outgoing_port.take();
        self.outgoing_label = std::mem::take(&mut self.backup_outgoing_label);
        self.retry = self.backup_retry;
        self.backup_retry.reset_timeout();
    }

    /// Forget the backup path so it can be requested again
    pub fn reset_backup(&mut self, retry: RetryState) {
        self.backup_outgoing_port = None;
        self.backup_outgoing_label = OutgoingLabel::Undefined;
        self.backup_retry = retry;
    }

    /// A side is waiting for an answer
    pub fn is_outstanding(label: OutgoingLabel) -> bool {
        matches!(label, OutgoingLabel::Requested | OutgoingLabel::Removing)
    }

    /// Teardown started and neither side waits for an acknowledgement
    pub fn teardown_complete(&self) -> bool {
        self.withdrawal.is_some()
            && !Self::is_outstanding(self.outgoing_label)
            && !Self::is_outstanding(self.backup_outgoing_label)
    }
}
