//! Switching matrix errors.

use thiserror::Error;

use crate::entry::{EntryId, EntryKey};
use crate::label::OutgoingLabel;

/// Switching matrix errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchingError {
    /// Another entry already owns the key
    #[error("duplicate switching entry for {0}")]
    DuplicateKey(EntryKey),

    /// The label space of the node is used up
    #[error("label space exhausted")]
    LabelSpaceExhausted,

    /// No entry with this identifier
    #[error("unknown switching entry {0}")]
    UnknownEntry(EntryId),

    /// The label state machine does not allow this move
    #[error("illegal label transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: OutgoingLabel,
        /// Requested state
        to: OutgoingLabel,
    },
}
