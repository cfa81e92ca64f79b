//! Outgoing label life cycle.

use mplsim_wire::Label;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SwitchingError;

/// State of an outgoing (primary or backup) label
///
/// ```text
/// Undefined -> Requested -> Label(x) | Assigned | Unavailable -> Removing -> Withdrawn
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutgoingLabel {
    /// Nothing asked yet
    #[default]
    Undefined,
    /// Label request sent downstream, waiting for the answer
    Requested,
    /// No label needed (egress side)
    Assigned,
    /// Label granted by the downstream neighbour
    Label(Label),
    /// Downstream refused
    Unavailable,
    /// Withdrawal in progress
    Removing,
    /// Withdrawal acknowledged
    Withdrawn,
}

impl OutgoingLabel {
    /// Whether traffic can be sent with this label
    pub fn is_usable(&self) -> bool {
        matches!(self, OutgoingLabel::Assigned | OutgoingLabel::Label(_))
    }

    /// Concrete label, if one was granted
    pub fn label(&self) -> Option<Label> {
        match self {
            OutgoingLabel::Label(label) => Some(*label),
            _ => None,
        }
    }

    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(&self, next: OutgoingLabel) -> bool {
        use OutgoingLabel::*;
        matches!(
            (self, next),
            (Undefined, Requested)
                | (Requested, Assigned)
                | (Requested, Label(_))
                | (Requested, Unavailable)
                | (Assigned, Removing)
                | (Label(_), Removing)
                | (Unavailable, Removing)
                | (Removing, Withdrawn)
        )
    }

    /// Move to `next`, rejecting illegal edges
    pub fn transition(&mut self, next: OutgoingLabel) -> Result<(), SwitchingError> {
        if !self.can_transition_to(next) {
            return Err(SwitchingError::IllegalTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for OutgoingLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingLabel::Undefined => write!(f, "undefined"),
            OutgoingLabel::Requested => write!(f, "requested"),
            OutgoingLabel::Assigned => write!(f, "assigned"),
            OutgoingLabel::Label(label) => write!(f, "{}", label),
            OutgoingLabel::Unavailable => write!(f, "unavailable"),
            OutgoingLabel::Removing => write!(f, "removing"),
            OutgoingLabel::Withdrawn => write!(f, "withdrawn"),
        }
    }
}
