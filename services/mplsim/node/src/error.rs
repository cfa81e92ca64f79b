//! Node errors.

use mplsim_storage::CacheError;
use mplsim_switching::SwitchingError;
use mplsim_topology::{ConfigCode, NodeId, TopologyError};
use mplsim_wire::WireError;
use thiserror::Error;

/// Errors surfaced to the caller of a node tick
///
/// Protocol-level trouble (unreachable destinations, unavailable labels,
/// broken links) is handled inside the tick and reported as events. What
/// reaches the caller is exhaustion of a finite resource or a broken
/// invariant of the node's own state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// An identifier or label space is used up
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Invalid node configuration
    #[error("invalid node configuration: {0}")]
    Config(ConfigCode),

    /// Topology error
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Switching matrix error
    #[error("switching error: {0}")]
    Switching(SwitchingError),

    /// Frame cache error
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Packet model error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The simulation clock cannot advance
    #[error("tick duration must be positive")]
    ZeroTick,

    /// Node already driven by the simulation
    #[error("node {0} added twice")]
    DuplicateNode(NodeId),

    /// A node task stopped unexpectedly
    #[error("node task failed: {0}")]
    TaskFailed(String),
}

impl From<SwitchingError> for NodeError {
    fn from(err: SwitchingError) -> Self {
        match err {
            SwitchingError::LabelSpaceExhausted => NodeError::ResourceExhausted("labels"),
            other => NodeError::Switching(other),
        }
    }
}
