//! Topology and configuration error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::link::LinkId;
use crate::node::NodeId;

/// Configuration validation codes
///
/// A node or link failing validation keeps its previous, well-configured
/// state; callers display the code and ask for a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigCode {
    /// Name is empty
    EmptyName,
    /// Name only contains whitespace
    BlankName,
    /// Another node or link already uses the name
    DuplicateName,
    /// Another node already uses the address
    DuplicateAddress,
    /// Referenced node does not exist
    UnknownNode,
    /// Port index beyond the node's port count
    PortOutOfRange,
    /// Port already attached to another link
    PortInUse,
    /// Link joins nodes that cannot be joined by this kind of link
    InvalidLinkEnds,
    /// Both ends of the link are the same node
    SelfLoop,
    /// Link delay must be positive
    ZeroDelay,
    /// Switching power must be positive
    ZeroRoutingPower,
    /// Port buffer must be positive
    ZeroBufferSize,
    /// Active roles need a frame cache
    ZeroCacheSize,
    /// The role does not fit this kind of node
    WrongRole,
}

impl fmt::Display for ConfigCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigCode::EmptyName => write!(f, "name is empty"),
            ConfigCode::BlankName => write!(f, "name is blank"),
            ConfigCode::DuplicateName => write!(f, "name already in use"),
            ConfigCode::DuplicateAddress => write!(f, "address already in use"),
            ConfigCode::UnknownNode => write!(f, "unknown node"),
            ConfigCode::PortOutOfRange => write!(f, "port out of range"),
            ConfigCode::PortInUse => write!(f, "port already in use"),
            ConfigCode::InvalidLinkEnds => write!(f, "link kind does not match its end nodes"),
            ConfigCode::SelfLoop => write!(f, "link joins a node to itself"),
            ConfigCode::ZeroDelay => write!(f, "link delay must be positive"),
            ConfigCode::ZeroRoutingPower => write!(f, "switching power must be positive"),
            ConfigCode::ZeroBufferSize => write!(f, "buffer size must be positive"),
            ConfigCode::ZeroCacheSize => write!(f, "frame cache size must be positive"),
            ConfigCode::WrongRole => write!(f, "role does not fit this node"),
        }
    }
}

/// Topology errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Validation failed
    #[error("invalid configuration for '{subject}': {code}")]
    Config {
        /// Name of the node or link being configured
        subject: String,
        /// Validation code
        code: ConfigCode,
    },

    /// Node not found
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Link not found
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
}

impl TopologyError {
    /// Validation code, if this is a validation failure
    pub fn code(&self) -> Option<ConfigCode> {
        match self {
            TopologyError::Config { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Check a node or link name: non-empty, non-blank, not already taken
pub fn validate_name<'a, I>(name: &str, existing: I) -> Result<(), ConfigCode>
where
    I: IntoIterator<Item = &'a str>,
{
    if name.is_empty() {
        return Err(ConfigCode::EmptyName);
    }
    if name.trim().is_empty() {
        return Err(ConfigCode::BlankName);
    }
    if existing.into_iter().any(|other| other == name) {
        return Err(ConfigCode::DuplicateName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        let taken = ["ler-1", "lsr-1"];
        assert_eq!(validate_name("", taken), Err(ConfigCode::EmptyName));
        assert_eq!(validate_name("   ", taken), Err(ConfigCode::BlankName));
        assert_eq!(validate_name("lsr-1", taken), Err(ConfigCode::DuplicateName));
        assert_eq!(validate_name("ler-2", taken), Ok(()));
    }

    #[test]
    fn test_error_code() {
        let err = TopologyError::Config {
            subject: "x".to_string(),
            code: ConfigCode::PortInUse,
        };
        assert_eq!(err.code(), Some(ConfigCode::PortInUse));
        assert_eq!(err.to_string(), "invalid configuration for 'x': port already in use");
        assert_eq!(TopologyError::UnknownNode(NodeId(3)).code(), None);
    }
}
