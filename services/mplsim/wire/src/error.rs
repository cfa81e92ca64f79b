//! Packet model error types.

use thiserror::Error;

/// Packet model errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Operation needs a label but the stack is empty
    #[error("empty label stack")]
    EmptyLabelStack,

    /// Label value outside the 20-bit label space
    #[error("label out of range: {0}")]
    LabelRange(u32),

    /// EXP value wider than three bits
    #[error("exp out of range: {0}")]
    Exp(u8),

    /// TTL already zero, packet cannot be forwarded
    #[error("ttl expired")]
    TtlExpired,
}
