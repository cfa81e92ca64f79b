//! Recent-frame storage for mplsim active nodes.
//!
//! Active routers keep the GoS frames they forwarded most recently in a
//! bounded cache, the DMGP, so that a downstream active node losing one of
//! them can ask for a local retransmission instead of an end-to-end one.
//! Frames are keyed by `(flow id, packet id)` and the oldest frames are
//! evicted first once the configured size in kilobytes is reached.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cache key of a frame
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameKey {
    /// Flow the frame belongs to
    pub flow_id: u32,
    /// Packet identifier within the flow
    pub packet_id: u64,
}

impl FrameKey {
    /// Create a key
    pub fn new(flow_id: u32, packet_id: u64) -> Self {
        Self { flow_id, packet_id }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.packet_id)
    }
}

/// Cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The frame alone exceeds the cache capacity
    #[error("frame of {size} bytes does not fit in a {capacity} byte cache")]
    TooLarge {
        /// Frame size in bytes
        size: u64,
        /// Cache capacity in bytes
        capacity: u64,
    },
    /// The cache was configured without capacity
    #[error("cache capacity must be positive")]
    ZeroCapacity,
}

/// Bounded store of recently forwarded frames
pub trait FrameCache<F>: Send + Sync {
    /// Store a frame, evicting the oldest ones until it fits
    ///
    /// Returns the keys evicted to make room.
    fn insert(&self, key: FrameKey, frame: F, size_bytes: u64) -> Result<Vec<FrameKey>, CacheError>;

    /// Copy of a cached frame
    fn get(&self, key: &FrameKey) -> Option<F>;

    /// Whether a frame is cached
    fn contains(&self, key: &FrameKey) -> bool;

    /// Number of cached frames
    fn len(&self) -> usize;

    /// Whether nothing is cached
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently used
    fn used_bytes(&self) -> u64;

    /// Capacity in bytes
    fn capacity_bytes(&self) -> u64;
}

pub use backend::mem::MemoryFrameCache;
