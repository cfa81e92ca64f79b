//! Finite identifier generators.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NodeError;

/// Monotonic identifier generator over `1..=limit`
///
/// Generators never wrap: running out is a [`NodeError::ResourceExhausted`].
#[derive(Debug)]
pub struct IdGenerator {
    name: &'static str,
    next: AtomicU64,
    limit: u64,
}

impl IdGenerator {
    /// Generator over the whole `u64` range
    pub fn new(name: &'static str) -> Self {
        Self::with_limit(name, u64::MAX)
    }

    /// Generator over the `u32` range
    pub fn new_u32(name: &'static str) -> Self {
        Self::with_limit(name, u32::MAX as u64)
    }

    /// Generator handing out at most `limit` identifiers
    pub fn with_limit(name: &'static str, limit: u64) -> Self {
        Self {
            name,
            next: AtomicU64::new(1),
            limit,
        }
    }

    /// Next identifier
    pub fn generate(&self) -> Result<u64, NodeError> {
        let limit = self.limit;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= limit).then(|| next.saturating_add(1))
            })
            .map_err(|_| NodeError::ResourceExhausted(self.name))
    }

    /// Next identifier as `u32`
    pub fn generate_u32(&self) -> Result<u32, NodeError> {
        let id = self.generate()?;
        u32::try_from(id).map_err(|_| NodeError::ResourceExhausted(self.name))
    }
}
