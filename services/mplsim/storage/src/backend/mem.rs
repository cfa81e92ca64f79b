//! In-memory FIFO frame cache

use crate::{CacheError, FrameCache, FrameKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Default)]
struct Order {
    /// Insertion order, oldest first
    keys: VecDeque<FrameKey>,
    used_bytes: u64,
}

/// In-memory cache bounded in kilobytes, oldest frame evicted first
#[derive(Debug)]
pub struct MemoryFrameCache<F> {
    frames: DashMap<FrameKey, (F, u64)>,
    order: Mutex<Order>,
    capacity_bytes: u64,
}

impl<F> MemoryFrameCache<F> {
    /// Create a cache of `capacity_kb` kilobytes
    pub fn with_capacity_kb(capacity_kb: u64) -> Result<Self, CacheError> {
        if capacity_kb == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            frames: DashMap::new(),
            order: Mutex::new(Order::default()),
            capacity_bytes: capacity_kb * 1024,
        })
    }
}

impl<F> FrameCache<F> for MemoryFrameCache<F>
where
    F: Clone + Send + Sync,
{
    fn insert(&self, key: FrameKey, frame: F, size_bytes: u64) -> Result<Vec<FrameKey>, CacheError> {
        if size_bytes > self.capacity_bytes {
            return Err(CacheError::TooLarge {
                size: size_bytes,
                capacity: self.capacity_bytes,
            });
        }

        let mut order = self.order.lock();

        // Re-caching a frame refreshes its position
        if let Some((_, (_, old_size))) = self.frames.remove(&key) {
            order.keys.retain(|k| *k != key);
            order.used_bytes -= old_size;
        }

        let mut evicted = Vec::new();
        while order.used_bytes + size_bytes > self.capacity_bytes {
            let Some(oldest) = order.keys.pop_front() else {
                break;
            };
            if let Some((_, (_, size))) = self.frames.remove(&oldest) {
                order.used_bytes -= size;
            }
            evicted.push(oldest);
        }

        order.keys.push_back(key);
        order.used_bytes += size_bytes;
        self.frames.insert(key, (frame, size_bytes));

        if !evicted.is_empty() {
            debug!("Frame cache evicted {} frames to store {}", evicted.len(), key);
        }
        Ok(evicted)
    }

    fn get(&self, key: &FrameKey) -> Option<F> {
        self.frames.get(key).map(|entry| entry.value().0.clone())
    }

    fn contains(&self, key: &FrameKey) -> bool {
        self.frames.contains_key(key)
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn used_bytes(&self) -> u64 {
        self.order.lock().used_bytes
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }
}
