//! Multi-block reassembly.
//!
//! [`BlockContainer`] buckets incoming blocks by system id and hands back the
//! finished [`Message`] once its last block arrives. Partial messages whose peer
//! went quiet are evicted by [`BlockContainer::evict_idle`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{Block, Header, Message};

struct Bucket<B: Block> {
    message: Message<B>,
    last_block_at: Instant,
}

/// Reassembles blocks sharing a system id.
pub struct BlockContainer<B: Block> {
    buckets: HashMap<u32, Bucket<B>>,
}

impl<B: Block> BlockContainer<B> {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    /// Add a block; returns the message when this block completes it.
    pub fn add(&mut self, block: B) -> Option<Message<B>> {
        let system = block.header().system();
        let now = Instant::now();

        let bucket = self.buckets.entry(system).or_insert_with(|| Bucket {
            message: Message::new(),
            last_block_at: now,
        });
        bucket.last_block_at = now;

        if let Err(e) = bucket.message.append(block) {
            tracing::warn!("Discarding partial message for system {}: {}", system, e);
            self.buckets.remove(&system);
            return None;
        }

        if bucket.message.is_complete() {
            return self.buckets.remove(&system).map(|b| b.message);
        }
        None
    }

    /// Drop partial messages that received no block within `max_idle`.
    ///
    /// Returns the evicted system ids.
    pub fn evict_idle(&mut self, max_idle: Duration) -> Vec<u32> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| now.duration_since(bucket.last_block_at) > max_idle)
            .map(|(&system, _)| system)
            .collect();

        for system in &expired {
            self.buckets.remove(system);
        }
        expired
    }

    /// Number of messages being reassembled.
    pub fn pending(&self) -> usize {
        self.buckets.len()
    }

    /// Discard every partial message.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl<B: Block> Default for BlockContainer<B> {
    fn default() -> Self {
        Self::new()
    }
}
