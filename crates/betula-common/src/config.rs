//! Configuration structures for Betula.

use serde::{Deserialize, Serialize};

/// Default maximum node size, measured in messages.
pub const DEFAULT_MAX_NODE_SIZE: u64 = 1 << 18;

/// Tuning parameters for the buffered tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum node size, in messages. A node whose pivot count plus
    /// buffered-message count reaches this bound is flushed or split.
    pub max_node_size: u64,
    /// Minimum batch size worth flushing to an out-of-memory child.
    /// Half this many messages suffice for a child already resident.
    pub min_flush_size: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            min_flush_size: DEFAULT_MAX_NODE_SIZE / 16,
        }
    }
}

/// Configuration for the object cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of objects kept resident. Pinned objects may push
    /// residency above this bound until they are released.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}
