//! Betula buffered tree.
//!
//! A persistent, write-optimized ordered key-value store. Interior nodes
//! buffer pending mutations as messages and cascade them toward the
//! leaves in large batches, amortizing the I/O cost of small random
//! writes. Nodes live in a swap space that pages them between memory and
//! a backing store under a cache policy, so the working set is bounded
//! regardless of tree size.
//!
//! The store exposes ordered-map semantics: point insert, combine-update,
//! delete and query, plus forward cursors over the effective map. All
//! I/O happens transparently when nodes are pinned; a checkpoint makes
//! the current state durable and reopening a store resumes from the last
//! checkpoint.

mod cursor;
mod message;
mod node;
mod tree;

pub use betula_common::TreeConfig;
pub use cursor::Cursor;
pub use message::{Combine, Key};
pub use tree::Betree;
