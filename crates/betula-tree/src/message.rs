//! Buffered mutation messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Keys which can be stored in a Betula tree.
pub trait Key: Clone + Ord + Serialize + DeserializeOwned + std::fmt::Debug + 'static {}

impl<K> Key for K where K: Clone + Ord + Serialize + DeserializeOwned + std::fmt::Debug + 'static {}

/// Values which can be stored in a Betula tree.
///
/// Values form a monoid-like structure: [`Default`] supplies the identity
/// and [`combine`](Combine::combine) folds a delta onto an existing value.
/// The store assumes combination is associative in the order deltas were
/// issued.
pub trait Combine:
    Clone + Default + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
    /// Folds `delta` onto `self`.
    fn combine(&mut self, delta: &Self);
}

impl Combine for String {
    fn combine(&mut self, delta: &Self) {
        self.push_str(delta);
    }
}

impl Combine for u64 {
    fn combine(&mut self, delta: &Self) {
        *self = self.wrapping_add(*delta);
    }
}

/// A buffered mutation.
///
/// An update carries a delta combined with the value already present, or
/// with the default value when none exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message<V> {
    Insert(V),
    Delete,
    Update(V),
}

/// A key paired with the timestamp of the operation that produced it.
///
/// Timestamps are strictly monotonic within a tree, so buffered messages
/// for the same key stay ordered by arrival even when several accumulate
/// in one buffer. Ordering is lexicographic: by key, then timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey<K> {
    pub key: K,
    pub timestamp: u64,
}

impl<K> MessageKey<K> {
    pub fn new(key: K, timestamp: u64) -> Self {
        Self { key, timestamp }
    }
}

impl<K: Clone> MessageKey<K> {
    /// The smallest message key for `key`. Timestamp 0 is reserved and
    /// never used by a real message.
    pub fn range_start(key: &K) -> Self {
        Self {
            key: key.clone(),
            timestamp: 0,
        }
    }

    /// The largest message key for `key`.
    pub fn range_end(key: &K) -> Self {
        Self {
            key: key.clone(),
            timestamp: u64::MAX,
        }
    }
}
