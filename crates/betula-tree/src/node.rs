//! Node representation and message application.
//!
//! A node is a `height` (0 = leaf) and an ordered pivot map. The key of a
//! pivot is the minimum key in its subtree; each pivot carries a pointer
//! to the child subtree (absent at leaves), a cached child size, and the
//! buffer of messages pending for that subtree. There is no fixed division
//! of a node between pivots and buffered messages: a node's size is its
//! pivot count plus everything buffered, bounded by the tree's maximum
//! node size outside of an in-flight flush.

use crate::message::{Combine, Key, Message, MessageKey};
use betula_common::{ObjectId, Result};
use betula_swap::{serde_codec, Ptr, SwapSpace, Swappable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub(crate) type MessageBuffer<K, V> = BTreeMap<MessageKey<K>, Message<V>>;
pub(crate) type PivotMap<K, V> = BTreeMap<K, ChildInfo<K, V>>;

/// One pivot entry.
pub(crate) struct ChildInfo<K: Key, V: Combine> {
    /// The owning subtree; `None` at leaves.
    pub(crate) child: Option<Ptr<Node<K, V>>>,
    /// Cached total size of the child, refreshed when the child is
    /// flushed into.
    pub(crate) child_size: u64,
    /// Messages pending for the child's subtree.
    pub(crate) buffer: MessageBuffer<K, V>,
}

impl<K: Key, V: Combine> ChildInfo<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            child: None,
            child_size: 0,
            buffer: MessageBuffer::new(),
        }
    }
}

/// A tree node.
pub(crate) struct Node<K: Key, V: Combine> {
    pub(crate) height: u64,
    pub(crate) pivots: PivotMap<K, V>,
}

impl<K: Key, V: Combine> Node<K, V> {
    pub(crate) fn leaf() -> Self {
        Self {
            height: 0,
            pivots: PivotMap::new(),
        }
    }

    pub(crate) fn new(height: u64, pivots: PivotMap<K, V>) -> Self {
        Self { height, pivots }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Pivot count plus every buffered message.
    pub(crate) fn total_size(&self) -> u64 {
        Self::size_of(&self.pivots)
    }

    pub(crate) fn size_of(pivots: &PivotMap<K, V>) -> u64 {
        pivots.len() as u64 + pivots.values().map(|ci| ci.buffer.len() as u64).sum::<u64>()
    }

    /// The pivot owning `key`: the greatest pivot key not exceeding it.
    /// `None` when the key precedes every pivot (or there are none).
    pub(crate) fn pivot_key_for(&self, key: &K) -> Option<&K> {
        self.pivots.range(..=key).next_back().map(|(k, _)| k)
    }

    /// Delivers one message into the buffer of the owning pivot.
    ///
    /// Inserts and deletes supersede everything buffered for the key; a
    /// delete survives at interior nodes to shadow the levels below.
    /// Updates fold: onto a buffered insert's value, onto a buffered
    /// update's delta (chains collapse to a single buffered update), or
    /// over a buffered delete as an insert of `default ⊕ delta`. At a leaf
    /// an update with nothing buffered materializes the same way.
    pub(crate) fn apply(&mut self, mkey: MessageKey<K>, msg: Message<V>) {
        let leaf = self.is_leaf();
        let pivot = self
            .pivot_key_for(&mkey.key)
            .expect("message routed to a node that cannot own its key")
            .clone();
        match msg {
            Message::Insert(value) => {
                let buffer = &mut self.pivots.get_mut(&pivot).unwrap().buffer;
                remove_key_messages(buffer, &mkey.key);
                buffer.insert(mkey, Message::Insert(value));
            }
            Message::Delete => {
                let buffer = &mut self.pivots.get_mut(&pivot).unwrap().buffer;
                remove_key_messages(buffer, &mkey.key);
                if !leaf {
                    buffer.insert(mkey, Message::Delete);
                }
            }
            Message::Update(delta) => {
                let prior = self.pivots[&pivot]
                    .buffer
                    .range(MessageKey::range_start(&mkey.key)..=MessageKey::range_end(&mkey.key))
                    .next_back()
                    .map(|(_, m)| m.clone());
                match prior {
                    None if leaf => {
                        let mut value = V::default();
                        value.combine(&delta);
                        self.apply(mkey, Message::Insert(value));
                    }
                    None => {
                        self.pivots
                            .get_mut(&pivot)
                            .unwrap()
                            .buffer
                            .insert(mkey, Message::Update(delta));
                    }
                    Some(Message::Insert(prev)) => {
                        let mut value = prev;
                        value.combine(&delta);
                        self.apply(mkey, Message::Insert(value));
                    }
                    Some(Message::Update(prev)) => {
                        let mut folded = prev;
                        folded.combine(&delta);
                        let buffer = &mut self.pivots.get_mut(&pivot).unwrap().buffer;
                        remove_key_messages(buffer, &mkey.key);
                        buffer.insert(mkey, Message::Update(folded));
                    }
                    Some(Message::Delete) => {
                        let mut value = V::default();
                        value.combine(&delta);
                        self.apply(mkey, Message::Insert(value));
                    }
                }
            }
        }
    }

    /// Splits any leaf pivot buffering more than `2 * min_flush_size`
    /// messages into two pivots at the median message.
    pub(crate) fn rebalance_leaf_buffers(&mut self, min_flush_size: u64) {
        debug_assert!(self.is_leaf());
        let oversized: Vec<K> = self
            .pivots
            .iter()
            .filter(|(_, ci)| ci.buffer.len() as u64 > 2 * min_flush_size)
            .map(|(k, _)| k.clone())
            .collect();
        for key in oversized {
            let info = self.pivots.get_mut(&key).unwrap();
            let mid = info
                .buffer
                .iter()
                .nth(info.buffer.len() / 2)
                .map(|(mk, _)| mk.clone())
                .unwrap();
            let upper = info.buffer.split_off(&mid);
            let pivot_key = upper.keys().next().unwrap().key.clone();
            self.pivots.insert(
                pivot_key,
                ChildInfo {
                    child: None,
                    child_size: 0,
                    buffer: upper,
                },
            );
        }
    }

    /// Partitions the pivots into two halves by count, draining this node.
    pub(crate) fn split_pivots(&mut self) -> (PivotMap<K, V>, PivotMap<K, V>) {
        debug_assert!(self.pivots.len() > 1);
        let pivots = std::mem::take(&mut self.pivots);
        halve_pivots(pivots)
    }
}

/// Splits a pivot map into two halves by pivot count.
pub(crate) fn halve_pivots<K: Key, V: Combine>(
    mut pivots: PivotMap<K, V>,
) -> (PivotMap<K, V>, PivotMap<K, V>) {
    debug_assert!(pivots.len() > 1);
    let mid = pivots.keys().nth(pivots.len() / 2).unwrap().clone();
    let right = pivots.split_off(&mid);
    (pivots, right)
}

fn remove_key_messages<K: Key, V: Combine>(buffer: &mut MessageBuffer<K, V>, key: &K) {
    let doomed: Vec<MessageKey<K>> = buffer
        .range(MessageKey::range_start(key)..=MessageKey::range_end(key))
        .map(|(mk, _)| mk.clone())
        .collect();
    for mk in doomed {
        buffer.remove(&mk);
    }
}

/// Durable image of a node. Child pointers are stored as object ids.
#[derive(Serialize, Deserialize)]
struct NodeImage<K, V> {
    height: u64,
    pivots: Vec<(K, ChildImage<K, V>)>,
}

#[derive(Serialize, Deserialize)]
struct ChildImage<K, V> {
    child: u64,
    child_size: u64,
    buffer: Vec<(MessageKey<K>, Message<V>)>,
}

impl<K: Key, V: Combine> Swappable for Node<K, V> {
    fn encode(&self) -> Result<Vec<u8>> {
        let image = NodeImage {
            height: self.height,
            pivots: self
                .pivots
                .iter()
                .map(|(key, ci)| {
                    (
                        key.clone(),
                        ChildImage {
                            child: ci.child.as_ref().map_or(0, |p| p.id().0),
                            child_size: ci.child_size,
                            buffer: ci
                                .buffer
                                .iter()
                                .map(|(mk, m)| (mk.clone(), m.clone()))
                                .collect(),
                        },
                    )
                })
                .collect(),
        };
        serde_codec::encode(&image)
    }

    fn decode(bytes: &[u8], space: &SwapSpace<Self>) -> Result<Self> {
        let image: NodeImage<K, V> = serde_codec::decode(bytes)?;
        let mut pivots = PivotMap::new();
        for (key, ci) in image.pivots {
            let child = if ci.child != 0 {
                Some(space.resolve(ObjectId(ci.child))?)
            } else {
                None
            };
            pivots.insert(
                key,
                ChildInfo {
                    child,
                    child_size: ci.child_size,
                    buffer: ci.buffer.into_iter().collect(),
                },
            );
        }
        Ok(Node {
            height: image.height,
            pivots,
        })
    }

    fn outbound_links(&self) -> Vec<ObjectId> {
        self.pivots
            .values()
            .filter_map(|ci| ci.child.as_ref().map(|p| p.id()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with_pivot(key: u64) -> Node<u64, String> {
        let mut node = Node::leaf();
        node.pivots.insert(key, ChildInfo::new());
        node
    }

    fn buffered(node: &Node<u64, String>, pivot: u64) -> Vec<(u64, u64, Message<String>)> {
        node.pivots[&pivot]
            .buffer
            .iter()
            .map(|(mk, m)| (mk.key, mk.timestamp, m.clone()))
            .collect()
    }

    #[test]
    fn test_pivot_key_for_picks_owner() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(10, ChildInfo::new());
        node.pivots.insert(20, ChildInfo::new());

        assert_eq!(node.pivot_key_for(&5), None);
        assert_eq!(node.pivot_key_for(&10), Some(&10));
        assert_eq!(node.pivot_key_for(&15), Some(&10));
        assert_eq!(node.pivot_key_for(&20), Some(&20));
        assert_eq!(node.pivot_key_for(&99), Some(&20));
    }

    #[test]
    fn test_apply_insert_supersedes() {
        let mut node = leaf_with_pivot(0);
        node.apply(MessageKey::new(7, 1), Message::Insert("a".into()));
        node.apply(MessageKey::new(7, 2), Message::Insert("b".into()));

        assert_eq!(buffered(&node, 0), vec![(7, 2, Message::Insert("b".into()))]);
    }

    #[test]
    fn test_apply_delete_at_leaf_removes() {
        let mut node = leaf_with_pivot(0);
        node.apply(MessageKey::new(7, 1), Message::Insert("a".into()));
        node.apply(MessageKey::new(7, 2), Message::Delete);

        assert!(node.pivots[&0].buffer.is_empty());
    }

    #[test]
    fn test_apply_delete_at_interior_shadows() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(0, ChildInfo::new());
        node.apply(MessageKey::new(7, 1), Message::Insert("a".into()));
        node.apply(MessageKey::new(7, 2), Message::Delete);

        assert_eq!(buffered(&node, 0), vec![(7, 2, Message::Delete)]);
    }

    #[test]
    fn test_apply_update_folds_into_insert() {
        let mut node = leaf_with_pivot(0);
        node.apply(MessageKey::new(7, 1), Message::Insert("a".into()));
        node.apply(MessageKey::new(7, 2), Message::Update("b".into()));

        assert_eq!(
            buffered(&node, 0),
            vec![(7, 2, Message::Insert("ab".into()))]
        );
    }

    #[test]
    fn test_apply_update_materializes_at_leaf() {
        let mut node = leaf_with_pivot(0);
        node.apply(MessageKey::new(7, 1), Message::Update("b".into()));

        assert_eq!(buffered(&node, 0), vec![(7, 1, Message::Insert("b".into()))]);
    }

    #[test]
    fn test_apply_update_buffered_at_interior() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(0, ChildInfo::new());
        node.apply(MessageKey::new(7, 1), Message::Update("b".into()));

        assert_eq!(buffered(&node, 0), vec![(7, 1, Message::Update("b".into()))]);
    }

    #[test]
    fn test_apply_update_chain_collapses() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(0, ChildInfo::new());
        node.apply(MessageKey::new(7, 1), Message::Update("b".into()));
        node.apply(MessageKey::new(7, 2), Message::Update("c".into()));

        assert_eq!(
            buffered(&node, 0),
            vec![(7, 2, Message::Update("bc".into()))]
        );
    }

    #[test]
    fn test_apply_update_after_delete_reinserts() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(0, ChildInfo::new());
        node.apply(MessageKey::new(7, 1), Message::Delete);
        node.apply(MessageKey::new(7, 2), Message::Update("b".into()));

        assert_eq!(buffered(&node, 0), vec![(7, 2, Message::Insert("b".into()))]);
    }

    #[test]
    fn test_apply_routes_by_pivot() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        node.pivots.insert(0, ChildInfo::new());
        node.pivots.insert(10, ChildInfo::new());

        node.apply(MessageKey::new(3, 1), Message::Insert("low".into()));
        node.apply(MessageKey::new(12, 2), Message::Insert("high".into()));

        assert_eq!(node.pivots[&0].buffer.len(), 1);
        assert_eq!(node.pivots[&10].buffer.len(), 1);
    }

    #[test]
    fn test_total_size_counts_pivots_and_messages() {
        let mut node = leaf_with_pivot(0);
        node.apply(MessageKey::new(1, 1), Message::Insert("a".into()));
        node.apply(MessageKey::new(2, 2), Message::Insert("b".into()));

        assert_eq!(node.total_size(), 3);
    }

    #[test]
    fn test_rebalance_splits_fat_leaf_buffer() {
        let mut node = leaf_with_pivot(0);
        for i in 0..10 {
            node.apply(MessageKey::new(i, i + 1), Message::Insert(format!("{i}")));
        }

        // 10 messages > 2 * 4.
        node.rebalance_leaf_buffers(4);

        assert_eq!(node.pivots.len(), 2);
        assert_eq!(node.pivots[&0].buffer.len(), 5);
        assert_eq!(node.pivots[&5].buffer.len(), 5);
        assert_eq!(node.total_size(), 12);
    }

    #[test]
    fn test_split_pivots_halves_by_count() {
        let mut node: Node<u64, String> = Node::new(1, PivotMap::new());
        for i in 0..5 {
            node.pivots.insert(i * 10, ChildInfo::new());
        }

        let (left, right) = node.split_pivots();
        assert_eq!(left.keys().copied().collect::<Vec<_>>(), vec![0, 10]);
        assert_eq!(right.keys().copied().collect::<Vec<_>>(), vec![20, 30, 40]);
        assert!(node.pivots.is_empty());
    }
}
