//! The buffered tree.
//!
//! Mutations enter at the root as one-message batches and cascade toward
//! the leaves in large flushes. A node receiving a batch may exceed the
//! maximum node size while the flush is in progress; the flush restores
//! the bound before returning, either by forwarding buffered messages to
//! children or by splitting. Flush targets are chosen by I/O cost: a full
//! batch is worth writing to any child, half a batch to a child already in
//! memory, and a single-pivot batch is forwarded straight to a child that
//! is dirty anyway.

use crate::message::{Combine, Key, Message, MessageKey};
use crate::node::{ChildInfo, MessageBuffer, Node, PivotMap};
use betula_cache::CacheManager;
use betula_common::{BetulaError, Result, TreeConfig};
use betula_store::BackingStore;
use betula_swap::{serde_codec, Ptr, SwapSpace};
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Tree state carried in the checkpoint index, alongside the object table.
#[derive(Serialize, Deserialize)]
struct TreeMeta {
    max_node_size: u64,
    min_flush_size: u64,
    next_timestamp: u64,
}

/// A persistent, write-optimized ordered map.
///
/// Point mutations are buffered; queries and ordered scans see their
/// effects immediately. [`checkpoint`](Betree::checkpoint) makes the
/// current state durable; reopening a store picks up the last checkpoint.
pub struct Betree<K: Key, V: Combine> {
    pub(crate) space: SwapSpace<Node<K, V>>,
    pub(crate) root: Ptr<Node<K, V>>,
    config: TreeConfig,
    next_timestamp: u64,
}

impl<K: Key, V: Combine> Betree<K, V> {
    /// Opens a tree over the given store. An existing checkpoint restores
    /// the previous tree (its tuning parameters win over `config`); an
    /// empty store starts a fresh tree.
    pub fn open(
        store: Box<dyn BackingStore>,
        manager: Box<dyn CacheManager>,
        config: TreeConfig,
    ) -> Result<Self> {
        let space = SwapSpace::open(store, manager)?;
        match space.root() {
            Some(root) => {
                let bytes = space.meta().ok_or(BetulaError::CorruptRoot)?;
                let meta: TreeMeta = serde_codec::decode(&bytes)?;
                tracing::info!(
                    max_node_size = meta.max_node_size,
                    min_flush_size = meta.min_flush_size,
                    "opened existing tree"
                );
                Ok(Self {
                    space,
                    root,
                    config: TreeConfig {
                        max_node_size: meta.max_node_size,
                        min_flush_size: meta.min_flush_size,
                    },
                    next_timestamp: meta.next_timestamp,
                })
            }
            None => {
                tracing::info!(
                    max_node_size = config.max_node_size,
                    min_flush_size = config.min_flush_size,
                    "created new tree"
                );
                let root = space.allocate(Node::leaf())?;
                space.set_root(&root);
                Ok(Self {
                    space,
                    root,
                    config,
                    next_timestamp: 1,
                })
            }
        }
    }

    /// Returns the active tuning parameters.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Buffered insert; supersedes any previous value for the key.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.upsert(key, Message::Insert(value))
    }

    /// Buffered combine against the previous value, or against the
    /// default value when none exists.
    pub fn update(&mut self, key: K, delta: V) -> Result<()> {
        self.upsert(key, Message::Update(delta))
    }

    /// Buffered delete; removing an absent key is a no-op.
    pub fn erase(&mut self, key: K) -> Result<()> {
        self.upsert(key, Message::Delete)
    }

    /// Stamps the message, flushes it into the root, and grows the tree by
    /// a level if the root split.
    fn upsert(&mut self, key: K, msg: Message<V>) -> Result<()> {
        let mkey = MessageKey::new(key, self.next_timestamp);
        self.next_timestamp += 1;
        let mut batch = MessageBuffer::new();
        batch.insert(mkey, msg);

        let root = self.root.clone();
        let replacements = self.flush_node(&root, batch)?;
        if !replacements.is_empty() {
            let height = root.pin()?.read().height + 1;
            let new_root = self.space.allocate(Node::new(height, replacements))?;
            self.space.set_root(&new_root);
            self.root = new_root;
            tracing::debug!(height, "root split; tree grew a level");
        }
        Ok(())
    }

    /// Looks up the effective value for `key`, or `None` if no value is
    /// present.
    pub fn query(&self, key: &K) -> Result<Option<V>> {
        self.query_node(&self.root, key)
    }

    /// Writes every dirty node back and durably records the tree state.
    pub fn checkpoint(&self) -> Result<()> {
        let meta = serde_codec::encode(&TreeMeta {
            max_node_size: self.config.max_node_size,
            min_flush_size: self.config.min_flush_size,
            next_timestamp: self.next_timestamp,
        })?;
        self.space.checkpoint(&meta)
    }

    /// Merges `batch` into the subtree rooted at `ptr` and restores the
    /// size bound. Returns the node's replacement pivots if it split,
    /// otherwise an empty map.
    fn flush_node(
        &self,
        ptr: &Ptr<Node<K, V>>,
        batch: MessageBuffer<K, V>,
    ) -> Result<PivotMap<K, V>> {
        if batch.is_empty() {
            return Ok(PivotMap::new());
        }
        let guard = ptr.pin()?;
        let mut node = guard.write();

        // A fresh root has no pivots yet; seed one at the batch minimum.
        if node.pivots.is_empty() {
            let first = batch.keys().next().unwrap().key.clone();
            node.pivots.insert(first, ChildInfo::new());
        }

        // The first pivot always keys the node's minimum.
        let old_min = node.pivots.keys().next().unwrap().clone();
        let new_min = batch.keys().next().unwrap().key.clone();
        if new_min < old_min {
            let info = node.pivots.remove(&old_min).unwrap();
            node.pivots.insert(new_min, info);
        }

        if node.is_leaf() {
            for (mkey, msg) in batch {
                node.apply(mkey, msg);
            }
            node.rebalance_leaf_buffers(self.config.min_flush_size);
            if node.total_size() >= self.config.max_node_size {
                return self.split_node(&mut node);
            }
            return Ok(PivotMap::new());
        }

        // If the whole batch is bound for a single child that is dirty in
        // cache, forward it without buffering. The child has to be written
        // back regardless; buffering here would dirty this node too.
        let first_pivot = node
            .pivot_key_for(&batch.keys().next().unwrap().key)
            .unwrap()
            .clone();
        let last_pivot = node
            .pivot_key_for(&batch.keys().next_back().unwrap().key)
            .unwrap()
            .clone();
        let mut remaining = Some(batch);
        if first_pivot == last_pivot {
            let info = &node.pivots[&first_pivot];
            let child_dirty = info.child.as_ref().is_some_and(|c| c.is_dirty());
            if child_dirty && info.buffer.is_empty() {
                let child = info.child.clone().unwrap();
                let replacements = self.flush_node(&child, remaining.take().unwrap())?;
                if replacements.is_empty() {
                    let size = self.node_size(&child)?;
                    node.pivots.get_mut(&first_pivot).unwrap().child_size = size;
                } else {
                    node.pivots.remove(&first_pivot);
                    node.pivots.extend(replacements);
                }
            }
        }

        if let Some(batch) = remaining {
            for (mkey, msg) in batch {
                node.apply(mkey, msg);
            }
        }

        // Push buffered batches down until the node fits, preferring the
        // pivot with the most pending messages.
        while node.total_size() >= self.config.max_node_size {
            let mut victim: Option<K> = None;
            let mut victim_pending = 0u64;
            for (key, info) in &node.pivots {
                let pending = info.buffer.len() as u64;
                let resident = info.child.as_ref().is_some_and(|c| c.is_in_memory());
                if (pending >= self.config.min_flush_size
                    || (pending >= self.config.min_flush_size / 2 && resident))
                    && pending > victim_pending
                {
                    victim = Some(key.clone());
                    victim_pending = pending;
                }
            }
            let Some(key) = victim else {
                break; // Nothing worth flushing; too many pivots.
            };

            let info = node.pivots.get_mut(&key).unwrap();
            let child = info.child.clone().expect("interior pivot must have a child");
            let pending = std::mem::take(&mut info.buffer);
            let replacements = self.flush_node(&child, pending)?;
            if replacements.is_empty() {
                let size = self.node_size(&child)?;
                node.pivots.get_mut(&key).unwrap().child_size = size;
            } else {
                node.pivots.remove(&key);
                node.pivots.extend(replacements);
            }
        }

        if node.total_size() > self.config.max_node_size {
            return self.split_node(&mut node);
        }
        Ok(PivotMap::new())
    }

    /// Replaces an oversized node with two halves at the same height.
    fn split_node(&self, node: &mut Node<K, V>) -> Result<PivotMap<K, V>> {
        debug_assert!(node.total_size() >= self.config.max_node_size);
        assert!(node.pivots.len() > 1, "cannot split a single-pivot node");
        tracing::debug!(
            height = node.height,
            pivots = node.pivots.len(),
            size = node.total_size(),
            "splitting node"
        );

        let height = node.height;
        let (left, right) = node.split_pivots();

        // Buffers make halves uneven; a half that still breaches the
        // bound is halved again so every replacement honors it.
        let mut work = vec![left, right];
        let mut parts = Vec::new();
        while let Some(part) = work.pop() {
            if Node::size_of(&part) > self.config.max_node_size && part.len() > 1 {
                let (a, b) = crate::node::halve_pivots(part);
                work.push(a);
                work.push(b);
            } else {
                parts.push(part);
            }
        }

        let mut replacements = PivotMap::new();
        for part in parts {
            let key = part.keys().next().unwrap().clone();
            let size = Node::size_of(&part);
            let child = self.space.allocate(Node::new(height, part))?;
            replacements.insert(
                key,
                ChildInfo {
                    child: Some(child),
                    child_size: size,
                    buffer: MessageBuffer::new(),
                },
            );
        }
        Ok(replacements)
    }

    fn node_size(&self, ptr: &Ptr<Node<K, V>>) -> Result<u64> {
        Ok(ptr.pin()?.read().total_size())
    }

    fn query_node(&self, ptr: &Ptr<Node<K, V>>, key: &K) -> Result<Option<V>> {
        let guard = ptr.pin()?;
        let node = guard.read();
        let Some(pivot) = node.pivot_key_for(key) else {
            return Ok(None);
        };
        let info = &node.pivots[pivot];

        if node.is_leaf() {
            let found = info
                .buffer
                .range(MessageKey::range_start(key)..=MessageKey::range_end(key))
                .next();
            return Ok(match found {
                Some((_, Message::Insert(value))) => Some(value.clone()),
                Some(_) => {
                    debug_assert!(false, "leaf buffers hold only inserts");
                    None
                }
                None => None,
            });
        }

        // Latest-wins against the buffered messages: an insert or delete
        // settles the key here; updates are folded onto whatever the
        // subtree yields.
        let mut messages = info
            .buffer
            .range(MessageKey::range_start(key)..=MessageKey::range_end(key))
            .map(|(_, m)| m.clone())
            .collect::<Vec<_>>()
            .into_iter();
        let child = info.child.clone().expect("interior pivot must have a child");

        let mut value = match messages.next() {
            None => return self.query_node(&child, key),
            Some(Message::Insert(value)) => Some(value),
            Some(Message::Delete) => None,
            Some(Message::Update(first)) => {
                let mut value = self.query_node(&child, key)?.unwrap_or_default();
                value.combine(&first);
                Some(value)
            }
        };
        for msg in messages {
            match msg {
                Message::Update(delta) => {
                    let mut folded = value.take().unwrap_or_default();
                    folded.combine(&delta);
                    value = Some(folded);
                }
                _ => debug_assert!(false, "only updates can trail a buffered message"),
            }
        }
        Ok(value)
    }

    /// Returns the smallest message strictly greater than `after` anywhere
    /// in the subtree, merging each level's buffers with the levels below.
    /// `None` means the subtree is exhausted.
    pub(crate) fn next_message(
        &self,
        ptr: &Ptr<Node<K, V>>,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        let guard = ptr.pin()?;
        let node = guard.read();
        if node.pivots.is_empty() {
            return Ok(None);
        }
        // Scan from the pivot owning the probe key; a probe below every
        // pivot starts at the first so nothing is skipped.
        let start = match after {
            Some(mkey) => node
                .pivot_key_for(&mkey.key)
                .unwrap_or_else(|| node.pivots.keys().next().unwrap())
                .clone(),
            None => node.pivots.keys().next().unwrap().clone(),
        };
        let leaf = node.is_leaf();
        for (_, info) in node.pivots.range(start..) {
            if let Some(found) = self.next_from_pivot(leaf, info, after)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn next_from_pivot(
        &self,
        leaf: bool,
        info: &ChildInfo<K, V>,
        after: Option<&MessageKey<K>>,
    ) -> Result<Option<(MessageKey<K>, Message<V>)>> {
        let buffered = match after {
            Some(mkey) => info
                .buffer
                .range((Bound::Excluded(mkey), Bound::Unbounded))
                .next(),
            None => info.buffer.iter().next(),
        }
        .map(|(mk, m)| (mk.clone(), m.clone()));

        if leaf {
            return Ok(buffered);
        }
        let child = info.child.as_ref().expect("interior pivot must have a child");
        match buffered {
            None => self.next_message(child, after),
            Some(here) => match self.next_message(child, after)? {
                Some(below) if below.0 < here.0 => Ok(Some(below)),
                _ => Ok(Some(here)),
            },
        }
    }
}

impl<K: Key, V: Combine> Drop for Betree<K, V> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if let Err(e) = self.checkpoint() {
            tracing::warn!(error = %e, "checkpoint on drop failed");
        }
    }
}
