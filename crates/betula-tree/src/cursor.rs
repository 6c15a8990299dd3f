//! Forward cursors over the effective map.
//!
//! A cursor walks the tree's messages in `(key, timestamp)` order and
//! folds each key's messages, across every level, into the key's
//! effective value. Keys whose accumulation ends deleted are skipped, so
//! the cursor presents exactly one entry per live key, ascending.

use crate::message::{Combine, Key, Message, MessageKey};
use crate::tree::Betree;
use betula_common::{BetulaError, Result};

/// A forward cursor. Iteration yields `(key, value)` pairs in key order;
/// an exhausted cursor is the past-the-end position.
pub struct Cursor<'a, K: Key, V: Combine> {
    tree: &'a Betree<K, V>,
    position: Option<(MessageKey<K>, Message<V>)>,
    entry: Option<(K, V)>,
    failed: Option<BetulaError>,
}

impl<K: Key, V: Combine> Betree<K, V> {
    /// A cursor positioned at the smallest entry.
    pub fn begin(&self) -> Result<Cursor<'_, K, V>> {
        self.cursor_after(None)
    }

    /// A cursor positioned at the first entry with key `>= key`.
    pub fn lower_bound(&self, key: &K) -> Result<Cursor<'_, K, V>> {
        self.cursor_after(Some(MessageKey::range_start(key)))
    }

    /// A cursor positioned strictly after any entry for `key`.
    pub fn upper_bound(&self, key: &K) -> Result<Cursor<'_, K, V>> {
        self.cursor_after(Some(MessageKey::range_end(key)))
    }

    fn cursor_after(&self, after: Option<MessageKey<K>>) -> Result<Cursor<'_, K, V>> {
        let position = self.next_message(&self.root, after.as_ref())?;
        let mut cursor = Cursor {
            tree: self,
            position,
            entry: None,
            failed: None,
        };
        cursor.settle()?;
        Ok(cursor)
    }
}

impl<K: Key, V: Combine> Cursor<'_, K, V> {
    /// Advances to the next effective entry: pulls messages while they
    /// continue the current key (or until one yields a live value),
    /// folding inserts, updates, and deletes as they come.
    fn settle(&mut self) -> Result<()> {
        let mut key: Option<K> = None;
        let mut value: Option<V> = None;
        while let Some((mkey, msg)) = self.position.clone() {
            if value.is_some() && key.as_ref() != Some(&mkey.key) {
                break;
            }
            match msg {
                Message::Insert(v) => {
                    key = Some(mkey.key.clone());
                    value = Some(v);
                }
                Message::Update(delta) => {
                    key = Some(mkey.key.clone());
                    let mut folded = value.take().unwrap_or_default();
                    folded.combine(&delta);
                    value = Some(folded);
                }
                Message::Delete => {
                    value = None;
                }
            }
            self.position = self.tree.next_message(&self.tree.root, Some(&mkey))?;
        }
        self.entry = match (key, value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        };
        Ok(())
    }
}

impl<K: Key, V: Combine> Iterator for Cursor<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.failed.take() {
            return Some(Err(err));
        }
        let entry = self.entry.take()?;
        if let Err(e) = self.settle() {
            self.failed = Some(e);
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betula_cache::LruCacheManager;
    use betula_common::TreeConfig;
    use betula_store::MemoryStore;

    fn tree() -> Betree<u64, String> {
        Betree::open(
            Box::new(MemoryStore::new()),
            Box::new(LruCacheManager::new(16)),
            TreeConfig {
                max_node_size: 16,
                min_flush_size: 4,
            },
        )
        .unwrap()
    }

    fn collect(cursor: Cursor<'_, u64, String>) -> Vec<(u64, String)> {
        cursor.map(|e| e.unwrap()).collect()
    }

    #[test]
    fn test_cursor_empty_tree() {
        let t = tree();
        assert!(t.begin().unwrap().next().is_none());
    }

    #[test]
    fn test_cursor_visits_in_key_order() {
        let mut t = tree();
        t.insert(8, "z".into()).unwrap();
        t.insert(2, "x".into()).unwrap();
        t.insert(5, "y".into()).unwrap();

        assert_eq!(
            collect(t.begin().unwrap()),
            vec![(2, "x".into()), (5, "y".into()), (8, "z".into())]
        );
    }

    #[test]
    fn test_cursor_skips_deleted() {
        let mut t = tree();
        t.insert(1, "a".into()).unwrap();
        t.insert(2, "b".into()).unwrap();
        t.insert(3, "c".into()).unwrap();
        t.erase(2).unwrap();

        assert_eq!(
            collect(t.begin().unwrap()),
            vec![(1, "a".into()), (3, "c".into())]
        );
    }

    #[test]
    fn test_cursor_folds_updates() {
        let mut t = tree();
        t.insert(1, "a".into()).unwrap();
        t.update(1, "b".into()).unwrap();
        t.update(2, "solo".into()).unwrap();

        assert_eq!(
            collect(t.begin().unwrap()),
            vec![(1, "ab".into()), (2, "solo".into())]
        );
    }

    #[test]
    fn test_lower_bound_starts_at_key() {
        let mut t = tree();
        t.insert(2, "x".into()).unwrap();
        t.insert(5, "y".into()).unwrap();
        t.insert(8, "z".into()).unwrap();

        assert_eq!(
            collect(t.lower_bound(&3).unwrap()),
            vec![(5, "y".into()), (8, "z".into())]
        );
        assert_eq!(
            collect(t.lower_bound(&5).unwrap()),
            vec![(5, "y".into()), (8, "z".into())]
        );
    }

    #[test]
    fn test_lower_bound_below_minimum_sees_everything() {
        let mut t = tree();
        t.insert(10, "a".into()).unwrap();
        t.insert(20, "b".into()).unwrap();

        assert_eq!(
            collect(t.lower_bound(&0).unwrap()),
            vec![(10, "a".into()), (20, "b".into())]
        );
    }

    #[test]
    fn test_upper_bound_strictly_after() {
        let mut t = tree();
        t.insert(2, "x".into()).unwrap();
        t.insert(5, "y".into()).unwrap();
        t.insert(8, "z".into()).unwrap();

        assert_eq!(collect(t.upper_bound(&5).unwrap()), vec![(8, "z".into())]);
        assert_eq!(collect(t.upper_bound(&8).unwrap()), vec![]);
    }

    #[test]
    fn test_cursor_sees_buffered_and_flushed_state() {
        let mut t = tree();
        // Enough traffic to push early keys down a level.
        for i in 0..64u64 {
            t.insert(i, format!("{i}")).unwrap();
        }
        t.erase(10).unwrap();
        t.update(11, "+".into()).unwrap();

        let entries = collect(t.begin().unwrap());
        assert_eq!(entries.len(), 63);
        assert!(!entries.iter().any(|(k, _)| *k == 10));
        assert!(entries.contains(&(11, "11+".into())));
    }
}
