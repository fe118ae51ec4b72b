//! Counted copy-on-write B-tree.
//!
//! The in-memory representation of one named ordered map. Nodes are
//! immutable and shared through `Arc`: mutation copies the root-to-leaf
//! path and leaves every previously published root untouched, which is
//! what gives the engine cheap consistent snapshots and point-in-time
//! rollback. Every inner-node child entry carries the entry count of its
//! subtree, so rank queries (number of keys below a probe) resolve in
//! O(log n) without touching leaves outside the search path.

use std::ops::Bound;
use std::sync::Arc;

/// Maximum entries per node before it splits.
const MAX_NODE_ENTRIES: usize = 32;

/// A child slot in an inner node: the smallest key reachable through the
/// subtree, the subtree itself, and its total entry count.
#[derive(Debug, Clone)]
pub(crate) struct ChildEntry {
    pub key: Vec<u8>,
    pub node: Arc<Node>,
    pub count: u64,
}

#[derive(Debug)]
pub(crate) enum Node {
    Leaf(Vec<(Vec<u8>, Vec<u8>)>),
    Inner(Vec<ChildEntry>),
}

impl Node {
    fn first_key(&self) -> &[u8] {
        match self {
            Node::Leaf(entries) => &entries[0].0,
            Node::Inner(children) => &children[0].key,
        }
    }

    fn count(&self) -> u64 {
        match self {
            Node::Leaf(entries) => entries.len() as u64,
            Node::Inner(children) => children.iter().map(|c| c.count).sum(),
        }
    }
}

/// An ordered byte-key map with counted subtrees. Cloning is O(1) and
/// yields an independent, immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    pub(crate) root: Option<Arc<Node>>,
}

impl Tree {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn len(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.count())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf(entries) => {
                    return entries
                        .binary_search_by(|e| e.0.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone());
                }
                Node::Inner(children) => {
                    let i = children.partition_point(|c| c.key.as_slice() <= key);
                    if i == 0 {
                        return None;
                    }
                    node = &children[i - 1].node;
                }
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or replaces, returning the previous value if any.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        match self.root.take() {
            None => {
                self.root = Some(Arc::new(Node::Leaf(vec![(key.to_vec(), value.to_vec())])));
                None
            }
            Some(root) => {
                let (replacements, old) = insert_rec(&root, key, value);
                self.root = Some(rebuild_root(replacements));
                old
            }
        }
    }

    /// Removes a key, returning its previous value if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root.take()?;
        match remove_rec(&root, key) {
            None => {
                self.root = Some(root);
                None
            }
            Some((replacement, old)) => {
                self.root = replacement.map(|e| e.node);
                Some(old)
            }
        }
    }

    pub fn clear(&mut self) {
        self.root = None;
    }

    /// Greatest entry with key <= probe.
    pub fn floor(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf(entries) => {
                    let i = entries.partition_point(|e| e.0.as_slice() <= key);
                    return if i == 0 { None } else { Some(entries[i - 1].clone()) };
                }
                Node::Inner(children) => {
                    let i = children.partition_point(|c| c.key.as_slice() <= key);
                    if i == 0 {
                        return None;
                    }
                    node = &children[i - 1].node;
                }
            }
        }
    }

    /// Least entry with key >= probe.
    pub fn ceiling(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        ceiling_rec(self.root.as_deref()?, key)
    }

    pub fn first(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf(entries) => return entries.first().cloned(),
                Node::Inner(children) => node = &children[0].node,
            }
        }
    }

    pub fn last(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf(entries) => return entries.last().cloned(),
                Node::Inner(children) => node = &children[children.len() - 1].node,
            }
        }
    }

    /// Number of keys strictly below the probe. For a key present in the
    /// map this is its zero-based index in iteration order.
    pub fn rank(&self, key: &[u8]) -> u64 {
        let mut rank = 0u64;
        let mut node = match self.root.as_deref() {
            Some(n) => n,
            None => return 0,
        };
        loop {
            match node {
                Node::Leaf(entries) => {
                    return rank + entries.partition_point(|e| e.0.as_slice() < key) as u64;
                }
                Node::Inner(children) => {
                    let i = children.partition_point(|c| c.key.as_slice() <= key);
                    if i == 0 {
                        return rank;
                    }
                    rank += children[..i - 1].iter().map(|c| c.count).sum::<u64>();
                    node = &children[i - 1].node;
                }
            }
        }
    }

    /// Cursor over the given key range, in ascending order.
    pub fn range(&self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> super::cursor::Cursor {
        super::cursor::Cursor::new(self.root.clone(), start, end)
    }

    /// Cursor over the whole map.
    pub fn iter(&self) -> super::cursor::Cursor {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }
}

fn rebuild_root(mut replacements: Vec<ChildEntry>) -> Arc<Node> {
    if replacements.len() == 1 {
        replacements.remove(0).node
    } else {
        Arc::new(Node::Inner(replacements))
    }
}

fn child_entry(node: Node) -> ChildEntry {
    let count = node.count();
    let key = node.first_key().to_vec();
    ChildEntry { key, node: Arc::new(node), count }
}

/// Splits an overfull entry list in half and wraps each half. `wrap`
/// rebuilds the node variant from a run of entries.
fn split_if_needed<T>(entries: Vec<T>, wrap: impl Fn(Vec<T>) -> Node) -> Vec<ChildEntry> {
    if entries.len() <= MAX_NODE_ENTRIES {
        vec![child_entry(wrap(entries))]
    } else {
        let mut left = entries;
        let right = left.split_off(left.len() / 2);
        vec![child_entry(wrap(left)), child_entry(wrap(right))]
    }
}

fn insert_rec(node: &Node, key: &[u8], value: &[u8]) -> (Vec<ChildEntry>, Option<Vec<u8>>) {
    match node {
        Node::Leaf(entries) => {
            let mut entries = entries.clone();
            let old = match entries.binary_search_by(|e| e.0.as_slice().cmp(key)) {
                Ok(i) => Some(std::mem::replace(&mut entries[i].1, value.to_vec())),
                Err(i) => {
                    entries.insert(i, (key.to_vec(), value.to_vec()));
                    None
                }
            };
            (split_if_needed(entries, Node::Leaf), old)
        }
        Node::Inner(children) => {
            let i = children.partition_point(|c| c.key.as_slice() <= key);
            let ci = i.saturating_sub(1);
            let (replacements, old) = insert_rec(&children[ci].node, key, value);

            let mut children = children.clone();
            children.splice(ci..ci + 1, replacements);
            (split_if_needed(children, Node::Inner), old)
        }
    }
}

/// Returns None when the key is absent, otherwise the replacement entry
/// (None if the subtree emptied) and the removed value.
fn remove_rec(node: &Node, key: &[u8]) -> Option<(Option<ChildEntry>, Vec<u8>)> {
    match node {
        Node::Leaf(entries) => {
            let i = entries.binary_search_by(|e| e.0.as_slice().cmp(key)).ok()?;
            let mut entries = entries.clone();
            let (_, old) = entries.remove(i);
            let replacement = if entries.is_empty() {
                None
            } else {
                Some(child_entry(Node::Leaf(entries)))
            };
            Some((replacement, old))
        }
        Node::Inner(children) => {
            let i = children.partition_point(|c| c.key.as_slice() <= key);
            if i == 0 {
                return None;
            }
            let ci = i - 1;
            let (replacement, old) = remove_rec(&children[ci].node, key)?;

            let mut children = children.clone();
            match replacement {
                Some(entry) => children[ci] = entry,
                None => {
                    children.remove(ci);
                }
            }
            let replacement = if children.is_empty() {
                None
            } else {
                Some(child_entry(Node::Inner(children)))
            };
            Some((replacement, old))
        }
    }
}

fn ceiling_rec(node: &Node, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    match node {
        Node::Leaf(entries) => {
            let i = entries.partition_point(|e| e.0.as_slice() < key);
            entries.get(i).cloned()
        }
        Node::Inner(children) => {
            let i = children.partition_point(|c| c.key.as_slice() <= key);
            if i > 0 {
                if let Some(found) = ceiling_rec(&children[i - 1].node, key) {
                    return Some(found);
                }
            }
            // Everything under the previous child is below the probe; the
            // next subtree's first entry is the answer if one exists.
            children.get(i).map(|c| first_entry(&c.node))
        }
    }
}

fn first_entry(node: &Node) -> (Vec<u8>, Vec<u8>) {
    let mut node = node;
    loop {
        match node {
            Node::Leaf(entries) => return entries[0].clone(),
            Node::Inner(children) => node = &children[0].node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn populated(n: u32) -> Tree {
        let mut tree = Tree::new();
        for i in 0..n {
            assert!(tree.insert(&key(i), &key(i * 10)).is_none());
        }
        tree
    }

    #[test]
    fn test_insert_get_remove() {
        let mut tree = populated(1000);
        assert_eq!(tree.len(), 1000);

        for i in 0..1000 {
            assert_eq!(tree.get(&key(i)), Some(key(i * 10)));
        }
        assert_eq!(tree.get(&key(5000)), None);

        assert_eq!(tree.insert(&key(7), b"new"), Some(key(70)));
        assert_eq!(tree.len(), 1000);

        assert_eq!(tree.remove(&key(7)), Some(b"new".to_vec()));
        assert_eq!(tree.remove(&key(7)), None);
        assert_eq!(tree.len(), 999);
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut tree = populated(100);
        let snapshot = tree.clone();

        tree.insert(&key(1000), b"x");
        tree.remove(&key(0));

        assert_eq!(snapshot.len(), 100);
        assert_eq!(snapshot.get(&key(0)), Some(key(0)));
        assert_eq!(snapshot.get(&key(1000)), None);
        assert_eq!(tree.len(), 100);
    }

    #[test]
    fn test_floor_ceiling() {
        let mut tree = Tree::new();
        for i in (0..100).step_by(10) {
            tree.insert(&key(i), b"v");
        }

        assert_eq!(tree.floor(&key(35)).map(|e| e.0), Some(key(30)));
        assert_eq!(tree.floor(&key(30)).map(|e| e.0), Some(key(30)));
        assert_eq!(tree.floor(&key(0)).map(|e| e.0), Some(key(0)));
        assert!(tree.floor(&[0u8][..]).is_none()); // a 1-byte key sorts below all stored keys

        assert_eq!(tree.ceiling(&key(35)).map(|e| e.0), Some(key(40)));
        assert_eq!(tree.ceiling(&key(40)).map(|e| e.0), Some(key(40)));
        assert_eq!(tree.ceiling(&key(91)), None);
    }

    #[test]
    fn test_first_last() {
        let tree = populated(500);
        assert_eq!(tree.first().map(|e| e.0), Some(key(0)));
        assert_eq!(tree.last().map(|e| e.0), Some(key(499)));
        assert!(Tree::new().first().is_none());
    }

    #[test]
    fn test_rank() {
        let tree = populated(1000);
        for probe in [0u32, 1, 499, 999] {
            assert_eq!(tree.rank(&key(probe)), u64::from(probe));
        }
        assert_eq!(tree.rank(&key(5000)), 1000);
        assert_eq!(tree.rank(&[]), 0);
    }

    #[test]
    fn test_rank_after_removals() {
        let mut tree = populated(100);
        for i in (0..100).step_by(2) {
            tree.remove(&key(i));
        }
        // Only odd keys remain; rank of key(51) is the number of odd keys below 51
        assert_eq!(tree.rank(&key(51)), 25);
        assert_eq!(tree.len(), 50);
    }

    #[test]
    fn test_iteration_order() {
        let mut tree = Tree::new();
        // Insert in reverse to exercise splits on the left edge
        for i in (0..2000u32).rev() {
            tree.insert(&key(i), b"v");
        }
        let keys: Vec<_> = tree.iter().map(|e| e.0).collect();
        assert_eq!(keys.len(), 2000);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_remove_until_empty() {
        let mut tree = populated(300);
        for i in 0..300 {
            assert!(tree.remove(&key(i)).is_some());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert!(tree.first().is_none());
    }
}
