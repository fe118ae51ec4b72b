//! Lazy range cursor over a tree snapshot.
//!
//! The cursor owns `Arc` references into the snapshot it was opened on, so
//! it stays valid regardless of later writes and has no borrow on the
//! engine. Each `next()` advances at most one tree step per level; dropping
//! the cursor releases the node references.

use std::ops::Bound;
use std::sync::Arc;

use super::tree::Node;

struct Frame {
    node: Arc<Node>,
    /// Next entry (leaf) or current child (inner) index.
    idx: usize,
}

pub struct Cursor {
    stack: Vec<Frame>,
    end: Bound<Vec<u8>>,
    done: bool,
}

impl Cursor {
    pub(crate) fn new(root: Option<Arc<Node>>, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        let mut cursor = Self { stack: Vec::new(), end, done: root.is_none() };
        if let Some(root) = root {
            cursor.seek(root, &start);
        }
        cursor
    }

    /// Positions the stack on the first entry >= the start bound.
    fn seek(&mut self, root: Arc<Node>, start: &Bound<Vec<u8>>) {
        // An excluded start is an included start at the key's successor,
        // since appending 0x00 yields the smallest strictly-greater key.
        let start_key: Option<Vec<u8>> = match start {
            Bound::Unbounded => None,
            Bound::Included(k) => Some(k.clone()),
            Bound::Excluded(k) => {
                let mut succ = k.clone();
                succ.push(0x00);
                Some(succ)
            }
        };

        let mut node = root;
        loop {
            let (idx, child) = match (&*node, &start_key) {
                (Node::Leaf(_), None) => (0, None),
                (Node::Leaf(entries), Some(k)) => {
                    (entries.partition_point(|e| e.0.as_slice() < k.as_slice()), None)
                }
                (Node::Inner(children), None) => (0, Some(children[0].node.clone())),
                (Node::Inner(children), Some(k)) => {
                    let i = children.partition_point(|c| c.key.as_slice() <= k.as_slice());
                    let ci = i.saturating_sub(1);
                    (ci, Some(children[ci].node.clone()))
                }
            };
            self.stack.push(Frame { node, idx });
            match child {
                Some(c) => node = c,
                None => return,
            }
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(k) => key > k.as_slice(),
            Bound::Excluded(k) => key >= k.as_slice(),
        }
    }

    /// After exhausting a subtree, steps the nearest ancestor to its next
    /// child. Leaves the stack ready for the descend in `next()`.
    fn advance_parent(&mut self) {
        while let Some(frame) = self.stack.last() {
            let child_count = match &*frame.node {
                Node::Inner(children) => children.len(),
                Node::Leaf(_) => unreachable!("leaf can never be an ancestor"),
            };
            if frame.idx + 1 < child_count {
                if let Some(frame) = self.stack.last_mut() {
                    frame.idx += 1;
                }
                return;
            }
            self.stack.pop();
        }
    }
}

impl Iterator for Cursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (node, idx) = match self.stack.last() {
                Some(f) => (f.node.clone(), f.idx),
                None => {
                    self.done = true;
                    return None;
                }
            };
            match &*node {
                Node::Leaf(entries) => {
                    if idx < entries.len() {
                        let entry = entries[idx].clone();
                        if self.past_end(&entry.0) {
                            self.done = true;
                            self.stack.clear();
                            return None;
                        }
                        if let Some(frame) = self.stack.last_mut() {
                            frame.idx += 1;
                        }
                        return Some(entry);
                    }
                    self.stack.pop();
                    self.advance_parent();
                }
                Node::Inner(children) => {
                    // Fresh subtree pushed by advance_parent or seek;
                    // descend toward its leftmost leaf.
                    let child = children[idx].node.clone();
                    self.stack.push(Frame { node: child, idx: 0 });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tree::Tree;
    use std::ops::Bound;

    fn key(i: u32) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn tree_with(n: u32) -> Tree {
        let mut tree = Tree::new();
        for i in 0..n {
            tree.insert(&key(i), &key(i));
        }
        tree
    }

    #[test]
    fn test_full_scan() {
        let tree = tree_with(1000);
        let keys: Vec<_> = tree.iter().map(|e| e.0).collect();
        assert_eq!(keys.len(), 1000);
        assert_eq!(keys[0], key(0));
        assert_eq!(keys[999], key(999));
    }

    #[test]
    fn test_closed_range() {
        let tree = tree_with(100);
        let keys: Vec<_> = tree
            .range(Bound::Included(key(10)), Bound::Included(key(19)))
            .map(|e| e.0)
            .collect();
        assert_eq!(keys, (10..20).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_excluded_bounds() {
        let tree = tree_with(100);
        let keys: Vec<_> = tree
            .range(Bound::Excluded(key(10)), Bound::Excluded(key(15)))
            .map(|e| e.0)
            .collect();
        assert_eq!(keys, (11..15).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_between_keys() {
        let mut tree = Tree::new();
        for i in (0..100).step_by(10) {
            tree.insert(&key(i), b"v");
        }
        // Bounds that fall between stored keys
        let keys: Vec<_> = tree
            .range(Bound::Included(key(15)), Bound::Included(key(45)))
            .map(|e| e.0)
            .collect();
        assert_eq!(keys, vec![key(20), key(30), key(40)]);
    }

    #[test]
    fn test_empty_range() {
        let tree = tree_with(100);
        assert_eq!(tree.range(Bound::Included(key(200)), Bound::Unbounded).count(), 0);
        assert_eq!(
            tree.range(Bound::Included(key(20)), Bound::Included(key(10))).count(),
            0
        );
    }

    #[test]
    fn test_cursor_survives_writes() {
        let mut tree = tree_with(50);
        let cursor = tree.iter();
        for i in 0..50 {
            tree.remove(&key(i));
        }
        assert_eq!(cursor.count(), 50);
    }
}
