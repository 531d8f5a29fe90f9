//! Disk-resident B+ tree index
//!
//! Every node occupies one block of a store file managed by a
//! [`BufferManager`]. Nodes are decoded into owned [`Node`] values, edited,
//! and written back, so the cache never hands out aliases between nodes.
//!
//! The tree supports:
//! - Duplicate keys (multiset semantics through `multi_find`)
//! - Range scans and full iteration via the linked leaf chain
//! - Timestamped mutations that can be undone with `roll_back`
//!
//! Capacity `max_keys` (M) bounds the separators of an internal node, which
//! therefore has at most M + 1 children; `max_entries` (L) bounds a leaf.
//! Non-root nodes keep at least ⌈M/2⌉ children or ⌈L/2⌉ entries.
//!
//! The internal bound counts children, not keys. An overfull internal node
//! holds M + 1 keys; one is promoted on split, leaving M to share between
//! the halves. For odd M that is fewer than 2 * ⌈M/2⌉, so a key bound could
//! not hold on both sides, while each half still gets ⌈M/2⌉ children.

mod error;
mod node;

pub use error::{BPlusTreeError, BPlusTreeResult};
pub use node::{InternalNode, LeafNode, Node};

use std::marker::PhantomData;
use std::path::Path;

use crate::codec::Fixed;
use crate::config::StoreConfig;
use crate::file::{BLOCK_SIZE, BufferManager, NULL_POINTER, Pointer, StoreKind, Timestamp};

use node::NODE_HEADER_SIZE;

/// Smallest separator capacity that keeps splits and merges well defined
pub const MIN_KEYS: usize = 3;

/// Smallest leaf capacity
pub const MIN_ENTRIES: usize = 2;

/// Tree fields kept in the store metadata region
///
/// ```text
/// 0..8    root (-1 = empty)
/// 8..16   first leaf (-1 = empty)
/// 16..24  entry count
/// 24..28  max separator keys (0 = not yet initialized)
/// 28..32  max leaf entries
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TreeMeta {
    root: Pointer,
    first_leaf: Pointer,
    len: usize,
    max_keys: usize,
    max_entries: usize,
}

impl TreeMeta {
    fn read(buf: &[u8]) -> Self {
        Self {
            root: Pointer::decode(&buf[0..8]),
            first_leaf: Pointer::decode(&buf[8..16]),
            len: u64::decode(&buf[16..24]) as usize,
            max_keys: u32::decode(&buf[24..28]) as usize,
            max_entries: u32::decode(&buf[28..32]) as usize,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        self.root.encode(&mut buf[0..8]);
        self.first_leaf.encode(&mut buf[8..16]);
        (self.len as u64).encode(&mut buf[16..24]);
        (self.max_keys as u32).encode(&mut buf[24..28]);
        (self.max_entries as u32).encode(&mut buf[28..32]);
    }
}

/// Shape of a tree as observed by [`BPlusTree::validate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub internal_nodes: usize,
    pub leaves: usize,
    pub entries: usize,
}

/// Position inside the leaf chain
struct Cursor<K, V> {
    leaf: LeafNode<K, V>,
    pos: usize,
}

/// Accumulated state of a validation pass
#[derive(Default)]
struct Walk {
    stats: TreeStats,
    leaf_depth: Option<usize>,
    /// (leaf, its next pointer) in key order
    leaves: Vec<(Pointer, Pointer)>,
}

/// Path from the root to a node: (internal node, child index taken)
type NodePath = Vec<(Pointer, usize)>;

/// B+ tree mapping fixed-size keys to fixed-size values
pub struct BPlusTree<K, V> {
    buffer: BufferManager,
    meta: TreeMeta,
    /// Value matched by the last successful `contains`
    last_found: Option<V>,
    _key: PhantomData<K>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Fixed + Ord + Clone,
    V: Fixed + Clone,
{
    /// Open (or create) a tree whose nodes fill a whole block
    pub fn open<P: AsRef<Path>>(path: P, config: &StoreConfig) -> BPlusTreeResult<Self> {
        let (max_keys, max_entries) = Self::default_capacity();
        if max_keys < MIN_KEYS || max_entries < MIN_ENTRIES {
            return Err(BPlusTreeError::KeyTooLarge {
                key_size: K::SIZE,
                value_size: V::SIZE,
            });
        }
        Self::open_with(path.as_ref(), max_keys, max_entries, config)
    }

    /// Open (or create) a tree with smaller nodes than a block allows
    pub fn with_capacity<P: AsRef<Path>>(
        path: P,
        max_keys: usize,
        max_entries: usize,
        config: &StoreConfig,
    ) -> BPlusTreeResult<Self> {
        let (key_limit, entry_limit) = Self::default_capacity();
        if max_keys < MIN_KEYS
            || max_entries < MIN_ENTRIES
            || max_keys > key_limit
            || max_entries > entry_limit
        {
            return Err(BPlusTreeError::InvalidCapacity {
                max_keys,
                max_entries,
            });
        }
        Self::open_with(path.as_ref(), max_keys, max_entries, config)
    }

    /// Largest (separator, leaf entry) capacities that fit one block
    pub fn default_capacity() -> (usize, usize) {
        let max_keys =
            (BLOCK_SIZE - NODE_HEADER_SIZE - Pointer::SIZE) / (K::SIZE + Pointer::SIZE);
        let max_entries = (BLOCK_SIZE - NODE_HEADER_SIZE) / (K::SIZE + V::SIZE).max(1);
        (max_keys, max_entries)
    }

    fn open_with(
        path: &Path,
        max_keys: usize,
        max_entries: usize,
        config: &StoreConfig,
    ) -> BPlusTreeResult<Self> {
        let mut buffer = BufferManager::open(path, StoreKind::Tree, BLOCK_SIZE, config)?;
        let stored = TreeMeta::read(buffer.meta()?);

        let meta = if stored.max_keys == 0 {
            let meta = TreeMeta {
                root: NULL_POINTER,
                first_leaf: NULL_POINTER,
                len: 0,
                max_keys,
                max_entries,
            };
            meta.write(buffer.meta_mut(None)?);
            meta
        } else if (stored.max_keys, stored.max_entries) != (max_keys, max_entries) {
            return Err(BPlusTreeError::CapacityMismatch {
                expected_keys: max_keys,
                expected_entries: max_entries,
                found_keys: stored.max_keys,
                found_entries: stored.max_entries,
            });
        } else {
            stored
        };

        tracing::debug!(
            path = %path.display(),
            max_keys,
            max_entries,
            len = meta.len,
            "opened B+ tree"
        );

        Ok(Self {
            buffer,
            meta,
            last_found: None,
            _key: PhantomData,
        })
    }

    /// Check if tree is empty
    pub fn is_empty(&self) -> bool {
        self.meta.len == 0
    }

    /// Get number of entries in the tree
    pub fn len(&self) -> usize {
        self.meta.len
    }

    pub fn max_keys(&self) -> usize {
        self.meta.max_keys
    }

    pub fn max_entries(&self) -> usize {
        self.meta.max_entries
    }

    /// The underlying page cache
    pub fn buffer(&self) -> &BufferManager {
        &self.buffer
    }

    /// Get tree height (0 when empty, 1 for a single leaf)
    pub fn height(&mut self) -> BPlusTreeResult<usize> {
        if self.meta.root == NULL_POINTER {
            return Ok(0);
        }

        let mut height = 1;
        let mut current = self.meta.root;
        while let Node::Internal(node) = self.load(current)? {
            current = node.children[0];
            height += 1;
        }
        Ok(height)
    }

    // ========== Node IO ==========

    fn load(&mut self, ptr: Pointer) -> BPlusTreeResult<Node<K, V>> {
        Node::decode(self.buffer.read_node(ptr)?)
    }

    fn load_leaf(&mut self, ptr: Pointer) -> BPlusTreeResult<LeafNode<K, V>> {
        match self.load(ptr)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(BPlusTreeError::InvalidState(format!(
                "expected leaf at {ptr}"
            ))),
        }
    }

    fn load_internal(&mut self, ptr: Pointer) -> BPlusTreeResult<InternalNode<K>> {
        match self.load(ptr)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(BPlusTreeError::InvalidState(format!(
                "expected internal node at {ptr}"
            ))),
        }
    }

    fn store(&mut self, ptr: Pointer, node: &Node<K, V>, ts: Option<Timestamp>) -> BPlusTreeResult<()> {
        node.encode(self.buffer.write_node(ptr, ts)?);
        Ok(())
    }

    fn create(&mut self, node: &Node<K, V>, ts: Option<Timestamp>) -> BPlusTreeResult<Pointer> {
        let (ptr, buf) = self.buffer.add_node(ts)?;
        node.encode(buf);
        Ok(ptr)
    }

    fn save_meta(&mut self, ts: Option<Timestamp>) -> BPlusTreeResult<()> {
        self.meta.write(self.buffer.meta_mut(ts)?);
        Ok(())
    }

    // ========== Search Operations ==========

    /// Check for `key`, remembering its first value for [`find`](Self::find)
    pub fn contains(&mut self, key: &K) -> BPlusTreeResult<bool> {
        self.last_found = self.find_first(key)?;
        Ok(self.last_found.is_some())
    }

    /// Value matched by the last successful `contains`
    pub fn find(&self) -> Option<&V> {
        self.last_found.as_ref()
    }

    /// First value stored under `key` in leaf order
    pub fn find_first(&mut self, key: &K) -> BPlusTreeResult<Option<V>> {
        let Some(mut cursor) = self.seek(key)? else {
            return Ok(None);
        };
        match self.advance(&mut cursor)? {
            Some((k, v)) if &k == key => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// All values stored under `key`, in leaf order
    pub fn multi_find(&mut self, key: &K) -> BPlusTreeResult<Vec<V>> {
        let mut values = Vec::new();
        let Some(mut cursor) = self.seek(key)? else {
            return Ok(values);
        };

        // Duplicates may span several leaves
        while let Some((k, v)) = self.advance(&mut cursor)? {
            if &k != key {
                break;
            }
            values.push(v);
        }
        Ok(values)
    }

    /// Range search: return all entries where lower <= key <= upper
    pub fn range(&mut self, lower: &K, upper: &K) -> BPlusTreeResult<Vec<(K, V)>> {
        let mut results = Vec::new();
        if lower > upper {
            return Ok(results);
        }

        let Some(mut cursor) = self.seek(lower)? else {
            return Ok(results);
        };
        while let Some((k, v)) = self.advance(&mut cursor)? {
            if &k > upper {
                break;
            }
            results.push((k, v));
        }
        Ok(results)
    }

    /// Iterate over all entries in key order
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            cursor: None,
            started: false,
        }
    }

    /// Cursor at the first entry >= `key`, or past the end of the chain
    fn seek(&mut self, key: &K) -> BPlusTreeResult<Option<Cursor<K, V>>> {
        if self.meta.root == NULL_POINTER {
            return Ok(None);
        }

        let mut current = self.meta.root;
        loop {
            match self.load(current)? {
                Node::Internal(node) => current = node.children[node.lower_child(key)],
                Node::Leaf(leaf) => {
                    let pos = leaf.lower_bound(key);
                    return Ok(Some(Cursor { leaf, pos }));
                }
            }
        }
    }

    /// Yield the entry under the cursor and step past it
    fn advance(&mut self, cursor: &mut Cursor<K, V>) -> BPlusTreeResult<Option<(K, V)>> {
        while cursor.pos >= cursor.leaf.len() {
            if cursor.leaf.next == NULL_POINTER {
                return Ok(None);
            }
            cursor.leaf = self.load_leaf(cursor.leaf.next)?;
            cursor.pos = 0;
        }

        let entry = (
            cursor.leaf.keys[cursor.pos].clone(),
            cursor.leaf.values[cursor.pos].clone(),
        );
        cursor.pos += 1;
        Ok(Some(entry))
    }

    // ========== Insert Operations ==========

    /// Insert a key-value pair into the tree
    pub fn insert(&mut self, key: K, value: V) -> BPlusTreeResult<()> {
        self.insert_stamped(key, value, None)
    }

    /// Insert a key-value pair, logging touched blocks under `ts`
    pub fn insert_at(&mut self, key: K, value: V, ts: Timestamp) -> BPlusTreeResult<()> {
        self.insert_stamped(key, value, Some(ts))
    }

    fn insert_stamped(&mut self, key: K, value: V, ts: Option<Timestamp>) -> BPlusTreeResult<()> {
        self.last_found = None;

        if self.meta.root == NULL_POINTER {
            // Create first leaf as root
            let mut leaf = LeafNode::new();
            leaf.insert(key, value);
            let ptr = self.create(&Node::Leaf(leaf), ts)?;
            self.meta.root = ptr;
            self.meta.first_leaf = ptr;
            self.meta.len = 1;
            return self.save_meta(ts);
        }

        let mut path = NodePath::new();
        let mut current = self.meta.root;
        let mut leaf = loop {
            match self.load(current)? {
                Node::Internal(node) => {
                    let idx = node.upper_child(&key);
                    path.push((current, idx));
                    current = node.children[idx];
                }
                Node::Leaf(leaf) => break leaf,
            }
        };

        leaf.insert(key, value);
        self.meta.len += 1;

        if leaf.len() <= self.meta.max_entries {
            self.store(current, &Node::Leaf(leaf), ts)?;
        } else {
            self.split_leaf(current, leaf, path, ts)?;
        }

        self.save_meta(ts)
    }

    /// Split an overflowing leaf node
    fn split_leaf(
        &mut self,
        ptr: Pointer,
        mut leaf: LeafNode<K, V>,
        path: NodePath,
        ts: Option<Timestamp>,
    ) -> BPlusTreeResult<()> {
        let mut right = leaf.split_off(leaf.len().div_ceil(2));
        let separator = right.keys[0].clone();

        // Link the new leaf
        right.next = leaf.next;
        let right_ptr = self.create(&Node::Leaf(right), ts)?;
        leaf.next = right_ptr;
        self.store(ptr, &Node::Leaf(leaf), ts)?;

        tracing::trace!(left = ptr, right = right_ptr, "split leaf");
        self.insert_into_parent(path, ptr, separator, right_ptr, ts)
    }

    /// Insert a new child into the parent after a split, splitting upward
    /// as long as parents overflow
    fn insert_into_parent(
        &mut self,
        mut path: NodePath,
        mut left: Pointer,
        mut separator: K,
        mut right: Pointer,
        ts: Option<Timestamp>,
    ) -> BPlusTreeResult<()> {
        loop {
            let Some((parent_ptr, idx)) = path.pop() else {
                // Split the root - create new root
                let root = InternalNode {
                    keys: vec![separator],
                    children: vec![left, right],
                };
                self.meta.root = self.create(&Node::Internal(root), ts)?;
                return Ok(());
            };

            let mut parent = self.load_internal(parent_ptr)?;
            parent.keys.insert(idx, separator);
            parent.children.insert(idx + 1, right);

            if parent.keys.len() <= self.meta.max_keys {
                return self.store(parent_ptr, &Node::Internal(parent), ts);
            }

            // M + 1 keys: the middle one moves up
            let mid = parent.keys.len() / 2;
            let mut right_keys = parent.keys.split_off(mid);
            let promoted = right_keys.remove(0);
            let right_children = parent.children.split_off(mid + 1);

            let sibling = InternalNode {
                keys: right_keys,
                children: right_children,
            };
            let sibling_ptr = self.create(&Node::Internal(sibling), ts)?;
            self.store(parent_ptr, &Node::Internal(parent), ts)?;
            tracing::trace!(left = parent_ptr, right = sibling_ptr, "split internal node");

            left = parent_ptr;
            separator = promoted;
            right = sibling_ptr;
        }
    }

    // ========== Delete Operations ==========

    /// Delete the first entry with the given key
    /// Returns true if an entry was deleted
    pub fn erase(&mut self, key: &K) -> BPlusTreeResult<bool> {
        self.remove_where(key, |_| true, None)
    }

    /// Delete the first entry with the given key, logging under `ts`
    pub fn erase_at(&mut self, key: &K, ts: Timestamp) -> BPlusTreeResult<bool> {
        self.remove_where(key, |_| true, Some(ts))
    }

    /// Delete a specific key-value pair
    /// Returns true if the entry was found and deleted
    pub fn erase_entry(&mut self, key: &K, value: &V) -> BPlusTreeResult<bool>
    where
        V: PartialEq,
    {
        self.remove_where(key, |v| v == value, None)
    }

    pub fn erase_entry_at(&mut self, key: &K, value: &V, ts: Timestamp) -> BPlusTreeResult<bool>
    where
        V: PartialEq,
    {
        self.remove_where(key, |v| v == value, Some(ts))
    }

    fn remove_where<F>(&mut self, key: &K, mut matches: F, ts: Option<Timestamp>) -> BPlusTreeResult<bool>
    where
        F: FnMut(&V) -> bool,
    {
        self.last_found = None;
        if self.meta.root == NULL_POINTER {
            return Ok(false);
        }

        let mut path = NodePath::new();
        let root = self.meta.root;
        let Some((ptr, mut leaf, idx)) = self.locate(root, key, &mut matches, &mut path)? else {
            return Ok(false);
        };

        leaf.keys.remove(idx);
        leaf.values.remove(idx);
        self.meta.len -= 1;

        self.rebalance_leaf(ptr, leaf, path, ts)?;
        self.save_meta(ts)?;
        Ok(true)
    }

    /// Find the leftmost entry equal to `key` that satisfies `matches`,
    /// recording the path to its leaf
    ///
    /// Equal keys may sit on both sides of a separator, so every child
    /// whose range covers `key` is searched in order.
    fn locate<F>(
        &mut self,
        ptr: Pointer,
        key: &K,
        matches: &mut F,
        path: &mut NodePath,
    ) -> BPlusTreeResult<Option<(Pointer, LeafNode<K, V>, usize)>>
    where
        F: FnMut(&V) -> bool,
    {
        match self.load(ptr)? {
            Node::Leaf(leaf) => {
                let found = (leaf.lower_bound(key)..leaf.upper_bound(key))
                    .find(|&i| matches(&leaf.values[i]));
                Ok(found.map(|i| (ptr, leaf, i)))
            }
            Node::Internal(node) => {
                for idx in node.lower_child(key)..=node.upper_child(key) {
                    path.push((ptr, idx));
                    if let Some(found) = self.locate(node.children[idx], key, matches, path)? {
                        return Ok(Some(found));
                    }
                    path.pop();
                }
                Ok(None)
            }
        }
    }

    /// Write back a leaf after a removal, fixing underflow
    fn rebalance_leaf(
        &mut self,
        ptr: Pointer,
        leaf: LeafNode<K, V>,
        mut path: NodePath,
        ts: Option<Timestamp>,
    ) -> BPlusTreeResult<()> {
        let Some((parent_ptr, idx)) = path.pop() else {
            if leaf.is_empty() {
                // Tree is now empty
                self.buffer.del_node(ptr, ts)?;
                self.meta.root = NULL_POINTER;
                self.meta.first_leaf = NULL_POINTER;
                return Ok(());
            }
            return self.store(ptr, &Node::Leaf(leaf), ts);
        };

        if leaf.len() >= self.meta.max_entries.div_ceil(2) {
            return self.store(ptr, &Node::Leaf(leaf), ts);
        }

        // Pair with the left sibling when there is one
        let mut parent = self.load_internal(parent_ptr)?;
        let sep = if idx > 0 { idx - 1 } else { idx };
        let (left_ptr, mut left, right_ptr, mut right) = if idx > 0 {
            let sibling = parent.children[idx - 1];
            (sibling, self.load_leaf(sibling)?, ptr, leaf)
        } else {
            let sibling = parent.children[idx + 1];
            (ptr, leaf, sibling, self.load_leaf(sibling)?)
        };

        let total = left.len() + right.len();
        if total <= self.meta.max_entries {
            // Merge right into left; the first leaf is never the one freed
            left.keys.append(&mut right.keys);
            left.values.append(&mut right.values);
            left.next = right.next;
            self.store(left_ptr, &Node::Leaf(left), ts)?;
            self.buffer.del_node(right_ptr, ts)?;

            parent.keys.remove(sep);
            parent.children.remove(sep + 1);
            tracing::trace!(left = left_ptr, right = right_ptr, "merged leaves");
            return self.rebalance_internal(parent_ptr, parent, path, ts);
        }

        // Redistribute so both halves meet the minimum
        let target = total / 2;
        if left.len() > target {
            let mut keys = left.keys.split_off(target);
            let mut values = left.values.split_off(target);
            keys.append(&mut right.keys);
            values.append(&mut right.values);
            right.keys = keys;
            right.values = values;
        } else {
            let take = target - left.len();
            let keys = right.keys.split_off(take);
            let values = right.values.split_off(take);
            left.keys.append(&mut right.keys);
            left.values.append(&mut right.values);
            right.keys = keys;
            right.values = values;
        }

        parent.keys[sep] = right.keys[0].clone();
        self.store(left_ptr, &Node::Leaf(left), ts)?;
        self.store(right_ptr, &Node::Leaf(right), ts)?;
        self.store(parent_ptr, &Node::Internal(parent), ts)
    }

    /// Write back an internal node that lost a child, fixing underflow
    /// and shrinking the tree when the root is left with one child
    fn rebalance_internal(
        &mut self,
        ptr: Pointer,
        node: InternalNode<K>,
        mut path: NodePath,
        ts: Option<Timestamp>,
    ) -> BPlusTreeResult<()> {
        let Some((parent_ptr, idx)) = path.pop() else {
            if node.children.len() == 1 {
                self.buffer.del_node(ptr, ts)?;
                self.meta.root = node.children[0];
                tracing::trace!(root = self.meta.root, "collapsed root");
                return Ok(());
            }
            return self.store(ptr, &Node::Internal(node), ts);
        };

        if node.children.len() >= self.meta.max_keys.div_ceil(2) {
            return self.store(ptr, &Node::Internal(node), ts);
        }

        let mut parent = self.load_internal(parent_ptr)?;
        let sep = if idx > 0 { idx - 1 } else { idx };
        let (left_ptr, mut left, right_ptr, mut right) = if idx > 0 {
            let sibling = parent.children[idx - 1];
            (sibling, self.load_internal(sibling)?, ptr, node)
        } else {
            let sibling = parent.children[idx + 1];
            (ptr, node, sibling, self.load_internal(sibling)?)
        };
        let separator = parent.keys[sep].clone();

        if left.children.len() + right.children.len() <= self.meta.max_keys + 1 {
            // Merge, pulling the separator down between the halves
            left.keys.push(separator);
            left.keys.append(&mut right.keys);
            left.children.append(&mut right.children);
            self.store(left_ptr, &Node::Internal(left), ts)?;
            self.buffer.del_node(right_ptr, ts)?;

            parent.keys.remove(sep);
            parent.children.remove(sep + 1);
            tracing::trace!(left = left_ptr, right = right_ptr, "merged internal nodes");
            return self.rebalance_internal(parent_ptr, parent, path, ts);
        }

        // Pool both halves around the separator and split evenly by children
        let mut keys = left.keys;
        keys.push(separator);
        keys.append(&mut right.keys);
        let mut children = left.children;
        children.append(&mut right.children);

        let split = children.len() / 2;
        let right_children = children.split_off(split);
        let mut right_keys = keys.split_off(split - 1);
        parent.keys[sep] = right_keys.remove(0);

        let left = InternalNode { keys, children };
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        self.store(left_ptr, &Node::Internal(left), ts)?;
        self.store(right_ptr, &Node::Internal(right), ts)?;
        self.store(parent_ptr, &Node::Internal(parent), ts)
    }

    // ========== Maintenance ==========

    /// Remove every entry and release all nodes
    pub fn clear(&mut self) -> BPlusTreeResult<()> {
        self.buffer.reset()?;
        self.meta.root = NULL_POINTER;
        self.meta.first_leaf = NULL_POINTER;
        self.meta.len = 0;
        self.last_found = None;
        self.save_meta(None)?;

        tracing::debug!(path = %self.buffer.path().display(), "cleared B+ tree");
        Ok(())
    }

    /// Undo every mutation stamped `ts` or later
    pub fn roll_back(&mut self, ts: Timestamp) -> BPlusTreeResult<usize> {
        let undone = self.buffer.roll_back(ts)?;
        self.meta = TreeMeta::read(self.buffer.meta()?);
        self.last_found = None;
        Ok(undone)
    }

    /// Flush every dirty node and close the file
    pub fn close(self) -> BPlusTreeResult<()> {
        self.buffer.close()?;
        Ok(())
    }

    /// Walk the whole tree checking key order, separator bounds, occupancy,
    /// uniform leaf depth, the leaf chain and the entry count
    pub fn validate(&mut self) -> BPlusTreeResult<TreeStats> {
        if self.meta.root == NULL_POINTER {
            if self.meta.len != 0 || self.meta.first_leaf != NULL_POINTER {
                return Err(invalid("empty tree with entries or leaves"));
            }
            return Ok(TreeStats::default());
        }

        let mut walk = Walk::default();
        let root = self.meta.root;
        self.check_node(root, None, None, 1, &mut walk)?;

        if walk.leaves.first().map(|&(ptr, _)| ptr) != Some(self.meta.first_leaf) {
            return Err(invalid("first leaf does not start the chain"));
        }
        for pair in walk.leaves.windows(2) {
            if pair[0].1 != pair[1].0 {
                return Err(invalid(format!("leaf {} links to {}", pair[0].0, pair[0].1)));
            }
        }
        if walk.leaves.last().map(|&(_, next)| next) != Some(NULL_POINTER) {
            return Err(invalid("last leaf has a successor"));
        }
        if walk.stats.entries != self.meta.len {
            return Err(invalid(format!(
                "counted {} entries, header says {}",
                walk.stats.entries, self.meta.len
            )));
        }

        walk.stats.height = walk.leaf_depth.unwrap_or(0);
        Ok(walk.stats)
    }

    fn check_node(
        &mut self,
        ptr: Pointer,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        walk: &mut Walk,
    ) -> BPlusTreeResult<()> {
        let is_root = ptr == self.meta.root;
        let in_bounds =
            |k: &K| lower.is_none_or(|lo| k >= lo) && upper.is_none_or(|hi| k <= hi);

        match self.load(ptr)? {
            Node::Leaf(leaf) => {
                let min = if is_root { 1 } else { self.meta.max_entries.div_ceil(2) };
                if leaf.len() < min || leaf.len() > self.meta.max_entries {
                    return Err(invalid(format!("leaf {ptr} holds {} entries", leaf.len())));
                }
                if !leaf.keys.windows(2).all(|w| w[0] <= w[1]) {
                    return Err(invalid(format!("leaf {ptr} is not sorted")));
                }
                if !leaf.keys.iter().all(in_bounds) {
                    return Err(invalid(format!("leaf {ptr} violates its separators")));
                }
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(invalid(format!("leaf {ptr} at depth {depth}, expected {d}")));
                    }
                    Some(_) => {}
                }

                walk.leaves.push((ptr, leaf.next));
                walk.stats.leaves += 1;
                walk.stats.entries += leaf.len();
            }
            Node::Internal(node) => {
                let min = if is_root { 2 } else { self.meta.max_keys.div_ceil(2) };
                let count = node.children.len();
                if node.keys.len() + 1 != count || count < min || count > self.meta.max_keys + 1 {
                    return Err(invalid(format!("internal node {ptr} has {count} children")));
                }
                if !node.keys.windows(2).all(|w| w[0] <= w[1]) {
                    return Err(invalid(format!("internal node {ptr} is not sorted")));
                }
                if !node.keys.iter().all(in_bounds) {
                    return Err(invalid(format!("internal node {ptr} violates its separators")));
                }

                walk.stats.internal_nodes += 1;
                for (i, &child) in node.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                    let hi = if i == node.keys.len() { upper } else { Some(&node.keys[i]) };
                    self.check_node(child, lo, hi, depth + 1, walk)?;
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> BPlusTreeError {
    BPlusTreeError::InvalidState(message.into())
}

/// Iterator over B+ tree entries in key order
pub struct Iter<'a, K, V> {
    tree: &'a mut BPlusTree<K, V>,
    cursor: Option<Cursor<K, V>>,
    started: bool,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Fixed + Ord + Clone,
    V: Fixed + Clone,
{
    type Item = BPlusTreeResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            let first = self.tree.meta.first_leaf;
            if first == NULL_POINTER {
                return None;
            }
            match self.tree.load_leaf(first) {
                Ok(leaf) => self.cursor = Some(Cursor { leaf, pos: 0 }),
                Err(e) => return Some(Err(e)),
            }
        }

        let cursor = self.cursor.as_mut()?;
        match self.tree.advance(cursor) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.cursor = None;
                None
            }
            Err(e) => {
                self.cursor = None;
                Some(Err(e))
            }
        }
    }
}
