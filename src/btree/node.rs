//! On-block layout of B+ tree nodes
//!
//! ```text
//! 0       tag (0 = internal, 1 = leaf)
//! 4..8    entry count (separator keys or leaf entries)
//! 8..16   next leaf (leaves only, -1 = last)
//! 16..    internal: child0, then (key, child) pairs
//!         leaf:     (key, value) pairs
//! ```

use crate::codec::Fixed;
use crate::file::{NULL_POINTER, Pointer};

use super::error::{BPlusTreeError, BPlusTreeResult};

const TAG_INTERNAL: u8 = 0;
const TAG_LEAF: u8 = 1;

/// Fixed bytes in front of the entries of every node
pub const NODE_HEADER_SIZE: usize = 16;

/// Internal node: `keys.len() + 1 == children.len()`
///
/// Keys in `children[i]` lie in `[keys[i - 1], keys[i]]`; both ends are
/// inclusive because duplicates may straddle a separator.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<Pointer>,
}

impl<K: Ord> InternalNode<K> {
    /// Child to descend into when inserting `key`: after every separator
    /// equal to it
    pub fn upper_child(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Leftmost child that may hold `key`
    pub fn lower_child(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }
}

/// Leaf node: sorted entries plus a link to the next leaf
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub next: Pointer,
}

impl<K: Ord, V> LeafNode<K, V> {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next: NULL_POINTER,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Index of the first entry >= `key`
    pub fn lower_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// Index of the first entry > `key`
    pub fn upper_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Insert after any existing entries with an equal key
    pub fn insert(&mut self, key: K, value: V) {
        let pos = self.upper_bound(&key);
        self.keys.insert(pos, key);
        self.values.insert(pos, value);
    }

    /// Move the entries from `at` onward into a new leaf
    pub fn split_off(&mut self, at: usize) -> Self {
        Self {
            keys: self.keys.split_off(at),
            values: self.values.split_off(at),
            next: NULL_POINTER,
        }
    }
}

impl<K: Ord, V> Default for LeafNode<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node<K, V> {
    Internal(InternalNode<K>),
    Leaf(LeafNode<K, V>),
}

impl<K: Fixed, V: Fixed> Node<K, V> {
    /// Decode a node from its block image
    pub fn decode(buf: &[u8]) -> BPlusTreeResult<Self> {
        let count = u32::decode(&buf[4..8]) as usize;
        let mut offset = NODE_HEADER_SIZE;

        match buf[0] {
            TAG_INTERNAL => {
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                children.push(Pointer::decode(&buf[offset..]));
                offset += Pointer::SIZE;
                for _ in 0..count {
                    keys.push(K::decode(&buf[offset..]));
                    offset += K::SIZE;
                    children.push(Pointer::decode(&buf[offset..]));
                    offset += Pointer::SIZE;
                }
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            TAG_LEAF => {
                let next = Pointer::decode(&buf[8..16]);
                let mut keys = Vec::with_capacity(count);
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(K::decode(&buf[offset..]));
                    offset += K::SIZE;
                    values.push(V::decode(&buf[offset..]));
                    offset += V::SIZE;
                }
                Ok(Node::Leaf(LeafNode { keys, values, next }))
            }
            tag => Err(BPlusTreeError::InvalidState(format!(
                "unknown node tag {tag}"
            ))),
        }
    }

    /// Write the node into a block image
    pub fn encode(&self, buf: &mut [u8]) {
        let mut offset = NODE_HEADER_SIZE;
        buf[1..4].fill(0);

        match self {
            Node::Internal(node) => {
                buf[0] = TAG_INTERNAL;
                (node.keys.len() as u32).encode(&mut buf[4..8]);
                NULL_POINTER.encode(&mut buf[8..16]);
                node.children[0].encode(&mut buf[offset..]);
                offset += Pointer::SIZE;
                for (key, child) in node.keys.iter().zip(&node.children[1..]) {
                    key.encode(&mut buf[offset..]);
                    offset += K::SIZE;
                    child.encode(&mut buf[offset..]);
                    offset += Pointer::SIZE;
                }
            }
            Node::Leaf(leaf) => {
                buf[0] = TAG_LEAF;
                (leaf.keys.len() as u32).encode(&mut buf[4..8]);
                leaf.next.encode(&mut buf[8..16]);
                for (key, value) in leaf.keys.iter().zip(&leaf.values) {
                    key.encode(&mut buf[offset..]);
                    offset += K::SIZE;
                    value.encode(&mut buf[offset..]);
                    offset += V::SIZE;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_insert_keeps_duplicates_in_order() {
        let mut leaf = LeafNode::new();
        leaf.insert(5i64, 'a' as u8);
        leaf.insert(3, 'b' as u8);
        leaf.insert(5, 'c' as u8);
        leaf.insert(4, 'd' as u8);

        assert_eq!(leaf.keys, vec![3, 4, 5, 5]);
        assert_eq!(leaf.values, b"bdac".to_vec());
        assert_eq!(leaf.lower_bound(&5), 2);
        assert_eq!(leaf.upper_bound(&5), 4);
    }

    #[test]
    fn test_child_selection() {
        let node = InternalNode {
            keys: vec![10i64, 20, 20, 30],
            children: vec![100, 200, 300, 400, 500],
        };

        assert_eq!(node.upper_child(&5), 0);
        assert_eq!(node.upper_child(&10), 1);
        assert_eq!(node.upper_child(&20), 3);
        assert_eq!(node.upper_child(&35), 4);

        assert_eq!(node.lower_child(&10), 0);
        assert_eq!(node.lower_child(&20), 1);
        assert_eq!(node.lower_child(&25), 3);
    }

    #[test]
    fn test_leaf_split_off() {
        let mut leaf = LeafNode::new();
        for i in 0..5i64 {
            leaf.insert(i, i as u32);
        }
        leaf.next = 4096;

        let right = leaf.split_off(3);
        assert_eq!(leaf.keys, vec![0, 1, 2]);
        assert_eq!(right.keys, vec![3, 4]);
        assert_eq!(right.values, vec![3, 4]);
        assert_eq!(right.next, NULL_POINTER);
        assert_eq!(leaf.next, 4096);
    }

    #[test]
    fn test_internal_encode_decode() {
        let node: Node<i32, u64> = Node::Internal(InternalNode {
            keys: vec![-7, 12],
            children: vec![64, 128, 192],
        });
        let mut buf = vec![0xAAu8; 128];
        node.encode(&mut buf);

        assert_eq!(buf[0], TAG_INTERNAL);
        assert_eq!(u32::decode(&buf[4..8]), 2);
        assert_eq!(Node::<i32, u64>::decode(&buf).unwrap(), node);
    }

    #[test]
    fn test_leaf_encode_decode() {
        let mut leaf = LeafNode::new();
        leaf.insert(2u16, (9i64, true));
        leaf.insert(1, (-4, false));
        leaf.next = 320;
        let node = Node::Leaf(leaf);

        let mut buf = vec![0u8; 64];
        node.encode(&mut buf);
        assert_eq!(buf[0], TAG_LEAF);
        assert_eq!(i64::decode(&buf[8..16]), 320);
        assert_eq!(Node::<u16, (i64, bool)>::decode(&buf).unwrap(), node);
    }

    #[test]
    fn test_decode_unknown_tag() {
        let mut buf = vec![0u8; 64];
        buf[0] = 7;
        assert!(matches!(
            Node::<i64, i64>::decode(&buf),
            Err(BPlusTreeError::InvalidState(_))
        ));
    }
}
