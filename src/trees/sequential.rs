//! Single-threaded reference implementation of the growth policy.
//!
//! [`SequentialPrefixTree`] executes the shared growth policy with plain
//! owned data and `&mut` access: no atomics, no retry loops. It defines the
//! ground-truth structural semantics that the concurrent variants must
//! preserve under any interleaving, and doubles as the fast option when a
//! tree is only ever touched by one thread.
//!
//! Unlike the lock-free variant, hash growth here triggers on a load-factor
//! threshold (occupancy above half the capacity) checked at insertion time,
//! so a probe never runs out of empty slots.

use crate::error::Result;
use crate::trees::{check_key, hash_key, INITIAL_LINEAR_SIZE, MAX_LINEAR_SIZE};

/// Initial hash-table capacity for the sequential variant.
const INITIAL_HASH_SIZE: usize = 16;

/// A single-threaded prefix tree of counters.
///
/// Structural access goes through [`root_mut`](Self::root_mut); read-only
/// traversal through [`root`](Self::root).
///
/// # Examples
///
/// ```rust
/// use alberi::trees::sequential::SequentialPrefixTree;
///
/// let mut tree = SequentialPrefixTree::new();
///
/// // Count two samples for the key sequence [12, 34].
/// tree.root_mut().at(12)?.at(34)?.inc_value();
/// tree.root_mut().at(12)?.at(34)?.inc_value();
///
/// assert_eq!(tree.root_mut().at(12)?.at(34)?.value(), 2);
/// # Ok::<(), alberi::error::TreeError>(())
/// ```
pub struct SequentialPrefixTree {
    root: Node,
}

impl SequentialPrefixTree {
    /// Creates an empty tree containing only the root node.
    pub fn new() -> Self {
        SequentialPrefixTree { root: Node::new(0) }
    }

    /// Returns the root node for read-only traversal.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Returns the root node; `at()` requires `&mut` access.
    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }
}

impl Default for SequentialPrefixTree {
    fn default() -> Self {
        Self::new()
    }
}

/// One point in key-sequence space, holding an `i64` accumulator.
#[derive(Debug)]
pub struct Node {
    key: u64,
    value: i64,
    children: Children,
}

/// Children representation, selected purely by count.
#[derive(Debug)]
enum Children {
    Empty,
    Linear(Vec<Box<Node>>),
    Hash(HashSlots),
}

impl Default for Children {
    fn default() -> Self {
        Children::Empty
    }
}

/// Open-addressed table of child nodes. `None` marks an empty slot.
#[derive(Debug)]
struct HashSlots {
    slots: Vec<Option<Box<Node>>>,
    occupied: usize,
}

impl HashSlots {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        HashSlots { slots, occupied: 0 }
    }

    /// Index of the slot holding `key`, if present.
    fn position(&self, key: u64) -> Option<usize> {
        let len = self.slots.len();
        let mut index = hash_key(key) % len;
        loop {
            match &self.slots[index] {
                None => return None,
                Some(child) if child.key == key => return Some(index),
                Some(_) => index = (index + 1) % len,
            }
        }
    }

    /// True when one more entry would push occupancy past one half.
    fn needs_grow(&self) -> bool {
        (self.occupied + 1) * 2 > self.slots.len()
    }

    /// Inserts a child whose key is known to be absent.
    fn insert(&mut self, child: Box<Node>) -> usize {
        let len = self.slots.len();
        let mut index = hash_key(child.key) % len;
        while self.slots[index].is_some() {
            index = (index + 1) % len;
        }
        self.slots[index] = Some(child);
        self.occupied += 1;
        index
    }

    /// Doubles the capacity, reinserting every live entry with the same
    /// hashing and probing rule.
    fn grow(&mut self) {
        let mut grown = HashSlots::with_capacity(self.slots.len() * 2);
        for slot in self.slots.drain(..) {
            if let Some(child) = slot {
                grown.insert(child);
            }
        }
        *self = grown;
    }
}

impl Node {
    fn new(key: u64) -> Self {
        Node {
            key,
            value: 0,
            children: Children::Empty,
        }
    }

    /// Returns the child for `key`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::ReservedKey`](crate::error::TreeError) when
    /// `key` is `0`.
    pub fn at(&mut self, key: u64) -> Result<&mut Node> {
        check_key(key)?;
        if self.find(key).is_none() {
            self.insert_child(key);
        }
        match self.find_mut(key) {
            Some(child) => Ok(child),
            None => unreachable!("child present after insertion"),
        }
    }

    /// Returns the current accumulator value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Overwrites the accumulator value.
    pub fn set_value(&mut self, value: i64) {
        self.value = value;
    }

    /// Increments the accumulator, returning the incremented value.
    pub fn inc_value(&mut self) -> i64 {
        self.value += 1;
        self.value
    }

    /// Visits this node's value, then every child, depth first.
    ///
    /// `create_context` extends the context with each child's key;
    /// `consume_value` observes each visited node's value under the context
    /// built for it. Children are visited in arbitrary order.
    pub fn top_down<C, F, V>(&self, initial: C, mut create_context: F, mut consume_value: V)
    where
        F: FnMut(&C, u64) -> C,
        V: FnMut(&C, i64),
    {
        self.walk(&initial, &mut create_context, &mut consume_value);
    }

    fn walk<C, F, V>(&self, context: &C, create_context: &mut F, consume_value: &mut V)
    where
        F: FnMut(&C, u64) -> C,
        V: FnMut(&C, i64),
    {
        consume_value(context, self.value);
        match &self.children {
            Children::Empty => {}
            Children::Linear(children) => {
                for child in children {
                    let child_context = create_context(context, child.key);
                    child.walk(&child_context, create_context, consume_value);
                }
            }
            Children::Hash(table) => {
                for child in table.slots.iter().flatten() {
                    let child_context = create_context(context, child.key);
                    child.walk(&child_context, create_context, consume_value);
                }
            }
        }
    }

    fn find(&self, key: u64) -> Option<&Node> {
        match &self.children {
            Children::Empty => None,
            Children::Linear(children) => {
                children.iter().find(|c| c.key == key).map(|c| &**c)
            }
            Children::Hash(table) => {
                let index = table.position(key)?;
                table.slots[index].as_deref()
            }
        }
    }

    fn find_mut(&mut self, key: u64) -> Option<&mut Node> {
        match &mut self.children {
            Children::Empty => None,
            Children::Linear(children) => {
                children.iter_mut().find(|c| c.key == key).map(|c| &mut **c)
            }
            Children::Hash(table) => {
                let index = table.position(key)?;
                table.slots[index].as_deref_mut()
            }
        }
    }

    /// Inserts a fresh child for `key` (known absent), growing or converting
    /// the children representation as needed.
    fn insert_child(&mut self, key: u64) {
        let children = std::mem::take(&mut self.children);
        self.children = match children {
            Children::Empty => {
                let mut slots = Vec::with_capacity(INITIAL_LINEAR_SIZE);
                slots.push(Box::new(Node::new(key)));
                Children::Linear(slots)
            }
            Children::Linear(mut slots) if slots.len() < MAX_LINEAR_SIZE => {
                slots.push(Box::new(Node::new(key)));
                Children::Linear(slots)
            }
            Children::Linear(slots) => {
                // Full at max linear size: convert to hash mode.
                let mut table = HashSlots::with_capacity(INITIAL_HASH_SIZE);
                for child in slots {
                    table.insert(child);
                }
                table.insert(Box::new(Node::new(key)));
                Children::Hash(table)
            }
            Children::Hash(mut table) => {
                if table.needs_grow() {
                    table.grow();
                }
                table.insert(Box::new(Node::new(key)));
                Children::Hash(table)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TreeError;

    #[test]
    fn test_at_zero_is_rejected() {
        let mut tree = SequentialPrefixTree::new();
        assert_eq!(tree.root_mut().at(0).unwrap_err(), TreeError::ReservedKey);
    }

    #[test]
    fn test_at_creates_and_finds() {
        let mut tree = SequentialPrefixTree::new();
        tree.root_mut().at(7).unwrap().set_value(42);
        assert_eq!(tree.root_mut().at(7).unwrap().value(), 42);
    }

    #[test]
    fn test_counter_operations() {
        let mut tree = SequentialPrefixTree::new();
        let node = tree.root_mut().at(1).unwrap();
        assert_eq!(node.value(), 0);
        assert_eq!(node.inc_value(), 1);
        assert_eq!(node.inc_value(), 2);
        node.set_value(-5);
        assert_eq!(node.value(), -5);
    }

    #[test]
    fn test_deep_path() {
        let mut tree = SequentialPrefixTree::new();
        tree.root_mut()
            .at(1)
            .unwrap()
            .at(2)
            .unwrap()
            .at(3)
            .unwrap()
            .inc_value();
        let leaf = tree
            .root_mut()
            .at(1)
            .unwrap()
            .at(2)
            .unwrap()
            .at(3)
            .unwrap();
        assert_eq!(leaf.value(), 1);
    }

    #[test]
    fn test_linear_to_hash_conversion() {
        let mut tree = SequentialPrefixTree::new();
        // 7 children exceed the max linear size of 6, forcing hash mode.
        for key in 1..=7u64 {
            tree.root_mut().at(key).unwrap().set_value(key as i64);
        }
        for key in 1..=7u64 {
            assert_eq!(tree.root_mut().at(key).unwrap().value(), key as i64);
        }
    }

    #[test]
    fn test_hash_growth_preserves_entries() {
        let mut tree = SequentialPrefixTree::new();
        // Enough keys to grow the hash table several times past its
        // initial capacity of 16 at load factor 1/2.
        for key in 1..=200u64 {
            tree.root_mut().at(key).unwrap().set_value(key as i64);
        }
        for key in 1..=200u64 {
            assert_eq!(tree.root_mut().at(key).unwrap().value(), key as i64);
        }
    }

    #[test]
    fn test_at_is_idempotent() {
        let mut tree = SequentialPrefixTree::new();
        tree.root_mut().at(5).unwrap().inc_value();
        tree.root_mut().at(5).unwrap().inc_value();
        assert_eq!(tree.root_mut().at(5).unwrap().value(), 2);
    }

    #[test]
    fn test_top_down_visits_every_node() {
        let mut tree = SequentialPrefixTree::new();
        tree.root_mut().at(1).unwrap().set_value(10);
        tree.root_mut().at(1).unwrap().at(2).unwrap().set_value(20);
        tree.root_mut().at(3).unwrap().set_value(30);

        let mut visited = Vec::new();
        tree.root().top_down(
            Vec::new(),
            |path, key| {
                let mut next = path.clone();
                next.push(key);
                next
            },
            |path, value| visited.push((path.clone(), value)),
        );

        visited.sort();
        assert_eq!(
            visited,
            vec![
                (vec![], 0),
                (vec![1], 10),
                (vec![1, 2], 20),
                (vec![3], 30),
            ]
        );
    }
}
