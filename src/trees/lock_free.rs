//! Fully lock-free prefix tree: CAS-retry loops, no blocking.
//!
//! Every structural mutation in [`LockFreePrefixTree`] is a compare-and-swap
//! retried until it succeeds or until another thread has already done the
//! equivalent work. Some thread always makes progress under contention
//! (lock-freedom), though an individual thread's CAS loop can in principle
//! retry indefinitely — a liveness caveat, not a correctness bug.
//!
//! # Hash growth: freeze and copy
//!
//! Growing a node's hash table while other threads insert into it is the
//! delicate part. The protocol:
//!
//! 1. *Freeze* the current table: CAS every empty slot from null to a frozen
//!    sentinel. A freeze CAS that loses to a real concurrent insertion is
//!    accepted as-is — the entry that won the slot is preserved, not
//!    overwritten. After this pass no further insertion can land in the old
//!    table.
//! 2. Copy every live entry into a fresh table of double capacity with plain
//!    stores; the fresh table is unpublished, so no synchronization is
//!    needed yet.
//! 3. CAS the node's children reference from the old table to the new one.
//!    Losing this CAS means another thread completed an equivalent grow; the
//!    fresh table is discarded.
//!
//! Any thread that observes the frozen sentinel while probing helps finish
//! the grow and then retries from the node's (now updated) children
//! reference.
//!
//! Superseded tables are not freed immediately — racing readers may still be
//! probing them. Each node keeps them on an intrusive retired list, freed
//! when the tree is dropped.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

use crate::error::Result;
use crate::trees::{check_key, hash_key, INITIAL_LINEAR_SIZE, MAX_LINEAR_SIZE};

/// Initial hash-table capacity for the lock-free variant.
///
/// Chosen above [`MAX_HASH_SKIPS`] so the skip trigger always fires before a
/// probe could wrap all the way around the table.
const INITIAL_HASH_SIZE: usize = 12;

/// Number of consecutive occupied non-matching probes tolerated before the
/// table is grown.
const MAX_HASH_SKIPS: usize = 10;

/// A lock-free concurrent prefix tree of counters.
///
/// All operations take `&self` and are safe to call from any number of
/// threads; share the tree with `Arc`.
///
/// # Examples
///
/// ```rust
/// use alberi::trees::lock_free::LockFreePrefixTree;
/// use std::sync::Arc;
/// use std::thread;
///
/// let tree = Arc::new(LockFreePrefixTree::new());
/// let mut handles = vec![];
///
/// for _ in 0..4 {
///     let t = Arc::clone(&tree);
///     handles.push(thread::spawn(move || {
///         // Every thread resolves the same path to the same node.
///         t.root().at(1)?.at(2)?.inc_value();
///         Ok::<(), alberi::error::TreeError>(())
///     }));
/// }
/// for h in handles {
///     h.join().unwrap().unwrap();
/// }
///
/// assert_eq!(tree.root().at(1)?.at(2)?.value(), 4);
/// # Ok::<(), alberi::error::TreeError>(())
/// ```
pub struct LockFreePrefixTree {
    root: *mut Node,
}

// The tree owns every node and every current or retired children table; all
// shared mutation goes through atomics. Raw pointers block the auto impls.
unsafe impl Send for LockFreePrefixTree {}
unsafe impl Sync for LockFreePrefixTree {}

impl LockFreePrefixTree {
    /// Creates an empty tree containing only the root node.
    pub fn new() -> Self {
        LockFreePrefixTree {
            root: Node::alloc(0),
        }
    }

    /// Returns the root node.
    pub fn root(&self) -> &Node {
        unsafe { &*self.root }
    }
}

impl Default for LockFreePrefixTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockFreePrefixTree {
    fn drop(&mut self) {
        // &mut self: no concurrent operations remain.
        unsafe { drop_subtree(self.root) }
    }
}

/// Children representation tag. Empty is a null children pointer.
enum Kind {
    Linear,
    Hash,
}

/// A children array: linear or open-addressed, only ever gaining entries.
struct Children {
    kind: Kind,
    slots: Box<[AtomicPtr<Node>]>,
    /// Intrusive link for the owning node's retired list. Written once by
    /// the thread that retires this table, before publication of the link.
    next_retired: AtomicPtr<Children>,
}

impl Children {
    fn alloc(kind: Kind, capacity: usize) -> *mut Children {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Children {
            kind,
            slots,
            next_retired: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// One point in key-sequence space, holding an atomic `i64` accumulator.
#[derive(Debug)]
pub struct Node {
    key: u64,
    value: AtomicI64,
    /// Current children table; null means no children yet.
    children: AtomicPtr<Children>,
    /// Push-only stack of superseded children tables, freed on tree drop.
    retired: AtomicPtr<Children>,
}

/// Sentinel marking a slot as frozen during hash growth. Identified by
/// address; never dereferenced as a live child.
static FROZEN: Node = Node {
    key: 0,
    value: AtomicI64::new(0),
    children: AtomicPtr::new(ptr::null_mut()),
    retired: AtomicPtr::new(ptr::null_mut()),
};

#[inline]
fn frozen() -> *mut Node {
    &FROZEN as *const Node as *mut Node
}

impl Node {
    fn alloc(key: u64) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            value: AtomicI64::new(0),
            children: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Returns the child for `key`, creating it if absent.
    ///
    /// Concurrent calls with the same key from any number of threads all
    /// return the same node.
    ///
    /// # Errors
    ///
    /// Fails with [`TreeError::ReservedKey`](crate::error::TreeError) when
    /// `key` is `0`.
    pub fn at(&self, key: u64) -> Result<&Node> {
        check_key(key)?;
        Ok(self.get_or_add(key))
    }

    /// Returns the current accumulator value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Overwrites the accumulator value.
    pub fn set_value(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Atomically increments the accumulator, returning the incremented
    /// value. Concurrent increments never lose updates.
    pub fn inc_value(&self) -> i64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Visits this node's value, then every present child, depth first.
    ///
    /// The traversal reads an unsynchronized snapshot of each children
    /// table: children inserted concurrently after the snapshot may be
    /// missed. Children are visited in arbitrary order.
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
        consume_value(context, self.value());
        let table = self.children.load(Ordering::Acquire);
        if table.is_null() {
            return;
        }
        let table = unsafe { &*table };
        for slot in table.slots.iter() {
            let child = slot.load(Ordering::Acquire);
            if child.is_null() || child == frozen() {
                continue;
            }
            let child = unsafe { &*child };
            let child_context = create_context(context, child.key);
            child.walk(&child_context, create_context, consume_value);
        }
    }

    fn get_or_add(&self, key: u64) -> &Node {
        loop {
            let table_ptr = self.children.load(Ordering::Acquire);
            if table_ptr.is_null() {
                if let Some(child) = self.install_first_child(key) {
                    return child;
                }
                continue;
            }
            let table = unsafe { &*table_ptr };
            let found = match table.kind {
                Kind::Linear => self.linear_get_or_add(table_ptr, table, key),
                Kind::Hash => self.hash_get_or_add(table_ptr, table, key),
            };
            match found {
                Some(child) => return child,
                // The table was grown or replaced under us; retry against
                // the node's current children reference.
                None => continue,
            }
        }
    }

    /// Transition from Empty: publish a fresh linear table whose first slot
    /// holds the new child. Returns `None` when another thread published a
    /// table first.
    fn install_first_child(&self, key: u64) -> Option<&Node> {
        let child = Node::alloc(key);
        let table = Children::alloc(Kind::Linear, INITIAL_LINEAR_SIZE);
        unsafe { (*table).slots[0].store(child, Ordering::Relaxed) };
        match self.children.compare_exchange(
            ptr::null_mut(),
            table,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(unsafe { &*child }),
            Err(_) => {
                unsafe {
                    drop(Box::from_raw(table));
                    drop(Box::from_raw(child));
                }
                None
            }
        }
    }

    /// Lookup-or-insert against a linear table. Returns `None` after
    /// triggering growth on a full table.
    fn linear_get_or_add(&self, table_ptr: *mut Children, table: &Children, key: u64) -> Option<&Node> {
        let mut index = 0;
        while index < table.slots.len() {
            let occupant = table.slots[index].load(Ordering::Acquire);
            if occupant.is_null() {
                let fresh = Node::alloc(key);
                match table.slots[index].compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(unsafe { &*fresh }),
                    Err(winner) => {
                        unsafe { drop(Box::from_raw(fresh)) };
                        let winner = unsafe { &*winner };
                        if winner.key == key {
                            return Some(winner);
                        }
                        // A different key claimed this slot; keep scanning
                        // from the slot after the failure point.
                        index += 1;
                        continue;
                    }
                }
            }
            let occupant = unsafe { &*occupant };
            if occupant.key == key {
                return Some(occupant);
            }
            index += 1;
        }
        // Full: every slot is occupied and immutable, so a plain copy into
        // the replacement table cannot lose entries.
        self.grow_linear(table_ptr, table);
        None
    }

    /// Replaces a full linear table with a doubled linear table, or converts
    /// it to hash mode once it is at the max linear size.
    fn grow_linear(&self, old_ptr: *mut Children, old: &Children) {
        let new_ptr = if old.slots.len() < MAX_LINEAR_SIZE {
            let doubled = Children::alloc(Kind::Linear, old.slots.len() * 2);
            for (index, slot) in old.slots.iter().enumerate() {
                let child = slot.load(Ordering::Acquire);
                unsafe { (*doubled).slots[index].store(child, Ordering::Relaxed) };
            }
            doubled
        } else {
            let converted = Children::alloc(Kind::Hash, INITIAL_HASH_SIZE);
            for slot in old.slots.iter() {
                let child = slot.load(Ordering::Acquire);
                unsafe { insert_unpublished(&*converted, child) };
            }
            converted
        };
        self.publish_table(old_ptr, new_ptr);
    }

    /// Lookup-or-insert against a hash table. Returns `None` after observing
    /// a frozen slot (helping the in-flight grow first) or after triggering
    /// growth via the skip count.
    fn hash_get_or_add(&self, table_ptr: *mut Children, table: &Children, key: u64) -> Option<&Node> {
        let capacity = table.slots.len();
        let mut index = hash_key(key) % capacity;
        let mut skips = 0;
        loop {
            let occupant = table.slots[index].load(Ordering::Acquire);
            if occupant == frozen() {
                self.grow_hash(table_ptr, table);
                return None;
            }
            if occupant.is_null() {
                let fresh = Node::alloc(key);
                match table.slots[index].compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(unsafe { &*fresh }),
                    Err(winner) => {
                        unsafe { drop(Box::from_raw(fresh)) };
                        if winner == frozen() {
                            self.grow_hash(table_ptr, table);
                            return None;
                        }
                        let winner = unsafe { &*winner };
                        if winner.key == key {
                            return Some(winner);
                        }
                        // Fall through: this probe now counts as a skip.
                    }
                }
            } else {
                let occupant = unsafe { &*occupant };
                if occupant.key == key {
                    return Some(occupant);
                }
            }
            skips += 1;
            if skips > MAX_HASH_SKIPS {
                self.grow_hash(table_ptr, table);
                return None;
            }
            index += 1;
            if index == capacity {
                index = 0;
            }
        }
    }

    /// Freeze-and-copy growth of a hash table. Safe to call from any number
    /// of threads concurrently; exactly one publishes its copy.
    fn grow_hash(&self, old_ptr: *mut Children, old: &Children) {
        // Freeze: claim every empty slot for the sentinel. A lost CAS means
        // a real insertion won the slot; that entry is preserved as-is.
        for slot in old.slots.iter() {
            let _ = slot.compare_exchange(
                ptr::null_mut(),
                frozen(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        // Every slot is now either a live entry or frozen; no insertion can
        // land in the old table anymore.
        let grown = Children::alloc(Kind::Hash, old.slots.len() * 2);
        for slot in old.slots.iter() {
            let child = slot.load(Ordering::Acquire);
            if !child.is_null() && child != frozen() {
                unsafe { insert_unpublished(&*grown, child) };
            }
        }
        self.publish_table(old_ptr, grown);
    }

    /// CAS the children reference from `old_ptr` to `new_ptr`. The winner
    /// retires the old table; a loser discards its unpublished copy, since
    /// the observable effect — a larger, populated table — already exists.
    fn publish_table(&self, old_ptr: *mut Children, new_ptr: *mut Children) {
        match self
            .children
            .compare_exchange(old_ptr, new_ptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.retire(old_ptr),
            Err(_) => unsafe { drop(Box::from_raw(new_ptr)) },
        }
    }

    /// Pushes a superseded table onto this node's retired list. Racing
    /// readers may still probe the table, so it stays allocated until the
    /// tree is dropped. Same CAS loop as the pool's Treiber stack.
    fn retire(&self, table: *mut Children) {
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            unsafe { (*table).next_retired.store(head, Ordering::Relaxed) };
            match self.retired.compare_exchange_weak(
                head,
                table,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

/// Open-addressed insertion into a table that is not yet published, so plain
/// stores suffice. The caller guarantees capacity exceeds the entry count.
unsafe fn insert_unpublished(table: &Children, child: *mut Node) {
    let capacity = table.slots.len();
    let mut index = hash_key((*child).key) % capacity;
    while !table.slots[index].load(Ordering::Relaxed).is_null() {
        index += 1;
        if index == capacity {
            index = 0;
        }
    }
    table.slots[index].store(child, Ordering::Relaxed);
}

/// Frees a node, its children tables (current and retired), and every child
/// node beneath it. Only called from `Drop` with exclusive access.
unsafe fn drop_subtree(node: *mut Node) {
    let node = Box::from_raw(node);
    let table = node.children.load(Ordering::Relaxed);
    if !table.is_null() {
        let table = Box::from_raw(table);
        for slot in table.slots.iter() {
            let child = slot.load(Ordering::Relaxed);
            if !child.is_null() && child != frozen() {
                drop_subtree(child);
            }
        }
    }
    // Retired tables hold pointers to nodes owned by the live table; free
    // only the arrays themselves.
    let mut retired = node.retired.load(Ordering::Relaxed);
    while !retired.is_null() {
        let table = Box::from_raw(retired);
        retired = table.next_retired.load(Ordering::Relaxed);
    }
}
