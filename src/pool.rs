//! Lock-free object pool built on a Treiber stack.
//!
//! [`LockFreePool`] is a general-purpose multi-producer/multi-consumer pool:
//! any thread may [`add`](LockFreePool::add) elements, any thread may
//! [`get`](LockFreePool::get) them back. Elements come back in no guaranteed
//! order; the only contract is that every added element becomes eligible to
//! be returned by exactly one future `get`.
//!
//! Both operations are the same CAS-retry loop on a single head pointer that
//! the lock-free tree uses for its structural swaps. Unlike the tree —
//! whose superseded arrays stay allocated until the tree drops — popped
//! links are freed while other threads may still hold pointers to them, the
//! classic ABA / use-after-free hazard of the Treiber stack. Reclamation is
//! therefore deferred through `crossbeam-epoch`: a popped link is destroyed
//! only once no thread can still observe it.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;

/// A lock-free multi-producer/multi-consumer object pool.
///
/// # Examples
///
/// ```rust
/// use alberi::pool::LockFreePool;
///
/// let pool = LockFreePool::new();
/// pool.add("a");
/// pool.add("b");
///
/// let first = pool.get();
/// let second = pool.get();
/// assert!(matches!((first, second), (Some(_), Some(_))));
/// assert_eq!(pool.get(), None);
/// ```
///
/// Multi-threaded usage:
///
/// ```rust
/// use alberi::pool::LockFreePool;
/// use std::sync::Arc;
/// use std::thread;
///
/// let pool = Arc::new(LockFreePool::new());
/// let mut handles = vec![];
/// for t in 0..4 {
///     let p = Arc::clone(&pool);
///     handles.push(thread::spawn(move || {
///         for i in 0..100 {
///             p.add(t * 100 + i);
///         }
///     }));
/// }
/// for h in handles {
///     h.join().unwrap();
/// }
///
/// let mut drained = 0;
/// while pool.get().is_some() {
///     drained += 1;
/// }
/// assert_eq!(drained, 400);
/// ```
pub struct LockFreePool<T> {
    /// Head of the stack; padded, since every operation CASes it.
    head: CachePadded<Atomic<Link<T>>>,
}

struct Link<T> {
    /// Moved out on pop before the link is retired.
    element: ManuallyDrop<T>,
    next: Atomic<Link<T>>,
}

unsafe impl<T: Send> Send for LockFreePool<T> {}
unsafe impl<T: Send> Sync for LockFreePool<T> {}

impl<T> LockFreePool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        LockFreePool {
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Adds an element to the pool.
    ///
    /// The element becomes eligible to be returned by exactly one future
    /// [`get`](Self::get). Adding an equal element twice makes it eligible
    /// to be popped twice.
    pub fn add(&self, element: T) {
        let guard = epoch::pin();
        let mut link = Owned::new(Link {
            element: ManuallyDrop::new(element),
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            link.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                link,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(_) => return,
                Err(failure) => link = failure.new,
            }
        }
    }

    /// Removes and returns some element, or `None` when the pool is empty.
    ///
    /// No ordering is guaranteed between elements added by different
    /// threads.
    pub fn get(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let link = unsafe { head.as_ref() }?;
            let next = link.next.load(Ordering::Acquire, &guard);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                unsafe {
                    // The element moves out; the link itself is reclaimed
                    // once no pinned thread can still reach it.
                    let element = ptr::read(&*link.element);
                    guard.defer_destroy(head);
                    return Some(element);
                }
            }
        }
    }
}

impl<T> Default for LockFreePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreePool<T> {
    fn drop(&mut self) {
        // &mut self: no concurrent operations remain, so the list can be
        // walked and freed directly.
        unsafe {
            let guard = epoch::unprotected();
            let mut link = self.head.load(Ordering::Relaxed, guard);
            while let Some(reference) = link.as_ref() {
                let next = reference.next.load(Ordering::Relaxed, guard);
                let mut owned = link.into_owned();
                ManuallyDrop::drop(&mut owned.element);
                drop(owned);
                link = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_pool_returns_none() {
        let pool: LockFreePool<i32> = LockFreePool::new();
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn test_add_then_get_in_some_order() {
        let pool = LockFreePool::new();
        pool.add('a');
        pool.add('b');
        let mut popped = [pool.get(), pool.get()];
        popped.sort();
        assert_eq!(popped, [Some('a'), Some('b')]);
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn test_duplicate_elements_pop_twice() {
        let pool = LockFreePool::new();
        pool.add(7);
        pool.add(7);
        assert_eq!(pool.get(), Some(7));
        assert_eq!(pool.get(), Some(7));
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn test_drop_releases_remaining_elements() {
        let pool = LockFreePool::new();
        for i in 0..100 {
            pool.add(Box::new(i));
        }
        // Half stay in the pool and are dropped with it.
        for _ in 0..50 {
            pool.get();
        }
        drop(pool);
    }

    #[test]
    fn test_concurrent_add_and_get() {
        let pool = Arc::new(LockFreePool::new());
        let mut handles = vec![];
        for t in 0..4u32 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..250u32 {
                    pool.add(t * 1000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(element) = pool.get() {
            // Exactly-once: no element may come back twice.
            assert!(seen.insert(element));
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let pool = Arc::new(LockFreePool::new());
        let mut producers = vec![];
        for t in 0..2u64 {
            let pool = Arc::clone(&pool);
            producers.push(thread::spawn(move || {
                for i in 0..500u64 {
                    pool.add(t * 10_000 + i);
                }
            }));
        }
        let mut consumers = vec![];
        for _ in 0..2 {
            let pool = Arc::clone(&pool);
            consumers.push(thread::spawn(move || {
                let mut taken = Vec::new();
                for _ in 0..1000 {
                    if let Some(element) = pool.get() {
                        taken.push(element);
                    }
                }
                taken
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        // Whatever the consumers missed is still in the pool.
        while let Some(element) = pool.get() {
            all.push(element);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
