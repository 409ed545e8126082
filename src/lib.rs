//! # Alberi - Concurrent Prefix-Tree Counters
//!
//! A Rust library providing thread-safe prefix trees of counters, keyed by
//! sequences of non-zero `u64` values (for example call-stack frame
//! identities), optimized for aggregating samples from many threads with
//! minimal contention — the data-structure core of a sampling profiler or
//! telemetry aggregator.
//!
//! ## The Problem
//!
//! Aggregating per-path counters concurrently usually means a map behind a
//! lock: every sample takes the lock, every hot path becomes a convoy. What
//! a sampler actually needs is much weaker — counters only ever gain
//! entries, nothing is ever removed, and nobody needs a globally consistent
//! snapshot while sampling is running.
//!
//! ## The Solution
//!
//! This library exploits that weakness with a single structural invariant:
//! **a published (key, child) entry is never overwritten or removed** —
//! children arrays only grow and only gain entries. That one property makes
//! both lock-free CAS publication and optimistic seqlock reads safe without
//! any further coordination, and it is enforced identically by all three
//! tree variants:
//!
//! | Type | Module | Concurrency discipline |
//! |------|--------|------------------------|
//! | [`SequentialPrefixTree`](trees::sequential::SequentialPrefixTree) | [`trees::sequential`] | none — single-threaded reference |
//! | [`LockFreePrefixTree`](trees::lock_free::LockFreePrefixTree) | [`trees::lock_free`] | CAS-retry on slots, freeze-and-copy hash growth |
//! | [`SeqLockPrefixTree`](trees::seq_lock::SeqLockPrefixTree) | [`trees::seq_lock`] | seqlock fast-path reads, per-node monitor writes |
//!
//! A fourth component, [`LockFreePool`](pool::LockFreePool), is a
//! general-purpose MPMC object pool built on a Treiber stack — the same
//! CAS-retry pattern the lock-free tree uses, packaged standalone.
//!
//! ## Quick Start
//!
//! ```rust
//! use alberi::trees::lock_free::LockFreePrefixTree;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let tree = Arc::new(LockFreePrefixTree::new());
//!
//! // Sampling threads record key sequences; same path, same node.
//! let mut handles = vec![];
//! for _ in 0..4 {
//!     let t = Arc::clone(&tree);
//!     handles.push(thread::spawn(move || {
//!         t.root().at(17)?.at(42)?.inc_value();
//!         Ok::<(), alberi::error::TreeError>(())
//!     }));
//! }
//! for h in handles {
//!     h.join().unwrap().unwrap();
//! }
//!
//! // Aggregate afterwards with a top-down traversal.
//! let mut total = 0;
//! tree.root().top_down((), |_, _| (), |_, value| total += value);
//! assert_eq!(total, 4);
//! ```
//!
//! ## Guarantees and Caveats
//!
//! - Resolving the same key sequence from any number of threads yields the
//!   same node; `at()` is idempotent under arbitrary interleaving.
//! - Counter updates ([`inc_value`](trees::lock_free::Node::inc_value),
//!   `set_value`) are single hardware atomics and never lose updates.
//! - Structural mutations on one node are linearizable with each other;
//!   operations on different nodes are unordered.
//! - `LockFreePrefixTree` and `LockFreePool` are lock-free, not wait-free:
//!   a thread's CAS loop can in principle retry indefinitely under
//!   sustained contention.
//! - `top_down` on the lock-free tree reads an unsynchronized snapshot and
//!   may miss concurrently created nodes — the right trade-off for
//!   approximate aggregation, not for strict consistency.
//! - Key `0` is reserved; `at(0)` returns an error on every variant.
//! - Nodes are never destroyed individually; a tree releases all of its
//!   memory at once when dropped.

pub mod error;
pub mod pool;
pub mod trees;
