//! Prefix-tree counter variants and their shared growth policy.
//!
//! All three variants store the same structure: a tree keyed by sequences of
//! non-zero `u64` values, where each node carries an `i64` accumulator. They
//! differ only in concurrency discipline:
//!
//! | Variant | Module | Discipline |
//! |---------|--------|------------|
//! | [`SequentialPrefixTree`](sequential::SequentialPrefixTree) | [`sequential`] | single-threaded, `&mut` access |
//! | [`LockFreePrefixTree`](lock_free::LockFreePrefixTree) | [`lock_free`] | CAS-retry loops, freeze-and-copy hash growth |
//! | [`SeqLockPrefixTree`](seq_lock::SeqLockPrefixTree) | [`seq_lock`] | optimistic seqlock reads, monitor-guarded writes |
//!
//! # The growth policy
//!
//! A node's children start *empty*, become a short *linear* array (capacity
//! 3, doubling to at most 6 entries), and convert to an open-addressed *hash*
//! table once the linear array is full. Hash tables double on growth and
//! reinsert every live entry with the same hash and probing rule.
//!
//! ```text
//!   Empty ──first child──► Linear[3] ──full──► Linear[6] ──full──► Hash[N]
//!                                                                    │ grow
//!                                                                    ▼
//!                                                                  Hash[2N]
//! ```
//!
//! Two invariants make the concurrent variants work:
//!
//! 1. **No overwrite**: once a (key, child) pair is published into a children
//!    array it is never overwritten, reassigned, or removed. Arrays only grow
//!    and only gain entries, so a stale array is merely incomplete — never
//!    wrong.
//! 2. **Key 0 is reserved**: it is the root's own key and the empty-slot
//!    sentinel in the hash tables. `at(0)` fails with
//!    [`TreeError::ReservedKey`](crate::error::TreeError::ReservedKey) on
//!    every variant.
//!
//! The hash function is identical across variants so that structural layouts
//! stay comparable between the sequential baseline and the concurrent trees.

pub mod lock_free;
pub mod seq_lock;
pub mod sequential;

use crate::error::{Result, TreeError};

/// Initial capacity of a node's linear children array.
pub(crate) const INITIAL_LINEAR_SIZE: usize = 3;

/// Maximum capacity of a linear children array; one more entry converts the
/// node to hash mode.
pub(crate) const MAX_LINEAR_SIZE: usize = 6;

/// Multiplicative scramble constant used by the child hash.
const SCRAMBLE: u64 = 0x9e37_75cd_9e37_75cd;

/// Hashes a child key into a 31-bit bucket value.
///
/// The byte reversal between the two multiplications spreads entropy from
/// the high half of the first product back into the low bits, which is where
/// `% capacity` looks. The result is masked to 31 bits so it stays positive
/// under any index arithmetic.
#[inline]
pub(crate) fn hash_key(key: u64) -> usize {
    let h = key
        .wrapping_mul(SCRAMBLE)
        .swap_bytes()
        .wrapping_mul(SCRAMBLE);
    let folded = ((h >> 32) as u32) ^ (h as u32);
    (folded & 0x7fff_ffff) as usize
}

/// Rejects the reserved key `0`.
#[inline]
pub(crate) fn check_key(key: u64) -> Result<()> {
    if key == 0 {
        Err(TreeError::ReservedKey)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        for key in 1..1000u64 {
            assert_eq!(hash_key(key), hash_key(key));
        }
    }

    #[test]
    fn test_hash_fits_31_bits() {
        for key in [1, 2, u64::MAX, 0x8000_0000_0000_0000, 12345678901234567] {
            assert!(hash_key(key) <= 0x7fff_ffff);
        }
    }

    #[test]
    fn test_hash_spreads_sequential_keys() {
        // Sequential keys should not all collide in a small table.
        let mut buckets = std::collections::HashSet::new();
        for key in 1..=16u64 {
            buckets.insert(hash_key(key) % 16);
        }
        assert!(buckets.len() > 4);
    }

    #[test]
    fn test_check_key_rejects_zero() {
        assert_eq!(check_key(0), Err(TreeError::ReservedKey));
        assert_eq!(check_key(1), Ok(()));
        assert_eq!(check_key(u64::MAX), Ok(()));
    }
}
