//! Unified error type for all tree variants.
//!
//! This module provides a single [`TreeError`] type shared by every tree
//! variant. The trees have exactly one observable failure mode — asking for
//! the reserved key `0` — so client code can switch between variants without
//! changing its error handling.
//!
//! CAS and monitor contention is never surfaced as an error: a failed CAS is
//! retried internally and only shows up as added latency.

use thiserror::Error;

/// Error type for prefix-tree operations.
///
/// Key `0` is reserved for two internal roles: it is the root node's own key,
/// and it marks an empty slot in the open-addressed hash tables. Every
/// variant rejects it in `at()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    /// `at()` was called with key `0`.
    #[error("key 0 is reserved for the root and empty hash slots")]
    ReservedKey,
}

/// Result type for prefix-tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TreeError::ReservedKey;
        assert_eq!(
            err.to_string(),
            "key 0 is reserved for the root and empty hash slots"
        );
    }
}
