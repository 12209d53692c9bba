//! Core identifier types for replog.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier - the primary's number for a replicated transaction.
///
/// Identifier `0` is reserved for autonomous blocks that do not belong to any
/// user transaction (for example a sequence change made outside a transaction).
///
/// # Example
///
/// ```rust
/// use replog_common::types::TxnId;
///
/// let txn = TxnId::new(42);
/// assert!(txn.is_valid());
/// assert!(!TxnId::AUTONOMOUS.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Identifier used for blocks that belong to no transaction.
    pub const AUTONOMOUS: Self = Self(0);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true unless this is the autonomous identifier.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::AUTONOMOUS.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::AUTONOMOUS {
            write!(f, "TxnId(AUTONOMOUS)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<TxnId> for u64 {
    #[inline]
    fn from(id: TxnId) -> Self {
        id.0
    }
}
