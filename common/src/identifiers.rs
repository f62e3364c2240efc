//! Identifier types for ledger entities.
//!
//! Every row in the ledger store carries a database-assigned `i64` key. The
//! newtypes keep account, entry, transfer and user keys from being mixed up
//! at call sites while still ordering and hashing like the raw integer.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database key.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw database key.
            pub const fn get(&self) -> i64 {
                self.0
            }

            /// Keys are assigned from 1 upwards; zero and negatives never name a row.
            pub const fn is_valid(&self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id!(
    /// Unique identifier for an account.
    ///
    /// The total order on account ids is the global lock order used by the
    /// transfer engine.
    AccountId
);

row_id!(
    /// Unique identifier for a ledger entry.
    EntryId
);

row_id!(
    /// Unique identifier for a transfer.
    TransferId
);

row_id!(
    /// Unique identifier for a user (account owner).
    UserId
);
