//! Journal rows: transfers and the signed entries they post.

use bank_common::{AccountId, EntryId, TransferId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Side of an entry, derived from the sign of its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Money leaving the account (negative amount).
    Debit,
    /// Money arriving in the account (positive amount).
    Credit,
}

/// An immutable ledger line against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Signed amount in minor units.
    pub amount: i64,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Debit or credit, by sign.
    pub fn entry_type(&self) -> EntryType {
        if self.amount < 0 {
            EntryType::Debit
        } else {
            EntryType::Credit
        }
    }
}

/// A committed movement of funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Positive amount in minor units.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// Whether `account_id` is either side of this transfer.
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account_id == account_id || self.to_account_id == account_id
    }

    /// Check that a debit/credit pair is exactly the two entries this transfer posts.
    pub fn is_posted_by(&self, debit: &Entry, credit: &Entry) -> bool {
        debit.account_id == self.from_account_id
            && credit.account_id == self.to_account_id
            && debit.amount == -self.amount
            && credit.amount == self.amount
            && debit.amount + credit.amount == 0
    }
}

/// Parameters for inserting an entry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

/// Parameters for inserting a transfer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Offset/limit scan over one account's entries, ordered by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

/// Offset/limit scan over transfers where the account is source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, account: i64, amount: i64) -> Entry {
        Entry {
            id: EntryId::new(id),
            account_id: AccountId::new(account),
            amount,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_entry_type_by_sign() {
        assert_eq!(entry(1, 1, -200).entry_type(), EntryType::Debit);
        assert_eq!(entry(2, 2, 200).entry_type(), EntryType::Credit);
    }

    #[test]
    fn test_transfer_pairing() {
        let transfer = Transfer {
            id: TransferId::new(1),
            from_account_id: AccountId::new(1),
            to_account_id: AccountId::new(2),
            amount: 200,
            created_at: Utc::now(),
        };

        assert!(transfer.is_posted_by(&entry(1, 1, -200), &entry(2, 2, 200)));
        assert!(!transfer.is_posted_by(&entry(1, 1, -200), &entry(2, 2, 150)));
        assert!(!transfer.is_posted_by(&entry(2, 2, 200), &entry(1, 1, -200)));
        assert!(transfer.involves(AccountId::new(2)));
        assert!(!transfer.involves(AccountId::new(3)));
    }
}
