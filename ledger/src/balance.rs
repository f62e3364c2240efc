//! Account balance mutation.
//!
//! Every balance change goes through a single `balance = balance + delta`
//! statement inside the caller's transaction. When a transaction touches
//! two accounts, the row with the smaller id is always updated first, so
//! two transfers over the same pair of accounts in opposite directions
//! acquire row locks in the same order and cannot deadlock.

use bank_common::{AccountId, Result};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::store::LedgerTx;

/// A signed change to one account's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub account_id: AccountId,
    /// Signed amount in minor units; negative for a debit.
    pub delta: i64,
}

impl BalanceDelta {
    pub fn new(account_id: AccountId, delta: i64) -> Self {
        Self { account_id, delta }
    }

    /// Whether this change removes money from the account.
    pub fn is_debit(&self) -> bool {
        self.delta < 0
    }
}

/// Apply one delta and return the updated row.
pub async fn apply_delta<T>(tx: &mut T, change: BalanceDelta) -> Result<Account>
where
    T: LedgerTx + ?Sized,
{
    tx.add_account_balance(change.account_id, change.delta).await
}

/// Apply two deltas in ascending account-id order.
///
/// The result is always `(source, destination)` regardless of which row
/// was locked first.
pub async fn apply_in_lock_order<T>(
    tx: &mut T,
    source: BalanceDelta,
    destination: BalanceDelta,
) -> Result<(Account, Account)>
where
    T: LedgerTx + ?Sized,
{
    if source.account_id <= destination.account_id {
        let source_account = apply_delta(tx, source).await?;
        let destination_account = apply_delta(tx, destination).await?;
        Ok((source_account, destination_account))
    } else {
        let destination_account = apply_delta(tx, destination).await?;
        let source_account = apply_delta(tx, source).await?;
        Ok((source_account, destination_account))
    }
}
