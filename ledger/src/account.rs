//! Account rows and the parameters used to create and page through them.

use bank_common::{AccountId, Currency, Money, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A ledger account.
///
/// `balance` is always the sum of the account's entries. It only changes
/// inside a committed transfer or an administrative adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Owning user.
    pub owner_id: UserId,
    /// Account currency.
    pub currency: Currency,
    /// Balance in minor units.
    pub balance: i64,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Balance tagged with the account currency.
    pub fn balance_money(&self) -> Money {
        Money::new(self.balance, self.currency.clone())
    }
}

/// Parameters for inserting an account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner_id: UserId,
    pub currency: Currency,
    /// Opening balance. The service layer always opens accounts at zero.
    pub balance: i64,
}

/// Offset/limit scan over one owner's accounts, ordered by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner_id: UserId,
    pub limit: i64,
    pub offset: i64,
}
