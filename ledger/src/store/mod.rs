//! Ledger store contract.
//!
//! The ledger is persisted by an external relational store. This module
//! defines what the engine needs from it:
//!
//! - [`LedgerTx`]: one open transaction. Row updates take row-level write
//!   locks that are held until commit or rollback.
//! - [`LedgerReader`]: point lookups and offset/limit scans at the store's
//!   default (read committed) isolation.
//! - [`LedgerStore`]: opens transactions and performs auto-commit writes.
//!
//! Two implementations ship with the crate: [`postgres::PgLedgerStore`] and
//! the in-process [`memory::MemoryLedgerStore`] used by tests and the
//! simulator.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, warn};

use bank_common::{AccountId, BankError, EntryId, Result, TransferId, UserId};

use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::journal::{
    CreateEntryParams, CreateTransferParams, Entry, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use crate::user::{CreateUserParams, UpdateUserParams, User};

/// An open store transaction.
///
/// Dropping a transaction that was neither committed nor rolled back
/// discards its writes and releases its locks.
#[async_trait]
pub trait LedgerTx: Send {
    /// Insert a transfer row.
    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer>;

    /// Insert an entry row.
    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry>;

    /// `balance = balance + delta` on one row, returning the updated row.
    ///
    /// Takes the row's write lock, blocking while another transaction holds it.
    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account>;

    /// Read an account as this transaction sees it.
    async fn get_account(&mut self, id: AccountId) -> Result<Account>;

    /// Make all writes durable and release locks.
    async fn commit(&mut self) -> Result<()>;

    /// Discard all writes and release locks.
    async fn rollback(&mut self) -> Result<()>;
}

/// Read path consumed by the API layer.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Account>;

    async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>>;

    async fn get_entry(&self, id: EntryId) -> Result<Entry>;

    async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>>;

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer>;

    async fn list_transfers(&self, params: ListTransfersParams) -> Result<Vec<Transfer>>;

    /// Look a user up by username.
    async fn get_user(&self, username: &str) -> Result<User>;

    async fn get_user_by_id(&self, id: UserId) -> Result<User>;
}

/// A ledger store: transactions plus auto-commit writes.
#[async_trait]
pub trait LedgerStore: LedgerReader {
    /// Transaction handle type.
    type Tx: LedgerTx;

    /// Open a transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    async fn create_user(&self, params: CreateUserParams) -> Result<User>;

    async fn update_user(&self, params: UpdateUserParams) -> Result<User>;

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account>;

    /// Raw entry insert outside any transfer. Administrative tooling only.
    async fn create_entry(&self, params: CreateEntryParams) -> Result<Entry>;

    /// Raw transfer insert without entries. Administrative tooling only.
    async fn create_transfer(&self, params: CreateTransferParams) -> Result<Transfer>;
}

/// Run `work` inside one store transaction.
///
/// Commits when `work` succeeds. When it fails the transaction is rolled
/// back and the error returned unchanged; if the rollback fails as well,
/// both errors come back together in [`BankError::RollbackFailed`].
pub async fn execute_tx<S, T, F>(store: &S, work: F) -> Result<T>
where
    S: LedgerStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut tx = store.begin().await?;

    match work(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => {
                warn!(error = %err, "Transaction rolled back");
                Err(err)
            }
            Err(rollback) => {
                error!(error = %err, rollback_error = %rollback, "Rollback failed");
                Err(BankError::RollbackFailed {
                    error: Box::new(err),
                    rollback: Box::new(rollback),
                })
            }
        },
    }
}
