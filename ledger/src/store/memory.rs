//! In-process ledger store.
//!
//! Emulates the transactional contract of the relational store closely
//! enough to exercise the engine without a database:
//!
//! - writes made inside a [`MemoryTx`] are invisible to everyone else until
//!   commit, and vanish on rollback or drop;
//! - `add_account_balance` takes a per-account write lock held until the
//!   transaction ends, so two transactions locking the same pair of
//!   accounts in opposite orders deadlock exactly as they would on a real
//!   database;
//! - ids come from sequences that are consumed even by rolled back
//!   inserts.
//!
//! Faults can be injected at every write step to test rollback paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, instrument};

use bank_common::{AccountId, BankError, EntryId, Result, TransferId, UserId};

use super::{LedgerReader, LedgerStore, LedgerTx};
use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::journal::{
    CreateEntryParams, CreateTransferParams, Entry, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use crate::user::{CreateUserParams, UpdateUserParams, User};

/// A point at which the store can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Opening a transaction.
    Begin,
    /// Inserting any transfer row.
    CreateTransfer,
    /// Inserting an entry for this account.
    CreateEntry(AccountId),
    /// Updating this account's balance.
    AddBalance(AccountId),
    /// Committing.
    Commit,
    /// Rolling back. Writes are still discarded.
    Rollback,
}

/// Transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Dropped while still open (cancelled callers).
    pub abandoned: u64,
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

#[derive(Default)]
struct Sequences {
    user: AtomicI64,
    account: AtomicI64,
    entry: AtomicI64,
    transfer: AtomicI64,
}

impl Sequences {
    fn next(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: DashMap<AccountId, Arc<RowLock<()>>>,
    faults: Mutex<HashSet<FailPoint>>,
    sequences: Sequences,
    counters: Counters,
}

impl Inner {
    fn check_fault(&self, point: FailPoint) -> Result<()> {
        if self.faults.lock().contains(&point) {
            debug!(?point, "Injecting fault");
            return Err(BankError::InjectedFault(format!("{point:?}")));
        }
        Ok(())
    }

    fn account(&self, id: AccountId) -> Result<Account> {
        self.tables
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(BankError::AccountNotFound(id))
    }

    fn require_account(&self, id: AccountId) -> Result<()> {
        if self.tables.lock().accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(BankError::NotFound(format!("account {id}")))
        }
    }

    fn row_lock(&self, id: AccountId) -> Result<Arc<RowLock<()>>> {
        self.row_locks
            .get(&id)
            .map(|lock| Arc::clone(lock.value()))
            .ok_or(BankError::AccountNotFound(id))
    }

    fn new_entry(&self, params: CreateEntryParams) -> Result<Entry> {
        self.require_account(params.account_id)?;
        Ok(Entry {
            id: EntryId::new(Sequences::next(&self.sequences.entry)),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        })
    }

    fn new_transfer(&self, params: CreateTransferParams) -> Result<Transfer> {
        self.require_account(params.from_account_id)?;
        self.require_account(params.to_account_id)?;
        if params.amount <= 0 {
            return Err(BankError::CheckViolation {
                constraint: "transfers_amount_check".to_string(),
                message: format!("amount {} violates check constraint", params.amount),
            });
        }
        Ok(Transfer {
            id: TransferId::new(Sequences::next(&self.sequences.transfer)),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        })
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

fn unique_violation(constraint: &str, value: &str) -> BankError {
    BankError::Conflict {
        constraint: constraint.to_string(),
        message: format!("duplicate key value {value:?}"),
    }
}

/// In-process [`LedgerStore`].
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call reaching `point` fail until cleared.
    pub fn inject_fault(&self, point: FailPoint) {
        self.inner.faults.lock().insert(point);
    }

    /// Remove one injected fault.
    pub fn clear_fault(&self, point: FailPoint) {
        self.inner.faults.lock().remove(&point);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Transaction counters since the store was created.
    pub fn tx_stats(&self) -> TxStats {
        let counters = &self.inner.counters;
        TxStats {
            begun: counters.begun.load(Ordering::SeqCst),
            committed: counters.committed.load(Ordering::SeqCst),
            rolled_back: counters.rolled_back.load(Ordering::SeqCst),
            abandoned: counters.abandoned.load(Ordering::SeqCst),
        }
    }

    /// Number of committed transfer rows.
    pub fn transfer_count(&self) -> usize {
        self.inner.tables.lock().transfers.len()
    }

    /// Number of committed entry rows.
    pub fn entry_count(&self) -> usize {
        self.inner.tables.lock().entries.len()
    }

    /// Sum of all committed balances.
    pub fn total_balance(&self) -> i64 {
        self.inner
            .tables
            .lock()
            .accounts
            .values()
            .map(|account| account.balance)
            .sum()
    }
}

#[async_trait]
impl LedgerReader for MemoryLedgerStore {
    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.inner.account(id)
    }

    async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>> {
        let tables = self.inner.tables.lock();
        Ok(page(
            tables
                .accounts
                .values()
                .filter(|account| account.owner_id == params.owner_id)
                .cloned(),
            params.limit,
            params.offset,
        ))
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        self.inner
            .tables
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or(BankError::EntryNotFound(id))
    }

    async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>> {
        let tables = self.inner.tables.lock();
        Ok(page(
            tables
                .entries
                .values()
                .filter(|entry| entry.account_id == params.account_id)
                .cloned(),
            params.limit,
            params.offset,
        ))
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        self.inner
            .tables
            .lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(BankError::TransferNotFound(id))
    }

    async fn list_transfers(&self, params: ListTransfersParams) -> Result<Vec<Transfer>> {
        let tables = self.inner.tables.lock();
        Ok(page(
            tables
                .transfers
                .values()
                .filter(|transfer| transfer.involves(params.account_id))
                .cloned(),
            params.limit,
            params.offset,
        ))
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        self.inner
            .tables
            .lock()
            .users
            .values()
            .find(|user| user.username == username)
            .cloned()
            .ok_or_else(|| BankError::UserNotFound(username.to_string()))
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<User> {
        self.inner
            .tables
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| BankError::user_id_not_found(id))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        self.inner.check_fault(FailPoint::Begin).map_err(|err| {
            BankError::BeginFailed(err.to_string())
        })?;
        self.inner.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx {
            inner: Arc::clone(&self.inner),
            locks: HashMap::new(),
            balances: HashMap::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
            open: true,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_user(&self, params: CreateUserParams) -> Result<User> {
        let mut tables = self.inner.tables.lock();
        if tables.users.values().any(|u| u.username == params.username) {
            return Err(unique_violation("users_username_key", &params.username));
        }
        if tables.users.values().any(|u| u.email == params.email) {
            return Err(unique_violation("users_email_key", &params.email));
        }

        let now = Utc::now();
        let user = User {
            id: UserId::new(Sequences::next(&self.inner.sequences.user)),
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            role: params.role,
            password_changed_at: now,
            created_at: now,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, params: UpdateUserParams) -> Result<User> {
        let mut tables = self.inner.tables.lock();
        if let Some(username) = &params.username {
            if tables
                .users
                .values()
                .any(|u| u.id != params.id && &u.username == username)
            {
                return Err(unique_violation("users_username_key", username));
            }
        }
        if let Some(email) = &params.email {
            if tables
                .users
                .values()
                .any(|u| u.id != params.id && &u.email == email)
            {
                return Err(unique_violation("users_email_key", email));
            }
        }

        let user = tables
            .users
            .get_mut(&params.id)
            .ok_or_else(|| BankError::user_id_not_found(params.id))?;
        if let Some(username) = params.username {
            user.username = username;
        }
        if let Some(full_name) = params.full_name {
            user.full_name = full_name;
        }
        if let Some(email) = params.email {
            user.email = email;
        }
        if let Some(hashed_password) = params.hashed_password {
            user.hashed_password = hashed_password;
        }
        if let Some(changed_at) = params.password_changed_at {
            user.password_changed_at = changed_at;
        }
        Ok(user.clone())
    }

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account> {
        let mut tables = self.inner.tables.lock();
        if !tables.users.contains_key(&params.owner_id) {
            return Err(BankError::NotFound(format!("user {}", params.owner_id)));
        }
        if tables
            .accounts
            .values()
            .any(|a| a.owner_id == params.owner_id && a.currency == params.currency)
        {
            return Err(unique_violation(
                "owner_currency_key",
                &format!("({}, {})", params.owner_id, params.currency),
            ));
        }

        let account = Account {
            id: AccountId::new(Sequences::next(&self.inner.sequences.account)),
            owner_id: params.owner_id,
            currency: params.currency,
            balance: params.balance,
            created_at: Utc::now(),
        };
        tables.accounts.insert(account.id, account.clone());
        self.inner
            .row_locks
            .insert(account.id, Arc::new(RowLock::new(())));
        Ok(account)
    }

    async fn create_entry(&self, params: CreateEntryParams) -> Result<Entry> {
        let entry = self.inner.new_entry(params)?;
        self.inner
            .tables
            .lock()
            .entries
            .insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn create_transfer(&self, params: CreateTransferParams) -> Result<Transfer> {
        let transfer = self.inner.new_transfer(params)?;
        self.inner
            .tables
            .lock()
            .transfers
            .insert(transfer.id, transfer.clone());
        Ok(transfer)
    }
}

/// Transaction on a [`MemoryLedgerStore`].
pub struct MemoryTx {
    inner: Arc<Inner>,
    /// Row locks held until the transaction ends.
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// Uncommitted balances of locked rows.
    balances: HashMap<AccountId, i64>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
    open: bool,
}

impl std::fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTx")
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(BankError::TransactionClosed)
        }
    }

    fn discard(&mut self) {
        self.balances.clear();
        self.transfers.clear();
        self.entries.clear();
        self.locks.clear();
        self.open = false;
    }

    fn visible(&self, id: AccountId) -> Result<Account> {
        let mut account = self.inner.account(id)?;
        if let Some(balance) = self.balances.get(&id) {
            account.balance = *balance;
        }
        Ok(account)
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        self.ensure_open()?;
        self.inner.check_fault(FailPoint::CreateTransfer)?;
        let transfer = self.inner.new_transfer(params)?;
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        self.ensure_open()?;
        self.inner
            .check_fault(FailPoint::CreateEntry(params.account_id))?;
        let entry = self.inner.new_entry(params)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account> {
        self.ensure_open()?;
        self.inner.check_fault(FailPoint::AddBalance(id))?;

        if !self.locks.contains_key(&id) {
            let row = self.inner.row_lock(id)?;
            let guard = row.lock_owned().await;
            self.locks.insert(id, guard);
        }

        let mut account = self.visible(id)?;
        account.balance = account.balance.checked_add(delta).ok_or_else(|| {
            BankError::Database(format!("bigint out of range updating account {id}"))
        })?;
        self.balances.insert(id, account.balance);
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        self.ensure_open()?;
        self.visible(id)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Err(err) = self.inner.check_fault(FailPoint::Commit) {
            self.discard();
            self.inner.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
            return Err(BankError::CommitFailed(err.to_string()));
        }

        {
            let mut tables = self.inner.tables.lock();
            for (id, balance) in self.balances.drain() {
                if let Some(account) = tables.accounts.get_mut(&id) {
                    account.balance = balance;
                }
            }
            for transfer in self.transfers.drain(..) {
                tables.transfers.insert(transfer.id, transfer);
            }
            for entry in self.entries.drain(..) {
                tables.entries.insert(entry.id, entry);
            }
        }

        // Published rows must be visible before the next lock holder reads them.
        self.discard();
        self.inner.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.discard();
        self.inner.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        self.inner.check_fault(FailPoint::Rollback)
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if self.open {
            self.inner.counters.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Role;
    use bank_common::Currency;

    async fn seed(store: &MemoryLedgerStore, balance: i64) -> Account {
        let n = store.inner.sequences.user.load(Ordering::SeqCst) + 1;
        let user = store
            .create_user(CreateUserParams {
                username: format!("user{n}"),
                hashed_password: "x".into(),
                full_name: "Test User".into(),
                email: format!("user{n}@example.com"),
                role: Role::Customer,
            })
            .await
            .unwrap();
        store
            .create_account(CreateAccountParams {
                owner_id: user.id,
                currency: Currency::usd(),
                balance,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryLedgerStore::new();
        let account = seed(&store, 100).await;

        let mut tx = store.begin().await.unwrap();
        let updated = tx.add_account_balance(account.id, 50).await.unwrap();
        assert_eq!(updated.balance, 150);
        assert_eq!(tx.get_account(account.id).await.unwrap().balance, 150);
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 100);

        tx.commit().await.unwrap();
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let store = MemoryLedgerStore::new();
        let account = seed(&store, 100).await;

        let mut tx = store.begin().await.unwrap();
        tx.create_entry(CreateEntryParams {
            account_id: account.id,
            amount: 10,
        })
        .await
        .unwrap();
        tx.add_account_balance(account.id, 10).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 100);
        assert!(matches!(
            tx.commit().await,
            Err(BankError::TransactionClosed)
        ));
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_writer() {
        let store = MemoryLedgerStore::new();
        let account = seed(&store, 0).await;

        let mut first = store.begin().await.unwrap();
        first.add_account_balance(account.id, 5).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            second.add_account_balance(account.id, 7),
        )
        .await;
        assert!(blocked.is_err(), "second writer must wait for the row lock");

        first.commit().await.unwrap();
        let updated = second.add_account_balance(account.id, 7).await.unwrap();
        assert_eq!(updated.balance, 12);
        second.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_locks() {
        let store = MemoryLedgerStore::new();
        let account = seed(&store, 0).await;

        {
            let mut tx = store.begin().await.unwrap();
            tx.add_account_balance(account.id, 5).await.unwrap();
        }
        assert_eq!(store.tx_stats().abandoned, 1);

        let mut tx = store.begin().await.unwrap();
        let updated = tx.add_account_balance(account.id, 1).await.unwrap();
        assert_eq!(updated.balance, 1);
    }

    #[tokio::test]
    async fn test_unknown_account_update() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .add_account_balance(AccountId::new(404), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::AccountNotFound(id) if id.get() == 404));
    }

    #[tokio::test]
    async fn test_duplicate_account_currency() {
        let store = MemoryLedgerStore::new();
        let account = seed(&store, 0).await;
        let err = store
            .create_account(CreateAccountParams {
                owner_id: account.owner_id,
                currency: Currency::usd(),
                balance: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Conflict { constraint, .. } if constraint == "owner_currency_key"));
    }

    #[tokio::test]
    async fn test_non_positive_transfer_row_violates_check() {
        let store = MemoryLedgerStore::new();
        let from = seed(&store, 100).await;
        let to = seed(&store, 0).await;

        let err = store
            .create_transfer(CreateTransferParams {
                from_account_id: from.id,
                to_account_id: to.id,
                amount: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::CheckViolation { ref constraint, .. } if constraint == "transfers_amount_check"));
        assert_eq!(err.kind(), bank_common::ErrorKind::Precondition);
        assert_eq!(store.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_fault_opens_nothing() {
        let store = MemoryLedgerStore::new();
        seed(&store, 100).await;
        store.inject_fault(FailPoint::Begin);

        let err = store.begin().await.unwrap_err();
        assert!(matches!(err, BankError::BeginFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(store.tx_stats(), TxStats::default());

        store.clear_fault(FailPoint::Begin);
        assert!(store.begin().await.is_ok());
    }
}
