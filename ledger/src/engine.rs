//! Transfer execution engine.

use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use bank_common::{AccountId, BankError, Result};

use crate::account::Account;
use crate::balance::{apply_delta, apply_in_lock_order, BalanceDelta};
use crate::journal::{CreateEntryParams, CreateTransferParams, Entry, Transfer};
use crate::store::{execute_tx, LedgerReader, LedgerStore, LedgerTx};

/// A request to move `amount` minor units from one account to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferRequest {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject degenerate requests before any store interaction.
    pub fn validate(&self) -> Result<()> {
        if self.from_account_id == self.to_account_id {
            return Err(BankError::SameAccount(self.from_account_id));
        }
        if self.amount <= 0 {
            return Err(BankError::InvalidAmount(self.amount));
        }
        Ok(())
    }
}

/// Everything a committed transfer wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    /// Source account after the debit.
    pub from_account: Account,
    /// Destination account after the credit.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl TransferResult {
    /// Whether the two entries are exactly the debit and credit of the transfer.
    pub fn is_balanced(&self) -> bool {
        self.transfer.is_posted_by(&self.from_entry, &self.to_entry)
    }
}

/// Result of an administrative balance adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub account: Account,
    pub entry: Entry,
}

/// The ledger engine moves money between accounts.
///
/// Holds no state besides the store handle, so one instance can be shared
/// by any number of concurrent callers. All mutual exclusion comes from the
/// store's row locks.
pub struct LedgerEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for LedgerEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> LedgerEngine<S> {
    /// Create a new ledger engine.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store, for the read path.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute a transfer as one atomic unit of work.
    ///
    /// Inserts the transfer row, the debit and credit entries, then updates
    /// both balances with the lower account id first. Any failure rolls the
    /// whole transaction back and is returned unchanged.
    #[instrument(skip(self, request), fields(from = %request.from_account_id, to = %request.to_account_id, amount = request.amount))]
    pub async fn execute_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        request.validate()?;

        let result = execute_tx(self.store.as_ref(), move |tx| {
            async move { post_transfer(tx, request).await }.boxed()
        })
        .await?;

        info!(
            transfer_id = %result.transfer.id,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer committed"
        );

        Ok(result)
    }

    /// Credit (positive) or debit (negative) one account outside a transfer.
    ///
    /// Writes one entry and the matching balance change in a single
    /// transaction, so the balance stays equal to the sum of entries.
    #[instrument(skip(self))]
    pub async fn adjust_balance(&self, account_id: AccountId, delta: i64) -> Result<AdjustmentResult> {
        if delta == 0 {
            return Err(BankError::InvalidAmount(delta));
        }

        let result = execute_tx(self.store.as_ref(), move |tx| {
            async move {
                let entry = tx
                    .create_entry(CreateEntryParams {
                        account_id,
                        amount: delta,
                    })
                    .await?;
                let account = apply_delta(tx, BalanceDelta::new(account_id, delta)).await?;
                Ok(AdjustmentResult { account, entry })
            }
            .boxed()
        })
        .await?;

        info!(
            entry_id = %result.entry.id,
            balance = result.account.balance,
            "Balance adjusted"
        );

        Ok(result)
    }

    /// Read one account at read committed isolation.
    pub async fn get_account(&self, account_id: AccountId) -> Result<Account> {
        self.store.get_account(account_id).await
    }
}

async fn post_transfer<T>(tx: &mut T, request: TransferRequest) -> Result<TransferResult>
where
    T: LedgerTx + ?Sized,
{
    let transfer = tx
        .create_transfer(CreateTransferParams {
            from_account_id: request.from_account_id,
            to_account_id: request.to_account_id,
            amount: request.amount,
        })
        .await?;

    let from_entry = tx
        .create_entry(CreateEntryParams {
            account_id: request.from_account_id,
            amount: -request.amount,
        })
        .await?;

    let to_entry = tx
        .create_entry(CreateEntryParams {
            account_id: request.to_account_id,
            amount: request.amount,
        })
        .await?;

    let (from_account, to_account) = apply_in_lock_order(
        tx,
        BalanceDelta::new(request.from_account_id, -request.amount),
        BalanceDelta::new(request.to_account_id, request.amount),
    )
    .await?;

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bank_common::{Currency, ErrorKind};
    use proptest::prelude::*;
    use tokio_test::{assert_err, assert_ok};

    use crate::account::CreateAccountParams;
    use crate::journal::{ListEntriesParams, ListTransfersParams};
    use crate::store::memory::{FailPoint, MemoryLedgerStore};
    use crate::user::{CreateUserParams, Role};

    async fn open_account(store: &MemoryLedgerStore, name: &str, balance: i64) -> Account {
        let user = store
            .create_user(CreateUserParams {
                username: name.to_string(),
                hashed_password: "secret".into(),
                full_name: "Test Owner".into(),
                email: format!("{name}@example.com"),
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

    async fn setup(a: i64, b: i64) -> (Arc<MemoryLedgerStore>, LedgerEngine<MemoryLedgerStore>, Account, Account) {
        let store = Arc::new(MemoryLedgerStore::new());
        let first = open_account(&store, "alice", a).await;
        let second = open_account(&store, "bob", b).await;
        let engine = LedgerEngine::new(Arc::clone(&store));
        (store, engine, first, second)
    }

    async fn balances(store: &MemoryLedgerStore, a: AccountId, b: AccountId) -> (i64, i64) {
        (
            store.get_account(a).await.unwrap().balance,
            store.get_account(b).await.unwrap().balance,
        )
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let (store, engine, a, b) = setup(500, 100).await;

        let result = engine
            .execute_transfer(TransferRequest::new(a.id, b.id, 200))
            .await
            .unwrap();

        assert_eq!(result.from_account.id, a.id);
        assert_eq!(result.from_account.balance, 300);
        assert_eq!(result.to_account.id, b.id);
        assert_eq!(result.to_account.balance, 300);
        assert_eq!(result.from_entry.amount, -200);
        assert_eq!(result.to_entry.amount, 200);
        assert!(result.is_balanced());

        assert_eq!(balances(&store, a.id, b.id).await, (300, 300));
        assert_eq!(store.transfer_count(), 1);
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.total_balance(), 600);

        let stored = store.get_transfer(result.transfer.id).await.unwrap();
        assert_eq!(stored, result.transfer);
    }

    #[tokio::test]
    async fn test_result_in_source_destination_order() {
        // Destination has the lower id, so it is locked first.
        let (store, engine, a, b) = setup(100, 500).await;

        let result = engine
            .execute_transfer(TransferRequest::new(b.id, a.id, 50))
            .await
            .unwrap();

        assert_eq!(result.from_account.id, b.id);
        assert_eq!(result.from_account.balance, 450);
        assert_eq!(result.to_account.id, a.id);
        assert_eq!(result.to_account.balance, 150);
        assert_eq!(balances(&store, a.id, b.id).await, (150, 450));
    }

    #[tokio::test]
    async fn test_entries_pair_with_transfer() {
        let (store, engine, a, b) = setup(1_000, 0).await;

        for amount in [10, 20, 30] {
            engine
                .execute_transfer(TransferRequest::new(a.id, b.id, amount))
                .await
                .unwrap();
        }

        let transfers = store
            .list_transfers(ListTransfersParams {
                account_id: b.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(transfers.len(), 3);

        let debits = store
            .list_entries(ListEntriesParams {
                account_id: a.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        let credits = store
            .list_entries(ListEntriesParams {
                account_id: b.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();

        for ((transfer, debit), credit) in transfers.iter().zip(&debits).zip(&credits) {
            assert!(transfer.is_posted_by(debit, credit));
        }
        assert_eq!(debits.iter().map(|e| e.amount).sum::<i64>(), -60);
        assert_eq!(credits.iter().map(|e| e.amount).sum::<i64>(), 60);
    }

    #[tokio::test]
    async fn test_failure_at_any_step_rolls_back() {
        let (store, engine, a, b) = setup(500, 100).await;
        let points = [
            FailPoint::CreateTransfer,
            FailPoint::CreateEntry(a.id),
            FailPoint::CreateEntry(b.id),
            FailPoint::AddBalance(a.id),
            FailPoint::AddBalance(b.id),
            FailPoint::Commit,
        ];

        for point in points {
            store.inject_fault(point);
            let err = engine
                .execute_transfer(TransferRequest::new(a.id, b.id, 200))
                .await
                .unwrap_err();
            store.clear_fault(point);

            match point {
                FailPoint::Commit => assert!(matches!(err, BankError::CommitFailed(_))),
                _ => assert!(matches!(err, BankError::InjectedFault(_)), "{point:?}: {err}"),
            }
            assert_eq!(store.transfer_count(), 0, "{point:?}");
            assert_eq!(store.entry_count(), 0, "{point:?}");
            assert_eq!(balances(&store, a.id, b.id).await, (500, 100), "{point:?}");
        }

        let stats = store.tx_stats();
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.rolled_back, points.len() as u64);
    }

    #[tokio::test]
    async fn test_begin_failure_writes_nothing() {
        let (store, engine, a, b) = setup(500, 100).await;
        store.inject_fault(FailPoint::Begin);

        let err = engine
            .execute_transfer(TransferRequest::new(a.id, b.id, 200))
            .await
            .unwrap_err();

        assert!(matches!(err, BankError::BeginFailed(_)));
        assert_eq!(err.kind(), ErrorKind::Transactional);
        assert_eq!(store.transfer_count(), 0);
        assert_eq!(store.entry_count(), 0);
        assert_eq!(balances(&store, a.id, b.id).await, (500, 100));
        assert_eq!(store.tx_stats().begun, 0);
    }

    #[tokio::test]
    async fn test_rollback_failure_reports_both_errors() {
        let (store, engine, a, b) = setup(500, 100).await;
        store.inject_fault(FailPoint::AddBalance(b.id));
        store.inject_fault(FailPoint::Rollback);

        let err = engine
            .execute_transfer(TransferRequest::new(a.id, b.id, 200))
            .await
            .unwrap_err();

        match &err {
            BankError::RollbackFailed { error, rollback } => {
                assert!(matches!(**error, BankError::InjectedFault(_)));
                assert!(matches!(**rollback, BankError::InjectedFault(_)));
            }
            other => panic!("expected rollback failure, got {other}"),
        }
        assert_eq!(err.kind(), ErrorKind::Transactional);
        assert!(err.to_string().contains("rollback error"));
        assert_eq!(balances(&store, a.id, b.id).await, (500, 100));
    }

    #[tokio::test]
    async fn test_missing_account_reported_by_store() {
        let (store, engine, a, _) = setup(500, 0).await;

        let err = engine
            .execute_transfer(TransferRequest::new(a.id, AccountId::new(999), 10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(store.transfer_count(), 0);
        assert_eq!(store.get_account(a.id).await.unwrap().balance, 500);
    }

    #[tokio::test]
    async fn test_degenerate_requests_skip_store() {
        let (store, engine, a, b) = setup(500, 100).await;

        let same = engine
            .execute_transfer(TransferRequest::new(a.id, a.id, 100))
            .await;
        assert!(matches!(same, Err(BankError::SameAccount(id)) if id == a.id));

        assert_err!(engine.execute_transfer(TransferRequest::new(a.id, b.id, 0)).await);
        assert_err!(engine.execute_transfer(TransferRequest::new(a.id, b.id, -5)).await);

        assert_eq!(store.tx_stats().begun, 0);
        assert_eq!(balances(&store, a.id, b.id).await, (500, 100));
    }

    #[tokio::test]
    async fn test_reads_are_idempotent() {
        let (_store, engine, a, _) = setup(500, 100).await;

        let first = assert_ok!(engine.get_account(a.id).await);
        let second = assert_ok!(engine.get_account(a.id).await);
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposing_transfers_do_not_deadlock() {
        let (store, engine, x, y) = setup(1_000, 1_000).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            let request = if i % 2 == 0 {
                TransferRequest::new(x.id, y.id, 10)
            } else {
                TransferRequest::new(y.id, x.id, 10)
            };
            handles.push(tokio::spawn(async move { engine.execute_transfer(request).await }));
        }

        let all = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
            .await
            .expect("transfers deadlocked");
        for joined in all {
            assert!(joined.unwrap().is_ok());
        }

        assert_eq!(balances(&store, x.id, y.id).await, (1_000, 1_000));
        assert_eq!(store.transfer_count(), 20);
        assert_eq!(store.entry_count(), 40);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_rolls_back() {
        let (store, engine, a, b) = setup(500, 100).await;

        // Hold `a`'s row lock so the transfer blocks inside its transaction.
        let mut blocker = store.begin().await.unwrap();
        blocker.add_account_balance(a.id, 0).await.unwrap();

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            engine.execute_transfer(TransferRequest::new(a.id, b.id, 200)),
        )
        .await;
        assert!(pending.is_err());
        blocker.rollback().await.unwrap();

        assert_eq!(store.tx_stats().abandoned, 1);
        assert_eq!(store.transfer_count(), 0);
        assert_eq!(store.entry_count(), 0);
        assert_eq!(balances(&store, a.id, b.id).await, (500, 100));

        // Locks were released with the dropped transaction.
        assert_ok!(engine.execute_transfer(TransferRequest::new(a.id, b.id, 200)).await);
    }

    #[tokio::test]
    async fn test_adjust_balance_writes_entry() {
        let (store, engine, a, _) = setup(0, 0).await;

        let deposit = engine.adjust_balance(a.id, 750).await.unwrap();
        assert_eq!(deposit.account.balance, 750);
        assert_eq!(deposit.entry.amount, 750);

        let withdrawal = engine.adjust_balance(a.id, -250).await.unwrap();
        assert_eq!(withdrawal.account.balance, 500);

        let entries = store
            .list_entries(ListEntriesParams {
                account_id: a.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 500);
        assert!(matches!(
            engine.adjust_balance(a.id, 0).await,
            Err(BankError::InvalidAmount(0))
        ));
    }

    proptest! {
        #[test]
        fn prop_transfers_conserve_total(
            moves in prop::collection::vec((0usize..3, 0usize..3, 1i64..500), 1..25)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let store = Arc::new(MemoryLedgerStore::new());
                let mut accounts = Vec::new();
                for name in ["ann", "ben", "cat"] {
                    accounts.push(open_account(&store, name, 1_000).await.id);
                }
                let engine = LedgerEngine::new(Arc::clone(&store));

                let mut expected = [1_000i64; 3];
                for (from, to, amount) in moves {
                    let outcome = engine
                        .execute_transfer(TransferRequest::new(accounts[from], accounts[to], amount))
                        .await;
                    if from == to {
                        prop_assert!(outcome.is_err());
                    } else {
                        prop_assert!(outcome.is_ok());
                        expected[from] -= amount;
                        expected[to] += amount;
                    }
                }

                prop_assert_eq!(store.total_balance(), 3_000);
                for (id, want) in accounts.iter().zip(expected) {
                    prop_assert_eq!(store.get_account(*id).await.unwrap().balance, want);
                }
                Ok(())
            })?;
        }
    }
}
