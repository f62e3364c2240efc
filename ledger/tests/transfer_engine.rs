//! Transfer engine behaviour through the public API, on the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use bank_common::{AccountId, Currency};
use bank_ledger::{
    Account, CreateAccountParams, CreateUserParams, LedgerEngine, LedgerReader, LedgerStore,
    ListEntriesParams, ListTransfersParams, MemoryLedgerStore, Role, TransferRequest,
};

async fn open_accounts(store: &MemoryLedgerStore, count: usize, balance: i64) -> Vec<Account> {
    let mut accounts = Vec::with_capacity(count);
    for i in 0..count {
        let user = store
            .create_user(CreateUserParams {
                username: format!("owner{i}"),
                hashed_password: "secret".into(),
                full_name: "Account Owner".into(),
                email: format!("owner{i}@example.com"),
                role: Role::Customer,
            })
            .await
            .unwrap();
        let account = store
            .create_account(CreateAccountParams {
                owner_id: user.id,
                currency: Currency::eur(),
                balance,
            })
            .await
            .unwrap();
        accounts.push(account);
    }
    accounts
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ring_of_transfers_conserves_every_balance() {
    let store = Arc::new(MemoryLedgerStore::new());
    let accounts = open_accounts(&store, 6, 1_000).await;
    let engine = LedgerEngine::new(Arc::clone(&store));

    // Each account sends 25 to its neighbour 8 times; every account nets zero.
    let mut handles = Vec::new();
    for round in 0..8 {
        for (i, from) in accounts.iter().enumerate() {
            let to = &accounts[(i + 1) % accounts.len()];
            let request = if round % 2 == 0 {
                TransferRequest::new(from.id, to.id, 25)
            } else {
                TransferRequest::new(to.id, from.id, 25)
            };
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.execute_transfer(request).await
            }));
        }
    }

    let joined = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("transfers did not finish");
    assert!(joined.into_iter().all(|r| r.unwrap().is_ok()));

    for account in &accounts {
        assert_eq!(store.get_account(account.id).await.unwrap().balance, 1_000);
    }
    assert_eq!(store.transfer_count(), 48);
    assert_eq!(store.entry_count(), 96);
}

#[tokio::test]
async fn read_path_pages_in_id_order() {
    let store = Arc::new(MemoryLedgerStore::new());
    let accounts = open_accounts(&store, 3, 500).await;
    let engine = LedgerEngine::new(Arc::clone(&store));
    let (a, b, c) = (accounts[0].id, accounts[1].id, accounts[2].id);

    engine.execute_transfer(TransferRequest::new(a, b, 10)).await.unwrap();
    engine.execute_transfer(TransferRequest::new(c, a, 20)).await.unwrap();
    engine.execute_transfer(TransferRequest::new(b, c, 30)).await.unwrap();

    let first = store
        .list_transfers(ListTransfersParams {
            account_id: a,
            limit: 1,
            offset: 0,
        })
        .await
        .unwrap();
    let second = store
        .list_transfers(ListTransfersParams {
            account_id: a,
            limit: 1,
            offset: 1,
        })
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert!(first[0].id < second[0].id);
    assert_eq!(second[0].from_account_id, c);

    let beyond = store
        .list_transfers(ListTransfersParams {
            account_id: a,
            limit: 5,
            offset: 2,
        })
        .await
        .unwrap();
    assert!(beyond.is_empty());

    let entries = store
        .list_entries(ListEntriesParams {
            account_id: b,
            limit: 5,
            offset: 0,
        })
        .await
        .unwrap();
    let amounts: Vec<i64> = entries.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![10, -30]);

    let entry = store.get_entry(entries[0].id).await.unwrap();
    assert_eq!(entry, entries[0]);
}

#[tokio::test]
async fn unknown_rows_are_not_found() {
    let store = MemoryLedgerStore::new();

    assert!(store.get_account(AccountId::new(1)).await.is_err());
    assert!(store.get_user("nobody").await.is_err());

    let mut tx = store.begin().await.unwrap();
    assert!(bank_ledger::apply_delta(&mut tx, bank_ledger::BalanceDelta::new(AccountId::new(1), 5))
        .await
        .is_err());
}
