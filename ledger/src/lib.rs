//! Bank Ledger Engine
//!
//! Double-entry ledger: accounts, immutable entries and transfers, with an
//! engine that moves funds atomically and without deadlocks under
//! concurrent load.

pub mod account;
pub mod balance;
pub mod engine;
pub mod journal;
pub mod store;
pub mod user;

pub use account::{Account, CreateAccountParams, ListAccountsParams};
pub use balance::{apply_delta, apply_in_lock_order, BalanceDelta};
pub use engine::{AdjustmentResult, LedgerEngine, TransferRequest, TransferResult};
pub use journal::{
    CreateEntryParams, CreateTransferParams, Entry, EntryType, ListEntriesParams,
    ListTransfersParams, Transfer,
};
pub use store::memory::{FailPoint, MemoryLedgerStore, MemoryTx, TxStats};
pub use store::postgres::{PgLedgerStore, PgTx};
pub use store::{execute_tx, LedgerReader, LedgerStore, LedgerTx};
pub use user::{CreateUserParams, Role, UpdateUserParams, User};
