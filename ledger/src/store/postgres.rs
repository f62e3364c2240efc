//! PostgreSQL ledger store.
//!
//! `add_account_balance` is a single `UPDATE ... SET balance = balance + $1`
//! so the read-modify-write happens inside the database under the row's
//! write lock, never as a read followed by a write in application code.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow, Postgres, Transaction};
use tracing::{info, instrument};

use bank_common::{AccountId, BankError, Currency, EntryId, Result, TransferId, UserId};

use super::{LedgerReader, LedgerStore, LedgerTx};
use crate::account::{Account, CreateAccountParams, ListAccountsParams};
use crate::journal::{
    CreateEntryParams, CreateTransferParams, Entry, ListEntriesParams, ListTransfersParams,
    Transfer,
};
use crate::user::{CreateUserParams, Role, UpdateUserParams, User};

/// DDL for the ledger tables.
pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
const SQLSTATE_FOREIGN_KEY_VIOLATION: &str = "23503";
const SQLSTATE_CHECK_VIOLATION: &str = "23514";
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

const ACCOUNT_COLUMNS: &str = "id, owner_id, currency, balance, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "id, username, hashed_password, full_name, email, role, password_changed_at, created_at";

/// Translate a driver error into the ledger taxonomy.
///
/// `not_found` supplies the error for `RowNotFound`, which only the caller
/// can name precisely.
fn map_db_error(err: sqlx::Error, not_found: impl FnOnce() -> BankError) -> BankError {
    match err {
        sqlx::Error::RowNotFound => not_found(),
        sqlx::Error::Database(db) => {
            let constraint = db.constraint().unwrap_or_default().to_string();
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some(SQLSTATE_UNIQUE_VIOLATION) => BankError::Conflict {
                    constraint,
                    message,
                },
                Some(SQLSTATE_CHECK_VIOLATION) => BankError::CheckViolation {
                    constraint,
                    message,
                },
                Some(SQLSTATE_FOREIGN_KEY_VIOLATION) => {
                    BankError::NotFound(format!("{constraint}: {message}"))
                }
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED) => {
                    BankError::SerializationFailure(message)
                }
                _ => BankError::Database(db.to_string()),
            }
        }
        other => BankError::Database(other.to_string()),
    }
}

fn database_error(err: sqlx::Error) -> BankError {
    map_db_error(err, || BankError::Database("no rows returned".to_string()))
}

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    owner_id: i64,
    currency: String,
    balance: i64,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: AccountId::new(row.id),
            owner_id: UserId::new(row.owner_id),
            currency: Currency::new(row.currency),
            balance: row.balance,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct EntryRow {
    id: i64,
    account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: EntryId::new(row.id),
            account_id: AccountId::new(row.account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TransferRow {
    id: i64,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<TransferRow> for Transfer {
    fn from(row: TransferRow) -> Self {
        Self {
            id: TransferId::new(row.id),
            from_account_id: AccountId::new(row.from_account_id),
            to_account_id: AccountId::new(row.to_account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    hashed_password: String,
    full_name: String,
    email: String,
    role: String,
    password_changed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = BankError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(Self {
            id: UserId::new(row.id),
            username: row.username,
            hashed_password: row.hashed_password,
            full_name: row.full_name,
            email: row.email,
            role: Role::parse(&row.role)?,
            password_changed_at: row.password_changed_at,
            created_at: row.created_at,
        })
    }
}

/// [`LedgerStore`] backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(database_error)?;

        info!(max_connections, "PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they are missing.
    pub async fn install_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA_SQL).await.map_err(database_error)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerReader for PgLedgerStore {
    async fn get_account(&self, id: AccountId) -> Result<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&self.pool)
        .await
        .map(Account::from)
        .map_err(|err| map_db_error(err, || BankError::AccountNotFound(id)))
    }

    async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(params.owner_id.get())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&self.pool)
        .await
        .map(Entry::from)
        .map_err(|err| map_db_error(err, || BankError::EntryNotFound(id)))
    }

    async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id.get())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(rows.into_iter().map(Entry::from).collect())
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&self.pool)
        .await
        .map(Transfer::from)
        .map_err(|err| map_db_error(err, || BankError::TransferNotFound(id)))
    }

    async fn list_transfers(&self, params: ListTransfersParams) -> Result<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id.get())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(rows.into_iter().map(Transfer::from).collect())
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_db_error(err, || BankError::UserNotFound(username.to_string())))?;

        User::try_from(row)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_db_error(err, || BankError::user_id_not_found(id)))?;

        User::try_from(row)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| BankError::BeginFailed(err.to_string()))?;
        Ok(PgTx { tx: Some(tx) })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(())
    }

    #[instrument(skip(self, params), fields(username = %params.username))]
    async fn create_user(&self, params: CreateUserParams) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email, role) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .bind(params.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        User::try_from(row)
    }

    #[instrument(skip(self, params), fields(user_id = %params.id))]
    async fn update_user(&self, params: UpdateUserParams) -> Result<User> {
        let id = params.id;
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "UPDATE users SET \
                 username = COALESCE($1, username), \
                 full_name = COALESCE($2, full_name), \
                 email = COALESCE($3, email), \
                 hashed_password = COALESCE($4, hashed_password), \
                 password_changed_at = COALESCE($5, password_changed_at) \
             WHERE id = $6 RETURNING {USER_COLUMNS}"
        ))
        .bind(params.username)
        .bind(params.full_name)
        .bind(params.email)
        .bind(params.hashed_password)
        .bind(params.password_changed_at)
        .bind(id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_db_error(err, || BankError::user_id_not_found(id)))?;

        User::try_from(row)
    }

    #[instrument(skip(self, params), fields(owner_id = %params.owner_id, currency = %params.currency))]
    async fn create_account(&self, params: CreateAccountParams) -> Result<Account> {
        sqlx::query_as::<_, AccountRow>(&format!(
            "INSERT INTO accounts (owner_id, currency, balance) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.owner_id.get())
        .bind(params.currency.code())
        .bind(params.balance)
        .fetch_one(&self.pool)
        .await
        .map(Account::from)
        .map_err(database_error)
    }

    async fn create_entry(&self, params: CreateEntryParams) -> Result<Entry> {
        insert_entry(&self.pool, params).await
    }

    async fn create_transfer(&self, params: CreateTransferParams) -> Result<Transfer> {
        insert_transfer(&self.pool, params).await
    }
}

async fn insert_entry<'e, E>(executor: E, params: CreateEntryParams) -> Result<Entry>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, EntryRow>(&format!(
        "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
    ))
    .bind(params.account_id.get())
    .bind(params.amount)
    .fetch_one(executor)
    .await
    .map(Entry::from)
    .map_err(database_error)
}

async fn insert_transfer<'e, E>(executor: E, params: CreateTransferParams) -> Result<Transfer>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, TransferRow>(&format!(
        "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
         RETURNING {TRANSFER_COLUMNS}"
    ))
    .bind(params.from_account_id.get())
    .bind(params.to_account_id.get())
    .bind(params.amount)
    .fetch_one(executor)
    .await
    .map(Transfer::from)
    .map_err(database_error)
}

/// Transaction on a [`PgLedgerStore`].
///
/// Dropping an open `PgTx` rolls the database transaction back.
pub struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(BankError::TransactionClosed)
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        let tx = self.conn()?;
        insert_transfer(&mut **tx, params).await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        let tx = self.conn()?;
        insert_entry(&mut **tx, params).await
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account> {
        let tx = self.conn()?;
        sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(id.get())
        .fetch_one(&mut **tx)
        .await
        .map(Account::from)
        .map_err(|err| map_db_error(err, || BankError::AccountNotFound(id)))
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        let tx = self.conn()?;
        sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&mut **tx)
        .await
        .map(Account::from)
        .map_err(|err| map_db_error(err, || BankError::AccountNotFound(id)))
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(BankError::TransactionClosed)?;
        tx.commit()
            .await
            .map_err(|err| BankError::CommitFailed(err.to_string()))
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(BankError::TransactionClosed)?;
        tx.rollback().await.map_err(database_error)
    }
}
