//! Bank operations.
//!
//! The engine trusts its caller on currency and existence, so those checks
//! happen here before a transfer is handed to it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use bank_common::{AccountId, BankError, Currency, Result, UserId};
use bank_ledger::{
    Account, CreateAccountParams, CreateUserParams, Entry, LedgerEngine, LedgerReader, LedgerStore,
    ListAccountsParams, ListEntriesParams, ListTransfersParams, Role, Transfer, TransferRequest,
    TransferResult, UpdateUserParams, User,
};

use crate::config::ServiceConfig;
use crate::metrics::{ServiceMetrics, SharedMetrics};
use crate::validation::{
    validate_email, validate_full_name, validate_id, validate_password_hash, validate_username,
};

/// Offset/limit page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 5, offset: 0 }
    }
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Page by 1-based page number.
    pub fn numbered(page_id: i64, page_size: i64) -> Self {
        Self {
            limit: page_size,
            offset: (page_id - 1).max(0) * page_size,
        }
    }
}

/// A user registration. The password arrives already hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

/// A transfer request as received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub currency: String,
}

/// Account, user and transfer operations over one ledger store.
pub struct BankService<S: LedgerStore> {
    store: Arc<S>,
    engine: LedgerEngine<S>,
    config: ServiceConfig,
    metrics: SharedMetrics,
}

impl<S: LedgerStore> BankService<S> {
    /// Create a service over `store`.
    pub fn new(store: Arc<S>, config: ServiceConfig) -> Self {
        Self {
            engine: LedgerEngine::new(Arc::clone(&store)),
            store,
            config,
            metrics: Arc::new(ServiceMetrics::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn engine(&self) -> &LedgerEngine<S> {
        &self.engine
    }

    /// Check the store is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.store.ping().await
    }

    #[instrument(skip(self, new_user), fields(username = %new_user.username))]
    pub async fn create_user(&self, new_user: NewUser) -> Result<User> {
        validate_username(&new_user.username)?;
        validate_full_name(&new_user.full_name)?;
        validate_email(&new_user.email)?;
        validate_password_hash(&new_user.hashed_password)?;

        let user = self
            .store
            .create_user(CreateUserParams {
                username: new_user.username,
                hashed_password: new_user.hashed_password,
                full_name: new_user.full_name,
                email: new_user.email,
                role: new_user.role,
            })
            .await?;

        self.metrics.user_created();
        info!(user_id = %user.id, "User created");
        Ok(user)
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        validate_username(username)?;
        self.store.get_user(username).await
    }

    /// Change only the fields that are set.
    #[instrument(skip(self, params), fields(user_id = %params.id))]
    pub async fn update_user(&self, mut params: UpdateUserParams) -> Result<User> {
        validate_id("id", params.id.get())?;
        if let Some(username) = &params.username {
            validate_username(username)?;
        }
        if let Some(full_name) = &params.full_name {
            validate_full_name(full_name)?;
        }
        if let Some(email) = &params.email {
            validate_email(email)?;
        }
        if let Some(hash) = &params.hashed_password {
            validate_password_hash(hash)?;
            params.password_changed_at.get_or_insert_with(Utc::now);
        }

        self.store.update_user(params).await
    }

    /// Open a zero-balance account in a supported currency.
    #[instrument(skip(self))]
    pub async fn create_account(&self, owner_id: UserId, currency: &str) -> Result<Account> {
        validate_id("owner_id", owner_id.get())?;
        let currency = Currency::parse_supported(currency)?;

        let account = self
            .store
            .create_account(CreateAccountParams {
                owner_id,
                currency,
                balance: 0,
            })
            .await?;

        self.metrics.account_created();
        info!(account_id = %account.id, currency = %account.currency, "Account created");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        validate_id("id", id.get())?;
        self.store.get_account(id).await
    }

    pub async fn list_accounts(&self, owner_id: UserId, page: Page) -> Result<Vec<Account>> {
        validate_id("owner_id", owner_id.get())?;
        let page = self.check_page(page)?;
        self.store
            .list_accounts(ListAccountsParams {
                owner_id,
                limit: page.limit,
                offset: page.offset,
            })
            .await
    }

    pub async fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>> {
        validate_id("account_id", account_id.get())?;
        let page = self.check_page(page)?;
        self.store
            .list_entries(ListEntriesParams {
                account_id,
                limit: page.limit,
                offset: page.offset,
            })
            .await
    }

    /// Transfers where the account is source or destination.
    pub async fn list_transfers(&self, account_id: AccountId, page: Page) -> Result<Vec<Transfer>> {
        validate_id("account_id", account_id.get())?;
        let page = self.check_page(page)?;
        self.store
            .list_transfers(ListTransfersParams {
                account_id,
                limit: page.limit,
                offset: page.offset,
            })
            .await
    }

    /// Validate and execute a transfer within the configured deadline.
    ///
    /// When the deadline passes the in-flight transaction is dropped, which
    /// rolls it back.
    #[instrument(
        skip(self, command),
        fields(
            request_id = %Uuid::new_v4(),
            from = %command.from_account_id,
            to = %command.to_account_id,
            amount = command.amount
        )
    )]
    pub async fn transfer(&self, command: TransferCommand) -> Result<TransferResult> {
        let _active = self.metrics.transfer_attempted();

        let request = match self.check_transfer(&command).await {
            Ok(request) => request,
            Err(err) => {
                self.metrics.transfer_rejected();
                warn!(error = %err, code = err.error_code(), "Transfer rejected");
                return Err(err);
            }
        };

        let outcome =
            tokio::time::timeout(self.config.transfer_timeout, self.engine.execute_transfer(request))
                .await;

        match outcome {
            Ok(Ok(result)) => {
                self.metrics.transfer_committed(result.transfer.amount);
                Ok(result)
            }
            Ok(Err(err)) => {
                self.metrics.transfer_failed();
                warn!(error = %err, code = err.error_code(), "Transfer failed");
                Err(err)
            }
            Err(_) => {
                self.metrics.transfer_timed_out();
                warn!(timeout_ms = self.config.transfer_timeout.as_millis() as u64, "Transfer timed out");
                Err(BankError::Timeout(format!(
                    "transfer did not complete within {:?}",
                    self.config.transfer_timeout
                )))
            }
        }
    }

    async fn check_transfer(&self, command: &TransferCommand) -> Result<TransferRequest> {
        validate_id("from_account_id", command.from_account_id.get())?;
        validate_id("to_account_id", command.to_account_id.get())?;

        let request = TransferRequest::new(
            command.from_account_id,
            command.to_account_id,
            command.amount,
        );
        request.validate()?;

        let currency = Currency::parse_supported(&command.currency)?;
        self.check_currency(command.from_account_id, &currency).await?;
        self.check_currency(command.to_account_id, &currency).await?;

        Ok(request)
    }

    async fn check_currency(&self, account_id: AccountId, currency: &Currency) -> Result<Account> {
        let account = self.store.get_account(account_id).await?;
        if &account.currency != currency {
            return Err(BankError::CurrencyMismatch {
                account_id,
                expected: currency.code().to_string(),
                actual: account.currency.code().to_string(),
            });
        }
        Ok(account)
    }

    fn check_page(&self, page: Page) -> Result<Page> {
        if page.limit < 1 || page.limit > self.config.max_page_size {
            return Err(BankError::InvalidArgument {
                field: "limit",
                reason: format!("must be between 1 and {}", self.config.max_page_size),
            });
        }
        if page.offset < 0 {
            return Err(BankError::InvalidArgument {
                field: "offset",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(page)
    }
}
