//! Simulated customers and their funded accounts.

use bank_common::AccountId;
use bank_ledger::{Account, LedgerStore, Role, User};
use bank_service::{BankService, NewUser};
use tracing::info;

/// A customer with one funded account.
#[derive(Debug, Clone)]
pub struct SimulatedCustomer {
    pub user: User,
    pub account: Account,
}

impl SimulatedCustomer {
    pub fn account_id(&self) -> AccountId {
        self.account.id
    }
}

/// Creates customers through the service layer.
pub struct CustomerFactory;

impl CustomerFactory {
    /// Username for customer `index` of run `run_id`.
    ///
    /// Only lowercase hex and underscores, so it passes username validation.
    pub fn username(run_id: &str, index: usize) -> String {
        format!("sim_{run_id}_{index}")
    }

    /// Create `count` customers, each with an account funded by an
    /// administrative deposit of `initial_balance`.
    pub async fn provision<S: LedgerStore>(
        service: &BankService<S>,
        run_id: &str,
        count: usize,
        currency: &str,
        initial_balance: i64,
    ) -> anyhow::Result<Vec<SimulatedCustomer>> {
        let mut customers = Vec::with_capacity(count);

        for index in 0..count {
            let username = Self::username(run_id, index);
            let user = service
                .create_user(NewUser {
                    email: format!("{username}@simulator.local"),
                    username,
                    hashed_password: "simulated".to_string(),
                    full_name: "Simulated Customer".to_string(),
                    role: Role::Customer,
                })
                .await?;

            let mut account = service.create_account(user.id, currency).await?;
            if initial_balance != 0 {
                account = service
                    .engine()
                    .adjust_balance(account.id, initial_balance)
                    .await?
                    .account;
            }

            info!(
                user_id = %user.id,
                account_id = %account.id,
                balance = %account.balance_money(),
                "Customer provisioned"
            );
            customers.push(SimulatedCustomer { user, account });
        }

        Ok(customers)
    }
}
