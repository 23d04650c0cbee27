//! In-memory wallet store

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::{DomainError, DomainResult, UserAccount, UserRole, WalletStore};

/// Wallet accounts held in process memory. Each `adjust_balance` is applied
/// under the account's map-entry lock.
#[derive(Default)]
pub struct InMemoryWalletStore {
    accounts: DashMap<String, UserAccount>,
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = UserAccount>) -> Self {
        let store = Self::new();
        for account in accounts {
            store.accounts.insert(account.id.clone(), account);
        }
        store
    }

    /// Create or replace an account.
    pub fn insert_user(&self, id: &str, role: UserRole, balance: i64) {
        self.accounts
            .insert(id.to_string(), UserAccount::new(id, role, balance));
    }

    /// Create the account with a zero balance unless it already exists.
    pub fn ensure_account(&self, id: &str, role: UserRole) {
        self.accounts
            .entry(id.to_string())
            .or_insert_with(|| UserAccount::new(id, role, 0));
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get_user(&self, user_id: &str) -> DomainResult<Option<UserAccount>> {
        Ok(self.accounts.get(user_id).map(|a| a.clone()))
    }

    async fn get_balance(&self, user_id: &str) -> DomainResult<i64> {
        self.accounts
            .get(user_id)
            .map(|a| a.balance)
            .ok_or_else(|| DomainError::not_found("User", "id", user_id))
    }

    async fn adjust_balance(&self, user_id: &str, delta: i64) -> DomainResult<i64> {
        let mut account = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| DomainError::not_found("User", "id", user_id))?;

        let new_balance = account
            .balance
            .checked_add(delta)
            .ok_or_else(|| DomainError::Validation("balance overflow".into()))?;
        if new_balance < 0 {
            return Err(DomainError::InsufficientBalance {
                user_id: user_id.to_string(),
                balance: account.balance,
                required: -delta,
            });
        }

        account.balance = new_balance;
        debug!(user_id, delta, new_balance, "Balance adjusted");
        Ok(new_balance)
    }
}
