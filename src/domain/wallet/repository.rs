//! Identity / wallet store interface

use async_trait::async_trait;

use super::model::UserAccount;
use crate::domain::DomainResult;

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> DomainResult<Option<UserAccount>>;

    async fn get_balance(&self, user_id: &str) -> DomainResult<i64>;

    /// Apply `delta` and return the new balance. Implementations must apply
    /// the change atomically and fail with `InsufficientBalance` instead of
    /// producing a negative balance.
    async fn adjust_balance(&self, user_id: &str, delta: i64) -> DomainResult<i64>;
}
