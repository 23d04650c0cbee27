//! Session store interface

use async_trait::async_trait;

use super::model::{PaymentStatus, Transaction};
use crate::domain::billing::{PaymentRecord, RevenueShareRecord};
use crate::domain::DomainResult;

/// Persistence for session records, payment history and the tariff.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Issue a transaction id that has never been handed out before.
    async fn next_transaction_id(&self) -> DomainResult<i32>;

    async fn create_session(&self, transaction: &Transaction) -> DomainResult<()>;
    async fn update_session(&self, transaction: &Transaction) -> DomainResult<()>;
    async fn get_session(&self, id: i32) -> DomainResult<Option<Transaction>>;

    /// Compare-and-set on the payment status. Returns `false` when the
    /// current status is not `from`.
    async fn transition_payment_status(
        &self,
        id: i32,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> DomainResult<bool>;

    async fn set_payment_status(
        &self,
        id: i32,
        status: PaymentStatus,
        cost: Option<i64>,
    ) -> DomainResult<()>;

    async fn append_payment(&self, record: PaymentRecord) -> DomainResult<()>;
    async fn append_revenue_share(&self, record: RevenueShareRecord) -> DomainResult<()>;
    async fn payments_for(&self, transaction_id: i32) -> DomainResult<Vec<PaymentRecord>>;
    async fn revenue_shares_for(&self, transaction_id: i32)
        -> DomainResult<Vec<RevenueShareRecord>>;

    /// Current flat price per kWh, if one has been stored.
    async fn current_tariff(&self) -> DomainResult<Option<i64>>;
    async fn set_tariff(&self, price_per_kwh: i64) -> DomainResult<()>;
}
