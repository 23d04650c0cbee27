//! In-memory session store

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::{
    DomainError, DomainResult, PaymentRecord, PaymentStatus, RevenueShareRecord, SessionStore,
    Transaction,
};

const NO_TARIFF: i64 = -1;

/// Session records, payment history and tariff held in process memory
pub struct InMemorySessionStore {
    sessions: DashMap<i32, Transaction>,
    payments: DashMap<i32, Vec<PaymentRecord>>,
    revenue_shares: DashMap<i32, Vec<RevenueShareRecord>>,
    transaction_counter: AtomicI32,
    tariff: AtomicI64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            payments: DashMap::new(),
            revenue_shares: DashMap::new(),
            transaction_counter: AtomicI32::new(1),
            tariff: AtomicI64::new(NO_TARIFF),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn next_transaction_id(&self) -> DomainResult<i32> {
        let id = self.transaction_counter.fetch_add(1, Ordering::SeqCst);
        if id <= 0 {
            return Err(DomainError::Storage("transaction id space exhausted".into()));
        }
        Ok(id)
    }

    async fn create_session(&self, transaction: &Transaction) -> DomainResult<()> {
        match self.sessions.entry(transaction.id) {
            Entry::Occupied(_) => Err(DomainError::Conflict(format!(
                "Session {} already exists",
                transaction.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(transaction.clone());
                Ok(())
            }
        }
    }

    /// Payment fields belong to settlement and are kept from the stored
    /// record; a closed session is never reopened by a late update.
    async fn update_session(&self, transaction: &Transaction) -> DomainResult<()> {
        let mut stored = self
            .sessions
            .get_mut(&transaction.id)
            .ok_or_else(|| DomainError::not_found("Session", "transaction_id", transaction.id))?;

        if !stored.is_active() && transaction.is_active() {
            return Ok(());
        }

        let payment_status = stored.payment_status;
        let cost = stored.cost;
        *stored = transaction.clone();
        stored.payment_status = payment_status;
        stored.cost = cost;
        Ok(())
    }

    async fn get_session(&self, id: i32) -> DomainResult<Option<Transaction>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn transition_payment_status(
        &self,
        id: i32,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> DomainResult<bool> {
        let mut stored = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("Session", "transaction_id", id))?;
        if stored.payment_status != from {
            return Ok(false);
        }
        stored.payment_status = to;
        Ok(true)
    }

    async fn set_payment_status(
        &self,
        id: i32,
        status: PaymentStatus,
        cost: Option<i64>,
    ) -> DomainResult<()> {
        let mut stored = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("Session", "transaction_id", id))?;
        stored.payment_status = status;
        if cost.is_some() {
            stored.cost = cost;
        }
        Ok(())
    }

    async fn append_payment(&self, record: PaymentRecord) -> DomainResult<()> {
        self.payments
            .entry(record.transaction_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn append_revenue_share(&self, record: RevenueShareRecord) -> DomainResult<()> {
        self.revenue_shares
            .entry(record.transaction_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn payments_for(&self, transaction_id: i32) -> DomainResult<Vec<PaymentRecord>> {
        Ok(self
            .payments
            .get(&transaction_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn revenue_shares_for(
        &self,
        transaction_id: i32,
    ) -> DomainResult<Vec<RevenueShareRecord>> {
        Ok(self
            .revenue_shares
            .get(&transaction_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn current_tariff(&self) -> DomainResult<Option<i64>> {
        let price = self.tariff.load(Ordering::SeqCst);
        Ok((price != NO_TARIFF).then_some(price))
    }

    async fn set_tariff(&self, price_per_kwh: i64) -> DomainResult<()> {
        if price_per_kwh < 0 {
            return Err(DomainError::Validation(format!(
                "price per kWh must not be negative, got {}",
                price_per_kwh
            )));
        }
        self.tariff.store(price_per_kwh, Ordering::SeqCst);
        Ok(())
    }
}
