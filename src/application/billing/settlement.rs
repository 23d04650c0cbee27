//! Settlement engine
//!
//! Turns a closed transaction into a payer debit plus an owner/platform
//! revenue split. Runs off the protocol path: the StopTransaction answer
//! never waits on it.
//!
//! Each transaction is settled at most once: the engine claims it by moving
//! its payment status `pending -> processing` in the session store, so a
//! replayed stop or a concurrent trigger cannot debit twice. Every wallet
//! movement runs under the affected account's lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::locks::AccountLocks;
use super::pricing::{energy_cost, SharedPriceBook};
use crate::application::session::SharedStationRegistry;
use crate::config::BillingConfig;
use crate::domain::{
    DomainError, Notifier, PaymentRecord, PaymentRecordStatus, PaymentStatus, PaymentType,
    RevenueShare, RevenueShareRecord, SessionStore, Transaction, UserNotification, WalletStore,
};
use crate::shared::{retry_with_backoff, RetryConfig};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Session {0} not found")]
    SessionMissing(i32),
    #[error("Session {0} has no payer")]
    PayerMissing(i32),
    #[error("Session {0} is still active")]
    SessionActive(i32),
    #[error("Invalid cost {cost} for {energy_wh} Wh")]
    InvalidCost { cost: i64, energy_wh: i64 },
    #[error("Insufficient balance: {balance} < {required}")]
    InsufficientBalance { balance: i64, required: i64 },
    #[error("Transaction {transaction_id} cannot be refunded: {reason}")]
    RefundRejected { transaction_id: i32, reason: String },
    #[error("Wallet error: {0}")]
    Wallet(DomainError),
    #[error("Storage error: {0}")]
    Storage(#[from] DomainError),
}

impl SettlementError {
    fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::InsufficientBalance { .. } | Self::InvalidCost { .. } | Self::PayerMissing(_) => {
                PaymentStatus::Failed
            }
            _ => PaymentStatus::Error,
        }
    }
}

/// What happened to a transaction handed to [`SettlementEngine::settle`]
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Paid {
        cost: i64,
        new_balance: i64,
        revenue_share: Option<RevenueShareRecord>,
    },
    /// Nothing to charge
    Free,
    /// Another settlement already claimed this transaction
    AlreadySettled(PaymentStatus),
}

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub commission_rate: Decimal,
    pub platform_account_id: String,
    pub retry_delay: Duration,
    pub max_cost_per_kwh: i64,
}

impl From<&BillingConfig> for SettlementSettings {
    fn from(cfg: &BillingConfig) -> Self {
        let commission_rate = cfg
            .commission_rate
            .to_string()
            .parse::<Decimal>()
            .ok()
            .or_else(|| Decimal::from_f64_retain(cfg.commission_rate))
            .unwrap_or_default();
        Self {
            commission_rate,
            platform_account_id: cfg.platform_account_id.clone(),
            retry_delay: cfg.settlement_retry_delay(),
            max_cost_per_kwh: cfg.max_cost_per_kwh,
        }
    }
}

/// Split `cost` into `(commission, owner_amount)`. The commission is rounded
/// half away from zero and the owner takes the remainder, so both always sum
/// to `cost`.
pub fn split_revenue(cost: i64, commission_rate: Decimal) -> (i64, i64) {
    let commission = (Decimal::from(cost) * commission_rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
        .clamp(0, cost.max(0));
    (commission, cost - commission)
}

pub struct SettlementEngine {
    sessions: Arc<dyn SessionStore>,
    wallets: Arc<dyn WalletStore>,
    registry: SharedStationRegistry,
    prices: SharedPriceBook,
    notifier: Arc<dyn Notifier>,
    locks: Arc<AccountLocks>,
    settings: SettlementSettings,
}

pub type SharedSettlementEngine = Arc<SettlementEngine>;

impl SettlementEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        wallets: Arc<dyn WalletStore>,
        registry: SharedStationRegistry,
        prices: SharedPriceBook,
        notifier: Arc<dyn Notifier>,
        locks: Arc<AccountLocks>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            sessions,
            wallets,
            registry,
            prices,
            notifier,
            locks,
            settings,
        }
    }

    /// Settle in the background.
    pub fn schedule(self: &Arc<Self>, transaction_id: i32) -> JoinHandle<Result<SettlementOutcome, SettlementError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.settle(transaction_id).await })
    }

    pub async fn settle(&self, transaction_id: i32) -> Result<SettlementOutcome, SettlementError> {
        let result = self.try_settle(transaction_id).await;

        let outcome_label = match &result {
            Ok(SettlementOutcome::Paid { .. }) => "paid",
            Ok(SettlementOutcome::Free) => "free",
            Ok(SettlementOutcome::AlreadySettled(_)) => "duplicate",
            Err(e) if e.payment_status() == PaymentStatus::Failed => "failed",
            Err(_) => "error",
        };
        metrics::counter!("csms_settlements_total", "outcome" => outcome_label).increment(1);

        result
    }

    async fn try_settle(&self, transaction_id: i32) -> Result<SettlementOutcome, SettlementError> {
        let session = self.load_session(transaction_id).await?;
        if session.is_active() {
            return Err(SettlementError::SessionActive(transaction_id));
        }

        let claimed = self
            .sessions
            .transition_payment_status(transaction_id, PaymentStatus::Pending, PaymentStatus::Processing)
            .await?;
        if !claimed {
            let current = self
                .sessions
                .get_session(transaction_id)
                .await?
                .map(|s| s.payment_status)
                .unwrap_or(session.payment_status);
            info!(transaction_id, status = current.as_str(), "Already settled, skipping");
            return Ok(SettlementOutcome::AlreadySettled(current));
        }

        match self.charge(&session).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let status = e.payment_status();
                error!(transaction_id, error = %e, status = status.as_str(), "Settlement failed");
                if let Err(store_err) = self
                    .sessions
                    .set_payment_status(transaction_id, status, None)
                    .await
                {
                    error!(transaction_id, error = %store_err, "Failed to record settlement failure");
                }
                self.notify_failure(&session, &e);
                Err(e)
            }
        }
    }

    /// Read the closed session, allowing one retry for a record that is not visible yet.
    async fn load_session(&self, transaction_id: i32) -> Result<Transaction, SettlementError> {
        retry_with_backoff(
            RetryConfig::once_after(self.settings.retry_delay),
            || async move {
                self.sessions
                    .get_session(transaction_id)
                    .await?
                    .ok_or(SettlementError::SessionMissing(transaction_id))
            },
            |e| matches!(e, SettlementError::SessionMissing(_)),
            "load_session",
        )
        .await
    }

    async fn charge(&self, session: &Transaction) -> Result<SettlementOutcome, SettlementError> {
        let transaction_id = session.id;
        let payer = session.id_tag.trim();
        if payer.is_empty() {
            return Err(SettlementError::PayerMissing(transaction_id));
        }

        let energy_wh = session.energy_consumed_wh;
        let price = self.prices.current();
        let cost = energy_cost(energy_wh, price).ok_or(SettlementError::InvalidCost {
            cost: i64::MAX,
            energy_wh,
        })?;
        self.validate_cost(cost, energy_wh)?;

        if cost == 0 {
            self.sessions
                .set_payment_status(transaction_id, PaymentStatus::Paid, Some(0))
                .await?;
            info!(transaction_id, energy_wh, "Zero-cost session settled");
            self.notifier.notify(
                payer,
                UserNotification::PaymentSuccess {
                    transaction_id,
                    amount: 0,
                    new_balance: self.wallets.get_balance(payer).await.unwrap_or_default(),
                    energy_consumed_wh: energy_wh,
                },
            );
            return Ok(SettlementOutcome::Free);
        }

        let (previous_balance, new_balance) = self.debit_payer(session, payer, cost).await?;

        // The money has moved; a lost status write must not turn into a failure
        if let Err(e) = self
            .sessions
            .set_payment_status(transaction_id, PaymentStatus::Paid, Some(cost))
            .await
        {
            error!(transaction_id, cost, error = %e, "Debited but failed to mark session paid");
        }

        info!(
            transaction_id,
            id_tag = payer,
            cost,
            price_per_kwh = price,
            energy_wh,
            previous_balance,
            new_balance,
            "Payment settled"
        );

        let revenue_share = self.share_revenue(session, cost).await;

        self.notifier.notify(
            payer,
            UserNotification::PaymentSuccess {
                transaction_id,
                amount: cost,
                new_balance,
                energy_consumed_wh: energy_wh,
            },
        );

        Ok(SettlementOutcome::Paid {
            cost,
            new_balance,
            revenue_share,
        })
    }

    fn validate_cost(&self, cost: i64, energy_wh: i64) -> Result<(), SettlementError> {
        let ceiling = energy_cost(energy_wh, self.settings.max_cost_per_kwh).unwrap_or(i64::MAX);
        if cost < 0 || cost > ceiling {
            return Err(SettlementError::InvalidCost { cost, energy_wh });
        }
        Ok(())
    }

    /// Check-then-debit under the payer's lock. Returns `(previous, new)` balance.
    async fn debit_payer(
        &self,
        session: &Transaction,
        payer: &str,
        cost: i64,
    ) -> Result<(i64, i64), SettlementError> {
        let _guard = self.locks.lock(payer).await;

        let balance = self.wallets.get_balance(payer).await.map_err(SettlementError::Wallet)?;
        if balance < cost {
            self.record_payment(
                session,
                payer,
                PaymentType::Payment,
                cost,
                balance,
                balance,
                PaymentRecordStatus::Failed,
                Some("insufficient balance".to_string()),
            )
            .await;
            return Err(SettlementError::InsufficientBalance {
                balance,
                required: cost,
            });
        }

        let new_balance = match self.wallets.adjust_balance(payer, -cost).await {
            Ok(b) => b,
            Err(DomainError::InsufficientBalance { balance, required, .. }) => {
                return Err(SettlementError::InsufficientBalance { balance, required });
            }
            Err(e) => return Err(SettlementError::Wallet(e)),
        };

        self.record_payment(
            session,
            payer,
            PaymentType::Payment,
            cost,
            balance,
            new_balance,
            PaymentRecordStatus::Completed,
            None,
        )
        .await;

        Ok((balance, new_balance))
    }

    /// Credit owner and platform. Failures are logged and never undo the debit.
    async fn share_revenue(&self, session: &Transaction, cost: i64) -> Option<RevenueShareRecord> {
        let transaction_id = session.id;

        let owner_id = match self.resolve_owner(&session.charge_point_id).await {
            Some(owner) => owner,
            None => {
                warn!(
                    transaction_id,
                    charge_point_id = session.charge_point_id.as_str(),
                    "No owner account for station, skipping revenue share"
                );
                return None;
            }
        };

        let (commission, owner_amount) = split_revenue(cost, self.settings.commission_rate);
        let platform_id = self.settings.platform_account_id.as_str();

        if let Err(e) = self.credit(&owner_id, owner_amount).await {
            error!(transaction_id, owner_id = owner_id.as_str(), error = %e, "Owner credit failed");
            return None;
        }
        if let Err(e) = self.credit(platform_id, commission).await {
            error!(transaction_id, error = %e, "Platform credit failed");
        }

        let record = RevenueShareRecord {
            id: Uuid::new_v4().to_string(),
            transaction_id,
            charge_point_id: session.charge_point_id.clone(),
            connector_id: session.connector_id,
            total: cost,
            commission: RevenueShare {
                amount: commission,
                rate: self.settings.commission_rate,
                recipient: platform_id.to_string(),
            },
            owner: RevenueShare {
                amount: owner_amount,
                rate: Decimal::ONE - self.settings.commission_rate,
                recipient: owner_id.clone(),
            },
            timestamp: Utc::now(),
        };

        if let Err(e) = self.sessions.append_revenue_share(record.clone()).await {
            error!(transaction_id, error = %e, "Failed to record revenue share");
        }

        info!(
            transaction_id,
            owner_id = owner_id.as_str(),
            owner_amount,
            commission,
            "Revenue shared"
        );
        Some(record)
    }

    async fn resolve_owner(&self, charge_point_id: &str) -> Option<String> {
        let owner_id = self.registry.owner_of(charge_point_id)?;
        match self.wallets.get_user(&owner_id).await {
            Ok(Some(user)) if user.is_owner() => Some(user.id),
            Ok(Some(_)) => {
                warn!(charge_point_id, owner_id = owner_id.as_str(), "Station owner lacks owner role");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(charge_point_id, error = %e, "Owner lookup failed");
                None
            }
        }
    }

    async fn credit(&self, account_id: &str, amount: i64) -> Result<i64, DomainError> {
        if amount == 0 {
            return self.wallets.get_balance(account_id).await;
        }
        let _guard = self.locks.lock(account_id).await;
        self.wallets.adjust_balance(account_id, amount).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_payment(
        &self,
        session: &Transaction,
        user_id: &str,
        kind: PaymentType,
        amount: i64,
        previous_balance: i64,
        new_balance: i64,
        status: PaymentRecordStatus,
        reason: Option<String>,
    ) {
        let record = PaymentRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            amount,
            previous_balance,
            new_balance,
            user_id: user_id.to_string(),
            transaction_id: session.id,
            charge_point_id: session.charge_point_id.clone(),
            connector_id: session.connector_id,
            status,
            reason,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sessions.append_payment(record).await {
            error!(transaction_id = session.id, error = %e, "Failed to record payment");
        }
    }

    fn notify_failure(&self, session: &Transaction, err: &SettlementError) {
        let payer = session.id_tag.trim();
        if payer.is_empty() {
            return;
        }
        let notification = match err {
            SettlementError::InsufficientBalance { balance, required } => {
                UserNotification::PaymentFailed {
                    transaction_id: session.id,
                    amount: *required,
                    balance: Some(*balance),
                    reason: err.to_string(),
                }
            }
            SettlementError::InvalidCost { cost, .. } => UserNotification::PaymentFailed {
                transaction_id: session.id,
                amount: *cost,
                balance: None,
                reason: err.to_string(),
            },
            _ => UserNotification::PaymentError {
                transaction_id: session.id,
                reason: err.to_string(),
            },
        };
        self.notifier.notify(payer, notification);
    }

    // ── Refunds ────────────────────────────────────────────

    /// Credit back a paid transaction, by default its full cost.
    pub async fn refund(&self, transaction_id: i32, amount: Option<i64>) -> Result<i64, SettlementError> {
        let session = self
            .sessions
            .get_session(transaction_id)
            .await?
            .ok_or(SettlementError::SessionMissing(transaction_id))?;

        let paid = session.cost.unwrap_or(0);
        let amount = amount.unwrap_or(paid);
        let reject = |reason: &str| SettlementError::RefundRejected {
            transaction_id,
            reason: reason.to_string(),
        };

        if amount <= 0 || amount > paid {
            return Err(reject("amount must be positive and at most the paid cost"));
        }

        let claimed = self
            .sessions
            .transition_payment_status(transaction_id, PaymentStatus::Paid, PaymentStatus::Processing)
            .await?;
        if !claimed {
            return Err(reject("transaction is not paid"));
        }

        let payer = session.id_tag.trim();
        let credited = {
            let _guard = self.locks.lock(payer).await;
            match self.wallets.get_balance(payer).await {
                Ok(previous) => self
                    .wallets
                    .adjust_balance(payer, amount)
                    .await
                    .map(|new_balance| (previous, new_balance)),
                Err(e) => Err(e),
            }
        };

        let (previous_balance, new_balance) = match credited {
            Ok(balances) => balances,
            Err(e) => {
                self.sessions
                    .set_payment_status(transaction_id, PaymentStatus::Paid, session.cost)
                    .await?;
                return Err(SettlementError::Wallet(e));
            }
        };

        self.record_payment(
            &session,
            payer,
            PaymentType::Refund,
            amount,
            previous_balance,
            new_balance,
            PaymentRecordStatus::Completed,
            None,
        )
        .await;
        self.sessions
            .set_payment_status(transaction_id, PaymentStatus::Refunded, session.cost)
            .await?;

        info!(transaction_id, id_tag = payer, amount, new_balance, "Refund issued");
        Ok(new_balance)
    }
}

// ── Tests ──────────────────────────────────────────────────────
