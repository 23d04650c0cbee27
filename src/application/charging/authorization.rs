//! Charging authorization
//!
//! A StartTransaction runs through:
//!
//! ```text
//! Requested ─► IdentityChecked ─► BalanceChecked ─► AwaitingUserConfirmation
//!                                                        │
//!                                 Confirmed / Rejected / TimedOut
//!                                                        │
//!                                               Started / Blocked
//! ```
//!
//! The connector claim is taken synchronously in the station's read loop so
//! a second start for the same connector is refused immediately; the rest
//! runs in a spawned task because the confirmation wait can take up to the
//! configured timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::ledger::{OpenTransaction, SharedTransactionLedger};
use crate::application::billing::{estimate_max_cost, SharedPriceBook};
use crate::application::session::{ClaimRejection, SharedStationRegistry};
use crate::config::ChargingConfig;
use crate::domain::{
    ChargingConfirmationRequest, ConfirmationChannel, ConfirmationStatus, DomainError, Notifier,
    UserNotification, WalletStore,
};

/// A station's request to start charging
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
}

/// Why a start was refused with `Blocked`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    InsufficientBalance { balance: i64, required: i64 },
    Declined,
    TimedOut,
    StationOffline,
    ConnectorUnavailable,
}

/// Final answer to a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartVerdict {
    Accepted { transaction_id: i32 },
    Blocked(BlockReason),
    /// Connector already bound or a start is in flight
    ConcurrentTx,
    /// Unknown identity or an unexpected failure
    Invalid,
}

impl StartVerdict {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Blocked(BlockReason::InsufficientBalance { .. }) => "insufficient_balance",
            Self::Blocked(BlockReason::Declined) => "declined",
            Self::Blocked(BlockReason::TimedOut) => "timed_out",
            Self::Blocked(_) => "blocked",
            Self::ConcurrentTx => "concurrent_tx",
            Self::Invalid => "invalid",
        }
    }

    pub fn transaction_id(&self) -> i32 {
        match self {
            Self::Accepted { transaction_id } => *transaction_id,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationSettings {
    pub confirmation_timeout: Duration,
    pub average_power_kw: f64,
    pub max_hours: f64,
}

impl From<&ChargingConfig> for AuthorizationSettings {
    fn from(cfg: &ChargingConfig) -> Self {
        Self {
            confirmation_timeout: cfg.confirmation_timeout(),
            average_power_kw: cfg.estimate_average_power_kw,
            max_hours: cfg.estimate_max_hours,
        }
    }
}

pub struct ChargingAuthorizer {
    registry: SharedStationRegistry,
    ledger: SharedTransactionLedger,
    wallets: Arc<dyn WalletStore>,
    confirmations: Arc<dyn ConfirmationChannel>,
    notifier: Arc<dyn Notifier>,
    prices: SharedPriceBook,
    settings: AuthorizationSettings,
}

pub type SharedChargingAuthorizer = Arc<ChargingAuthorizer>;

impl ChargingAuthorizer {
    pub fn new(
        registry: SharedStationRegistry,
        ledger: SharedTransactionLedger,
        wallets: Arc<dyn WalletStore>,
        confirmations: Arc<dyn ConfirmationChannel>,
        notifier: Arc<dyn Notifier>,
        prices: SharedPriceBook,
        settings: AuthorizationSettings,
    ) -> Self {
        Self {
            registry,
            ledger,
            wallets,
            confirmations,
            notifier,
            prices,
            settings,
        }
    }

    /// Reserve the target connector for the station's current connection.
    /// Must be called in the station's read loop, before
    /// [`authorize`](Self::authorize) is spawned with the returned claim.
    pub fn claim(&self, request: &StartRequest) -> Result<u64, StartVerdict> {
        self.registry
            .claim_connector(&request.charge_point_id, request.connector_id)
            .map_err(|rejection| {
                warn!(
                    charge_point_id = request.charge_point_id.as_str(),
                    connector_id = request.connector_id,
                    ?rejection,
                    "Connector claim rejected"
                );
                let verdict = match rejection {
                    ClaimRejection::Busy { .. } => StartVerdict::ConcurrentTx,
                    ClaimRejection::UnknownStation | ClaimRejection::StationOffline => {
                        StartVerdict::Blocked(BlockReason::StationOffline)
                    }
                    ClaimRejection::UnknownConnector(_) | ClaimRejection::Unavailable(_) => {
                        StartVerdict::Blocked(BlockReason::ConnectorUnavailable)
                    }
                };
                record(&verdict);
                verdict
            })
    }

    /// Claim then authorize, for callers that do not split the two steps.
    pub async fn start(&self, request: StartRequest) -> StartVerdict {
        match self.claim(&request) {
            Ok(claim) => self.authorize(request, claim).await,
            Err(verdict) => verdict,
        }
    }

    /// Run the authorization handshake for a claimed connector. The claim is
    /// released on every outcome except `Accepted`.
    pub async fn authorize(&self, request: StartRequest, claim: u64) -> StartVerdict {
        let verdict = self.run(&request, claim).await;

        if !matches!(verdict, StartVerdict::Accepted { .. }) {
            self.registry
                .release_claim(&request.charge_point_id, request.connector_id, claim);
        }

        info!(
            charge_point_id = request.charge_point_id.as_str(),
            connector_id = request.connector_id,
            id_tag = request.id_tag.as_str(),
            outcome = verdict.outcome(),
            transaction_id = verdict.transaction_id(),
            "Start request resolved"
        );
        record(&verdict);
        verdict
    }

    async fn run(&self, request: &StartRequest, claim: u64) -> StartVerdict {
        let id_tag = request.id_tag.as_str();

        // Identity
        match self.wallets.get_user(id_tag).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(id_tag, "Unknown idTag");
                return StartVerdict::Invalid;
            }
            Err(e) => {
                error!(id_tag, error = %e, "Identity lookup failed");
                return StartVerdict::Invalid;
            }
        }

        // Balance pre-check against the worst-case session cost
        let price = self.prices.current();
        let Some(estimate) =
            estimate_max_cost(self.settings.average_power_kw, self.settings.max_hours, price)
        else {
            error!(id_tag, price, "Session cost estimate overflowed");
            return StartVerdict::Invalid;
        };
        let balance = match self.wallets.get_balance(id_tag).await {
            Ok(b) => b,
            Err(e) => {
                error!(id_tag, error = %e, "Balance lookup failed");
                return StartVerdict::Invalid;
            }
        };
        if balance < estimate {
            let shortfall = estimate - balance;
            info!(id_tag, balance, estimate, shortfall, "Insufficient balance for start");
            self.notifier.notify(
                id_tag,
                UserNotification::InsufficientBalance {
                    charge_point_id: request.charge_point_id.clone(),
                    connector_id: request.connector_id,
                    balance,
                    required: estimate,
                    shortfall,
                },
            );
            return StartVerdict::Blocked(BlockReason::InsufficientBalance {
                balance,
                required: estimate,
            });
        }

        // User confirmation
        let pending = ChargingConfirmationRequest::pending(
            id_tag,
            request.charge_point_id.as_str(),
            request.connector_id,
            estimate,
        );
        if let Err(e) = self.confirmations.publish_pending(pending.clone()).await {
            error!(id_tag, error = %e, "Failed to publish confirmation request");
            return StartVerdict::Invalid;
        }

        let decision = tokio::time::timeout(
            self.settings.confirmation_timeout,
            self.confirmations.wait_for_decision(&pending),
        )
        .await;

        if let Err(e) = self.confirmations.discard(&pending).await {
            warn!(id_tag, error = %e, "Failed to discard confirmation request");
        }

        match decision {
            Ok(Ok(ConfirmationStatus::Accepted)) => {}
            Ok(Ok(status)) => {
                info!(id_tag, ?status, "Charging declined by user");
                return StartVerdict::Blocked(BlockReason::Declined);
            }
            Ok(Err(e)) => {
                error!(id_tag, error = %e, "Confirmation channel failed");
                return StartVerdict::Invalid;
            }
            Err(_) => {
                info!(
                    id_tag,
                    timeout_secs = self.settings.confirmation_timeout.as_secs(),
                    "Confirmation timed out"
                );
                return StartVerdict::Blocked(BlockReason::TimedOut);
            }
        }

        // The connection that asked must still be the one holding the claim.
        // `open` re-checks this atomically when binding.
        if !self
            .registry
            .holds_claim(&request.charge_point_id, request.connector_id, claim)
        {
            warn!(
                charge_point_id = request.charge_point_id.as_str(),
                connection_id = claim,
                "Requesting connection went away while awaiting confirmation"
            );
            return StartVerdict::Blocked(BlockReason::StationOffline);
        }

        // Start
        let opened = self
            .ledger
            .open(OpenTransaction {
                charge_point_id: request.charge_point_id.clone(),
                connector_id: request.connector_id,
                claim,
                id_tag: request.id_tag.clone(),
                meter_start: request.meter_start,
                started_at: request.timestamp,
                estimated_cost: Some(estimate),
            })
            .await;

        match opened {
            Ok(tx) => StartVerdict::Accepted {
                transaction_id: tx.id,
            },
            Err(DomainError::StationOffline(_)) => {
                warn!(
                    charge_point_id = request.charge_point_id.as_str(),
                    connection_id = claim,
                    "Requesting connection went away before the transaction was bound"
                );
                StartVerdict::Blocked(BlockReason::StationOffline)
            }
            Err(e) => {
                error!(
                    charge_point_id = request.charge_point_id.as_str(),
                    connector_id = request.connector_id,
                    error = %e,
                    "Failed to open transaction"
                );
                StartVerdict::Invalid
            }
        }
    }
}

fn record(verdict: &StartVerdict) {
    metrics::counter!("csms_authorizations_total", "outcome" => verdict.outcome()).increment(1);
}

// ── Tests ──────────────────────────────────────────────────────
