//! Transaction ledger
//!
//! Opens, updates and closes transaction records. Active transactions are
//! kept in a hot cache so meter samples do not round-trip through the
//! session store; every state change is still written through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::billing::{SettlementError, SettlementOutcome, SharedSettlementEngine};
use crate::application::events::{Event, SharedEventBus, TransactionStartedEvent, TransactionStoppedEvent};
use crate::application::session::SharedStationRegistry;
use crate::domain::{
    ConnectorStatus, DomainError, DomainResult, LiveStateMirror, LiveStateUpdate, MeterSample,
    SessionStore, StopReason, Transaction,
};

pub type SettlementHandle = JoinHandle<Result<SettlementOutcome, SettlementError>>;

/// Parameters of a transaction about to start
#[derive(Debug, Clone)]
pub struct OpenTransaction {
    pub charge_point_id: String,
    pub connector_id: u32,
    /// Token returned by the connector claim
    pub claim: u64,
    pub id_tag: String,
    pub meter_start: i32,
    pub started_at: DateTime<Utc>,
    pub estimated_cost: Option<i64>,
}

#[derive(Debug)]
pub enum StopOutcome {
    /// Closed now; settlement runs in the background
    Closed {
        transaction: Transaction,
        settlement: SettlementHandle,
    },
    /// A replayed stop for a transaction that is already closed
    AlreadyClosed(Transaction),
}

pub struct TransactionLedger {
    active: DashMap<i32, Transaction>,
    sessions: Arc<dyn SessionStore>,
    registry: SharedStationRegistry,
    settlement: SharedSettlementEngine,
    mirror: Arc<dyn LiveStateMirror>,
    events: SharedEventBus,
}

pub type SharedTransactionLedger = Arc<TransactionLedger>;

impl TransactionLedger {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        registry: SharedStationRegistry,
        settlement: SharedSettlementEngine,
        mirror: Arc<dyn LiveStateMirror>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            active: DashMap::new(),
            sessions,
            registry,
            settlement,
            mirror,
            events,
        }
    }

    /// Create an Active transaction and bind it to its claimed connector.
    /// Fails if the claim was lost to a disconnect in the meantime.
    pub async fn open(&self, params: OpenTransaction) -> DomainResult<Transaction> {
        let transaction_id = self.sessions.next_transaction_id().await?;

        let mut transaction = Transaction::new(
            transaction_id,
            params.charge_point_id.as_str(),
            params.connector_id,
            params.id_tag.as_str(),
            params.meter_start,
            params.started_at,
        );
        transaction.estimated_cost = params.estimated_cost;

        self.registry
            .bind_transaction(
                &params.charge_point_id,
                params.connector_id,
                params.claim,
                transaction_id,
            )?;

        if let Err(e) = self.sessions.create_session(&transaction).await {
            self.registry.unbind_transaction(
                &params.charge_point_id,
                transaction_id,
                Some(ConnectorStatus::Available),
            );
            return Err(e);
        }

        self.active.insert(transaction_id, transaction.clone());
        metrics::counter!("csms_transactions_started_total").increment(1);

        info!(
            charge_point_id = params.charge_point_id.as_str(),
            connector_id = params.connector_id,
            transaction_id,
            id_tag = params.id_tag.as_str(),
            meter_start = params.meter_start,
            "Transaction started"
        );

        self.mirror_connector(&params.charge_point_id, params.connector_id, ConnectorStatus::Charging);
        self.events.publish(Event::TransactionStarted(TransactionStartedEvent {
            charge_point_id: params.charge_point_id,
            connector_id: params.connector_id,
            transaction_id,
            id_tag: params.id_tag,
            meter_start: params.meter_start,
            timestamp: params.started_at,
        }));

        Ok(transaction)
    }

    /// Close a transaction reported by the station (or forced by the server)
    /// and schedule its settlement.
    pub async fn stop(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
        meter_stop: i32,
        stopped_at: DateTime<Utc>,
        reason: StopReason,
    ) -> DomainResult<StopOutcome> {
        let mut transaction = match self.take_active(charge_point_id, transaction_id)? {
            Some(tx) => tx,
            None => match self.sessions.get_session(transaction_id).await? {
                Some(tx) if tx.charge_point_id != charge_point_id => {
                    return Err(DomainError::Validation(format!(
                        "Transaction {} does not belong to {}",
                        transaction_id, charge_point_id
                    )));
                }
                Some(tx) if !tx.is_active() => {
                    info!(charge_point_id, transaction_id, "Stop replayed for closed transaction");
                    return Ok(StopOutcome::AlreadyClosed(tx));
                }
                Some(tx) => tx,
                None => return Err(DomainError::not_found("Transaction", "id", transaction_id)),
            },
        };

        // A station answering our cutoff's RemoteStop reports it as its own stop.
        let reason = match reason {
            StopReason::Reported(_) if transaction.stopped_by_system => StopReason::StoppedBySystem,
            other => other,
        };

        if transaction.close(meter_stop, stopped_at, reason.clone()) {
            warn!(
                charge_point_id,
                transaction_id,
                meter_start = transaction.meter_start,
                meter_stop,
                "meterStop below meterStart, clamped"
            );
        }

        let status_after = match reason {
            StopReason::StationDisconnected => None,
            _ => Some(ConnectorStatus::Available),
        };
        if let Some(connector_id) =
            self.registry
                .unbind_transaction(charge_point_id, transaction_id, status_after)
        {
            if let Some(status) = status_after {
                self.mirror_connector(charge_point_id, connector_id, status);
            }
        }

        self.sessions.update_session(&transaction).await?;

        let reason_label = reason.to_string();
        metrics::counter!("csms_transactions_stopped_total", "reason" => reason_label.clone())
            .increment(1);

        info!(
            charge_point_id,
            transaction_id,
            connector_id = transaction.connector_id,
            energy_wh = transaction.energy_consumed_wh,
            duration_secs = transaction.duration_secs,
            reason = reason_label.as_str(),
            "Transaction stopped"
        );

        self.events.publish(Event::TransactionStopped(TransactionStoppedEvent {
            charge_point_id: charge_point_id.to_string(),
            connector_id: transaction.connector_id,
            transaction_id,
            id_tag: transaction.id_tag.clone(),
            meter_stop: transaction.meter_stop.unwrap_or(transaction.meter_start),
            energy_consumed_wh: transaction.energy_consumed_wh,
            reason: reason_label,
            timestamp: stopped_at,
        }));

        let settlement = self.settlement.schedule(transaction_id);
        Ok(StopOutcome::Closed {
            transaction,
            settlement,
        })
    }

    /// Close a transaction whose station went away, using the last meter
    /// reading received.
    pub async fn force_stop(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> DomainResult<StopOutcome> {
        let meter_stop = match self.active.get(&transaction_id) {
            Some(tx) => tx.last_known_meter(),
            None => self
                .sessions
                .get_session(transaction_id)
                .await?
                .map(|tx| tx.last_known_meter())
                .unwrap_or_default(),
        };
        self.stop(
            charge_point_id,
            transaction_id,
            meter_stop,
            Utc::now(),
            StopReason::StationDisconnected,
        )
        .await
    }

    /// Apply meter samples to an active transaction running on
    /// `charge_point_id` (and `connector_id`, when the caller knows it).
    /// Returns the updated snapshot, or `None` if no such transaction is
    /// active there.
    pub async fn record_meter(
        &self,
        charge_point_id: &str,
        connector_id: Option<u32>,
        transaction_id: i32,
        samples: &[MeterSample],
    ) -> Option<Transaction> {
        let snapshot = {
            let mut tx = self.active.get_mut(&transaction_id)?;
            let owned = tx.charge_point_id == charge_point_id
                && connector_id.map_or(true, |c| c == tx.connector_id);
            if !owned {
                warn!(
                    charge_point_id,
                    connector_id,
                    transaction_id,
                    "Meter values for a transaction running elsewhere, ignored"
                );
                return None;
            }
            for sample in samples {
                tx.record_sample(sample.clone());
            }
            tx.clone()
        };

        if let Err(e) = self.sessions.update_session(&snapshot).await {
            error!(transaction_id, error = %e, "Failed to persist meter update");
        }
        Some(snapshot)
    }

    /// Flag an active transaction as cut off for low balance. Returns `true`
    /// only for the first caller.
    pub fn mark_stopped_by_system(&self, transaction_id: i32) -> bool {
        match self.active.get_mut(&transaction_id) {
            Some(mut tx) if !tx.stopped_by_system => {
                tx.stopped_by_system = true;
                true
            }
            _ => false,
        }
    }

    /// Whether `transaction_id` is active on this station and connector.
    pub fn is_running_on(&self, transaction_id: i32, charge_point_id: &str, connector_id: u32) -> bool {
        self.active
            .get(&transaction_id)
            .is_some_and(|tx| tx.charge_point_id == charge_point_id && tx.connector_id == connector_id)
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.active.get(&transaction_id).map(|tx| tx.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn take_active(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
    ) -> DomainResult<Option<Transaction>> {
        let removed = self
            .active
            .remove_if(&transaction_id, |_, tx| tx.charge_point_id == charge_point_id);
        match removed {
            Some((_, tx)) => Ok(Some(tx)),
            None if self.active.contains_key(&transaction_id) => Err(DomainError::Validation(
                format!(
                    "Transaction {} does not belong to {}",
                    transaction_id, charge_point_id
                ),
            )),
            None => Ok(None),
        }
    }

    fn mirror_connector(&self, charge_point_id: &str, connector_id: u32, status: ConnectorStatus) {
        self.mirror.publish(LiveStateUpdate::ConnectorStatus {
            charge_point_id: charge_point_id.to_string(),
            connector_id,
            status: status.to_string(),
            error_code: None,
            timestamp: Utc::now(),
        });
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PaymentStatus, TransactionStatus};
    use crate::test_support::Harness;

    fn open_params(claim: u64, meter_start: i32) -> OpenTransaction {
        OpenTransaction {
            charge_point_id: "CP001".into(),
            connector_id: 1,
            claim,
            id_tag: "driver-1".into(),
            meter_start,
            started_at: Utc::now(),
            estimated_cost: Some(50_000),
        }
    }

    #[tokio::test]
    async fn open_binds_connector_and_persists() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();

        let tx = h.ledger.open(open_params(claim, 100)).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Active);
        assert_eq!(h.registry.connector_transaction("CP001", 1), Some(tx.id));
        assert!(h.sessions.get_session(tx.id).await.unwrap().is_some());
        assert_eq!(h.ledger.active_count(), 1);
    }

    #[tokio::test]
    async fn transaction_ids_are_unique() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        h.registry.update_connector_status("CP001", 2, ConnectorStatus::Available, None).unwrap();

        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let a = h.ledger.open(open_params(claim, 0)).await.unwrap();
        let claim = h.registry.claim_connector("CP001", 2).unwrap();
        let b = h
            .ledger
            .open(OpenTransaction {
                connector_id: 2,
                ..open_params(claim, 0)
            })
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn stop_frees_connector_and_settles() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 1_000)).await.unwrap();

        let outcome = h
            .ledger
            .stop("CP001", tx.id, 2_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap();
        let settlement = match outcome {
            StopOutcome::Closed {
                transaction,
                settlement,
            } => {
                assert_eq!(transaction.energy_consumed_wh, 1_000);
                settlement
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        settlement.await.unwrap().unwrap();

        assert_eq!(h.registry.connector_transaction("CP001", 1), None);
        let connector_status = h.registry.snapshot("CP001").unwrap().connectors[&1].status;
        assert_eq!(connector_status, ConnectorStatus::Available);
        let stored = h.sessions.get_session(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(h.balance("driver-1").await, 97_500);
    }

    #[tokio::test]
    async fn meter_stop_below_start_is_clamped() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 5_000)).await.unwrap();

        match h
            .ledger
            .stop("CP001", tx.id, 4_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap()
        {
            StopOutcome::Closed { transaction, .. } => {
                assert_eq!(transaction.meter_stop, Some(5_000));
                assert_eq!(transaction.energy_consumed_wh, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn replayed_stop_does_not_settle_twice() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 0)).await.unwrap();

        if let StopOutcome::Closed { settlement, .. } = h
            .ledger
            .stop("CP001", tx.id, 1_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap()
        {
            settlement.await.unwrap().unwrap();
        }

        let replay = h
            .ledger
            .stop("CP001", tx.id, 1_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap();
        assert!(matches!(replay, StopOutcome::AlreadyClosed(_)));
        assert_eq!(h.balance("driver-1").await, 97_500);
        assert_eq!(h.sessions.revenue_shares_for(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_for_foreign_station_is_rejected() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 0)).await.unwrap();

        let err = h
            .ledger
            .stop("CP999", tx.id, 10, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(h.ledger.get(tx.id).is_some());
    }

    #[tokio::test]
    async fn replayed_stop_from_foreign_station_is_rejected() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 0)).await.unwrap();
        if let StopOutcome::Closed { settlement, .. } = h
            .ledger
            .stop("CP001", tx.id, 1_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap()
        {
            settlement.await.unwrap().unwrap();
        }

        let err = h
            .ledger
            .stop("CP999", tx.id, 1_000, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn meter_for_foreign_station_or_connector_is_ignored() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 0)).await.unwrap();
        let samples = vec![MeterSample {
            timestamp: Utc::now(),
            energy_wh: Some(30_000.0),
            power_w: None,
            soc: None,
        }];

        assert!(h.ledger.record_meter("CP002", None, tx.id, &samples).await.is_none());
        assert!(h.ledger.record_meter("CP001", Some(2), tx.id, &samples).await.is_none());
        assert_eq!(h.ledger.get(tx.id).unwrap().energy_consumed_wh, 0);

        let updated = h.ledger.record_meter("CP001", Some(1), tx.id, &samples).await.unwrap();
        assert_eq!(updated.energy_consumed_wh, 30_000);
    }

    #[tokio::test]
    async fn unknown_transaction_is_not_found() {
        let h = Harness::new().await;
        let err = h
            .ledger
            .stop("CP001", 404, 10, Utc::now(), StopReason::Reported("Local".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cutoff_flag_is_set_once() {
        let h = Harness::new().await;
        let _station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h.ledger.open(open_params(claim, 0)).await.unwrap();

        assert!(h.ledger.mark_stopped_by_system(tx.id));
        assert!(!h.ledger.mark_stopped_by_system(tx.id));
        assert!(h.ledger.get(tx.id).unwrap().stopped_by_system);
    }
}
