//! Charging core
//!
//! Wires the registry, command sender, ledger, authorization, metering and
//! settlement around the external ports, and owns the connection
//! lifecycle (connect / disconnect) that spans all of them.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::billing::{
    AccountLocks, PriceBook, SettlementEngine, SettlementSettings, SharedPriceBook,
    SharedSettlementEngine,
};
use super::charging::{
    AuthorizationSettings, ChargingAuthorizer, MeterIngestion, SharedChargingAuthorizer,
    SharedMeterIngestion, SharedTransactionLedger, StopOutcome, TransactionLedger,
};
use super::commands::{create_command_sender, SharedCommandSender};
use super::events::SharedEventBus;
use super::session::{Registration, SharedStationRegistry, StationRegistry};
use crate::config::AppConfig;
use crate::domain::{
    ConfirmationChannel, LiveStateMirror, LiveStateUpdate, Notifier, SessionStore, WalletStore,
};

/// The collaborators the core does not own
#[derive(Clone)]
pub struct ExternalPorts {
    pub sessions: Arc<dyn SessionStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub confirmations: Arc<dyn ConfirmationChannel>,
    pub mirror: Arc<dyn LiveStateMirror>,
    pub notifier: Arc<dyn Notifier>,
}

impl ExternalPorts {
    /// Use the event bus as both live-state mirror and notification channel.
    pub fn with_event_bus(
        sessions: Arc<dyn SessionStore>,
        wallets: Arc<dyn WalletStore>,
        confirmations: Arc<dyn ConfirmationChannel>,
        events: &SharedEventBus,
    ) -> Self {
        Self {
            sessions,
            wallets,
            confirmations,
            mirror: events.clone(),
            notifier: events.clone(),
        }
    }
}

pub struct ChargingCore {
    pub registry: SharedStationRegistry,
    pub command_sender: SharedCommandSender,
    pub ledger: SharedTransactionLedger,
    pub authorizer: SharedChargingAuthorizer,
    pub metering: SharedMeterIngestion,
    pub settlement: SharedSettlementEngine,
    pub prices: SharedPriceBook,
    pub events: SharedEventBus,
    pub ports: ExternalPorts,
}

pub type SharedChargingCore = Arc<ChargingCore>;

impl ChargingCore {
    pub fn new(config: &AppConfig, ports: ExternalPorts, events: SharedEventBus) -> Self {
        let registry: SharedStationRegistry = Arc::new(StationRegistry::new(
            config.stations.iter().cloned(),
            config.ocpp.heartbeat_interval_secs,
            config.ocpp.meter_buffer_size,
        ));
        let command_sender = create_command_sender(registry.clone(), config.ocpp.call_timeout());
        let prices: SharedPriceBook = Arc::new(PriceBook::new(config.billing.price_per_kwh));

        let settlement = Arc::new(SettlementEngine::new(
            ports.sessions.clone(),
            ports.wallets.clone(),
            registry.clone(),
            prices.clone(),
            ports.notifier.clone(),
            Arc::new(AccountLocks::new()),
            SettlementSettings::from(&config.billing),
        ));

        let ledger = Arc::new(TransactionLedger::new(
            ports.sessions.clone(),
            registry.clone(),
            settlement.clone(),
            ports.mirror.clone(),
            events.clone(),
        ));

        let authorizer = Arc::new(ChargingAuthorizer::new(
            registry.clone(),
            ledger.clone(),
            ports.wallets.clone(),
            ports.confirmations.clone(),
            ports.notifier.clone(),
            prices.clone(),
            AuthorizationSettings::from(&config.charging),
        ));

        let metering = Arc::new(MeterIngestion::new(
            registry.clone(),
            ledger.clone(),
            ports.wallets.clone(),
            prices.clone(),
            command_sender.clone(),
            ports.mirror.clone(),
            ports.notifier.clone(),
        ));

        Self {
            registry,
            command_sender,
            ledger,
            authorizer,
            metering,
            settlement,
            prices,
            events,
            ports,
        }
    }

    /// Register a new station connection.
    pub fn handle_connect(
        &self,
        charge_point_id: &str,
        outbox: mpsc::UnboundedSender<String>,
    ) -> Registration {
        let registration = self.registry.connect(charge_point_id, outbox);
        self.ports.mirror.publish(LiveStateUpdate::StationOnline {
            charge_point_id: charge_point_id.to_string(),
            timestamp: Utc::now(),
        });
        registration
    }

    /// Tear down a connection: reject its pending calls, take the station
    /// offline and force-stop every transaction it still holds. A stale
    /// connection (already replaced by a reconnect) is ignored.
    pub async fn handle_disconnect(&self, charge_point_id: &str, connection_id: u64) -> Vec<StopOutcome> {
        let Some(active) = self.registry.disconnect(charge_point_id, connection_id) else {
            return Vec::new();
        };

        self.command_sender.cleanup_charge_point(charge_point_id);

        let mut outcomes = Vec::with_capacity(active.len());
        for (connector_id, transaction_id) in active {
            match self.ledger.force_stop(charge_point_id, transaction_id).await {
                Ok(outcome) => {
                    info!(charge_point_id, connector_id, transaction_id, "Force-stopped on disconnect");
                    outcomes.push(outcome);
                }
                Err(e) => error!(
                    charge_point_id,
                    connector_id,
                    transaction_id,
                    error = %e,
                    "Force stop failed"
                ),
            }
        }

        self.ports.mirror.publish(LiveStateUpdate::StationOffline {
            charge_point_id: charge_point_id.to_string(),
            timestamp: Utc::now(),
        });
        outcomes
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::application::charging::{OpenTransaction, StopOutcome};
    use crate::application::commands::{reset, CommandError, ResetKind};
    use crate::domain::{ConnectorStatus, MeterSample, PaymentStatus, SessionStore, StopReason};
    use crate::test_support::Harness;
    use chrono::Utc;

    #[tokio::test]
    async fn disconnect_force_stops_with_last_meter_reading() {
        let h = Harness::new().await;
        let station = h.connect("CP001").await;
        let claim = h.registry.claim_connector("CP001", 1).unwrap();
        let tx = h
            .ledger
            .open(OpenTransaction {
                charge_point_id: "CP001".into(),
                connector_id: 1,
                claim,
                id_tag: "driver-1".into(),
                meter_start: 10_000,
                started_at: Utc::now(),
                estimated_cost: None,
            })
            .await
            .unwrap();
        h.metering
            .ingest(
                "CP001",
                1,
                Some(tx.id),
                vec![MeterSample {
                    timestamp: Utc::now(),
                    energy_wh: Some(11_000.0),
                    power_w: None,
                    soc: None,
                }],
            )
            .await;

        let mut outcomes = h.core.handle_disconnect("CP001", station.connection_id).await;
        assert_eq!(outcomes.len(), 1);
        let StopOutcome::Closed {
            transaction,
            settlement,
        } = outcomes.remove(0)
        else {
            panic!("expected a closed transaction");
        };
        assert_eq!(transaction.stop_reason, Some(StopReason::StationDisconnected));
        assert_eq!(transaction.energy_consumed_wh, 1_000);
        settlement.await.unwrap().unwrap();

        assert!(!h.registry.is_online("CP001"));
        let snapshot = h.registry.snapshot("CP001").unwrap();
        assert_eq!(snapshot.connectors[&1].status, ConnectorStatus::Unavailable);
        assert_eq!(snapshot.connectors[&1].transaction_id, None);

        let stored = h.sessions.get_session(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(h.balance("driver-1").await, 97_500);
    }

    #[tokio::test]
    async fn disconnect_rejects_pending_calls() {
        let h = Harness::new().await;
        let station = h.connect("CP001").await;

        let call = {
            let sender = h.core.command_sender.clone();
            tokio::spawn(async move { reset(&sender, "CP001", ResetKind::Soft).await })
        };
        while h.core.command_sender.pending_count("CP001") == 0 {
            tokio::task::yield_now().await;
        }
        h.core.handle_disconnect("CP001", station.connection_id).await;

        assert!(matches!(call.await.unwrap(), Err(CommandError::Disconnected(_))));
    }

    #[tokio::test]
    async fn stale_disconnect_after_reconnect_is_ignored() {
        let h = Harness::new().await;
        let first = h.connect("CP001").await;
        let _second = h.connect("CP001").await;

        let outcomes = h.core.handle_disconnect("CP001", first.connection_id).await;
        assert!(outcomes.is_empty());
        assert!(h.registry.is_online("CP001"));
    }
}
