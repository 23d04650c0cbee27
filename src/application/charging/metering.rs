//! Meter ingestion and balance enforcement
//!
//! Samples go to the connector's ring buffer and, when the connector is
//! bound, into the transaction's running totals. Every sample for an active
//! transaction re-prices the energy so far; once the payer's balance no
//! longer covers it, the station is told to stop. No money moves here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::types::{Measurand, MeterValue, UnitOfMeasure};
use tracing::{debug, error, info, warn};

use super::ledger::SharedTransactionLedger;
use crate::application::billing::{energy_cost, SharedPriceBook};
use crate::application::commands::{remote_stop_transaction, SharedCommandSender};
use crate::application::session::SharedStationRegistry;
use crate::domain::{
    LiveStateMirror, LiveStateUpdate, MeterSample, Notifier, Transaction, UserNotification,
    WalletStore,
};

/// Convert a MeterValues payload into samples, one per `meterValue` entry.
pub fn samples_from_request(request: &MeterValuesRequest) -> Vec<MeterSample> {
    samples_from_meter_values(&request.meter_value)
}

/// Registers reported in kWh / kW are scaled to Wh / W; a sampled value
/// without a measurand is the energy register.
pub fn samples_from_meter_values(values: &[MeterValue]) -> Vec<MeterSample> {
    values
        .iter()
        .filter_map(|mv| {
            let mut sample = MeterSample {
                timestamp: mv.timestamp,
                energy_wh: None,
                power_w: None,
                soc: None,
            };
            for sv in &mv.sampled_value {
                let Ok(raw) = sv.value.trim().parse::<f64>() else {
                    warn!(value = sv.value.as_str(), "Unparseable sampled value");
                    continue;
                };
                let scale = match sv.unit {
                    Some(UnitOfMeasure::KWh) | Some(UnitOfMeasure::Kw) => 1000.0,
                    _ => 1.0,
                };
                match sv.measurand.as_ref().unwrap_or(&Measurand::EnergyActiveImportRegister) {
                    Measurand::EnergyActiveImportRegister => sample.energy_wh = Some(raw * scale),
                    Measurand::PowerActiveImport => sample.power_w = Some(raw * scale),
                    Measurand::SoC => sample.soc = Some(raw),
                    _ => {}
                }
            }
            let empty = sample.energy_wh.is_none() && sample.power_w.is_none() && sample.soc.is_none();
            (!empty).then_some(sample)
        })
        .collect()
}

pub struct MeterIngestion {
    registry: SharedStationRegistry,
    ledger: SharedTransactionLedger,
    wallets: Arc<dyn WalletStore>,
    prices: SharedPriceBook,
    command_sender: SharedCommandSender,
    mirror: Arc<dyn LiveStateMirror>,
    notifier: Arc<dyn Notifier>,
}

pub type SharedMeterIngestion = Arc<MeterIngestion>;

/// What happened to a balance check after a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCheck {
    Covered { cost_so_far: i64 },
    /// Balance no longer covers the session; a remote stop was issued
    CutOff { cost_so_far: i64, balance: i64 },
    /// Already cut off earlier, waiting for the station's stop
    AlreadyStopping,
}

impl MeterIngestion {
    pub fn new(
        registry: SharedStationRegistry,
        ledger: SharedTransactionLedger,
        wallets: Arc<dyn WalletStore>,
        prices: SharedPriceBook,
        command_sender: SharedCommandSender,
        mirror: Arc<dyn LiveStateMirror>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            ledger,
            wallets,
            prices,
            command_sender,
            mirror,
            notifier,
        }
    }

    /// Ingest samples for one connector. Returns the balance check result
    /// when the samples belonged to an active transaction.
    pub async fn ingest(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        transaction_id: Option<i32>,
        samples: Vec<MeterSample>,
    ) -> Option<BalanceCheck> {
        if samples.is_empty() {
            return None;
        }

        let transaction_id = match transaction_id {
            Some(id) if !self.ledger.is_running_on(id, charge_point_id, connector_id) => {
                warn!(
                    charge_point_id,
                    connector_id,
                    transaction_id = id,
                    "Meter values name a transaction not running on this connector"
                );
                None
            }
            Some(id) => Some(id),
            None => self.registry.connector_transaction(charge_point_id, connector_id),
        };

        for sample in &samples {
            self.registry
                .push_meter_sample(charge_point_id, connector_id, sample.clone());
            self.mirror.publish(LiveStateUpdate::Meter {
                charge_point_id: charge_point_id.to_string(),
                connector_id,
                transaction_id,
                energy_wh: sample.energy_wh,
                power_w: sample.power_w,
                timestamp: sample.timestamp,
            });
        }

        let transaction_id = transaction_id?;
        let Some(transaction) = self
            .ledger
            .record_meter(charge_point_id, Some(connector_id), transaction_id, &samples)
            .await
        else {
            debug!(charge_point_id, transaction_id, "Meter values for inactive transaction");
            return None;
        };

        let timestamp = samples
            .last()
            .map(|s| s.timestamp)
            .unwrap_or_else(Utc::now);
        Some(self.enforce_balance(&transaction, timestamp).await)
    }

    async fn enforce_balance(&self, transaction: &Transaction, timestamp: DateTime<Utc>) -> BalanceCheck {
        let charge_point_id = transaction.charge_point_id.as_str();
        let cost_so_far =
            energy_cost(transaction.energy_consumed_wh, self.prices.current()).unwrap_or(i64::MAX);

        self.mirror.publish(LiveStateUpdate::SessionCost {
            charge_point_id: charge_point_id.to_string(),
            transaction_id: transaction.id,
            energy_consumed_wh: transaction.energy_consumed_wh,
            estimated_cost: cost_so_far,
            timestamp,
        });

        if transaction.stopped_by_system {
            return BalanceCheck::AlreadyStopping;
        }

        let balance = match self.wallets.get_balance(&transaction.id_tag).await {
            Ok(b) => b,
            Err(e) => {
                warn!(transaction_id = transaction.id, error = %e, "Balance check skipped");
                return BalanceCheck::Covered { cost_so_far };
            }
        };
        if balance >= cost_so_far {
            return BalanceCheck::Covered { cost_so_far };
        }

        if !self.ledger.mark_stopped_by_system(transaction.id) {
            return BalanceCheck::AlreadyStopping;
        }

        info!(
            charge_point_id,
            transaction_id = transaction.id,
            id_tag = transaction.id_tag.as_str(),
            balance,
            cost_so_far,
            "Balance exhausted, stopping transaction"
        );

        let sender = self.command_sender.clone();
        let cp = charge_point_id.to_string();
        let transaction_id = transaction.id;
        tokio::spawn(async move {
            if let Err(e) = remote_stop_transaction(&sender, &cp, transaction_id).await {
                error!(charge_point_id = cp.as_str(), transaction_id, error = %e, "RemoteStop for cutoff failed");
            }
        });

        self.notifier.notify(
            &transaction.id_tag,
            UserNotification::ChargingStopped {
                transaction_id: transaction.id,
                charge_point_id: charge_point_id.to_string(),
                balance,
                cost_so_far,
            },
        );

        BalanceCheck::CutOff {
            cost_so_far,
            balance,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
