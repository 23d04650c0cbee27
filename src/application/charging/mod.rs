//! Charging session flow: authorization, ledger and meter ingestion

pub mod authorization;
pub mod ledger;
pub mod metering;

pub use authorization::{
    AuthorizationSettings, BlockReason, ChargingAuthorizer, SharedChargingAuthorizer,
    StartRequest, StartVerdict,
};
pub use ledger::{
    OpenTransaction, SettlementHandle, SharedTransactionLedger, StopOutcome, TransactionLedger,
};
pub use metering::{
    samples_from_meter_values, samples_from_request, BalanceCheck, MeterIngestion,
    SharedMeterIngestion,
};
