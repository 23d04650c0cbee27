//! StopTransaction handler
//!
//! Answers as soon as the transaction is closed; settlement runs on its own.

use rust_ocpp::v1_6::messages::stop_transaction::{
    StopTransactionRequest, StopTransactionResponse,
};
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use serde_json::Value;
use tracing::{error, info};

use crate::application::charging::{samples_from_meter_values, StopOutcome};
use crate::application::handlers::OcppHandlerV16;
use crate::domain::StopReason;

pub async fn handle_stop_transaction(handler: &OcppHandlerV16, req: StopTransactionRequest) -> Value {
    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        transaction_id = req.transaction_id,
        meter_stop = req.meter_stop,
        reason = ?req.reason,
        "StopTransaction"
    );

    // Trailing readings the station attached to the stop
    if let Some(data) = req.transaction_data.as_ref() {
        let samples = samples_from_meter_values(data);
        if !samples.is_empty() {
            handler
                .core
                .ledger
                .record_meter(&handler.charge_point_id, None, req.transaction_id, &samples)
                .await;
        }
    }

    let reason = StopReason::Reported(
        req.reason
            .as_ref()
            .map(|r| format!("{:?}", r))
            .unwrap_or_else(|| "Local".to_string()),
    );

    let status = match handler
        .core
        .ledger
        .stop(
            &handler.charge_point_id,
            req.transaction_id,
            req.meter_stop,
            req.timestamp,
            reason,
        )
        .await
    {
        Ok(StopOutcome::Closed { .. }) | Ok(StopOutcome::AlreadyClosed(_)) => {
            AuthorizationStatus::Accepted
        }
        Err(e) => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                transaction_id = req.transaction_id,
                error = %e,
                "Failed to stop transaction"
            );
            AuthorizationStatus::Invalid
        }
    };

    let response = StopTransactionResponse {
        id_tag_info: Some(IdTagInfo {
            status,
            expiry_date: None,
            parent_id_tag: None,
        }),
    };

    serde_json::to_value(&response).unwrap_or_default()
}
