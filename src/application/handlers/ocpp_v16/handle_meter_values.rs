//! MeterValues handler

use rust_ocpp::v1_6::messages::meter_values::{MeterValuesRequest, MeterValuesResponse};
use serde_json::Value;
use tracing::debug;

use crate::application::charging::samples_from_request;
use crate::application::handlers::OcppHandlerV16;

pub async fn handle_meter_values(handler: &OcppHandlerV16, req: MeterValuesRequest) -> Value {
    let samples = samples_from_request(&req);

    debug!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        transaction_id = ?req.transaction_id,
        samples = samples.len(),
        "MeterValues"
    );

    handler
        .core
        .metering
        .ingest(&handler.charge_point_id, req.connector_id, req.transaction_id, samples)
        .await;

    serde_json::to_value(&MeterValuesResponse {}).unwrap_or_default()
}
