//! DataTransfer handler

use rust_ocpp::v1_6::messages::data_transfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v1_6::types::DataTransferStatus;
use serde_json::Value;
use tracing::info;

use crate::application::handlers::OcppHandlerV16;

pub async fn handle_data_transfer(handler: &OcppHandlerV16, req: DataTransferRequest) -> Value {
    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        vendor_id = req.vendor_string.as_str(),
        message_id = ?req.message_id,
        data = ?req.data,
        "DataTransfer"
    );

    let response = DataTransferResponse {
        status: DataTransferStatus::Accepted,
        data: None,
    };

    serde_json::to_value(&response).unwrap_or_default()
}
