//! Heartbeat handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatResponse;
use serde_json::Value;
use tracing::debug;

use crate::application::handlers::OcppHandlerV16;

pub async fn handle_heartbeat(handler: &OcppHandlerV16) -> Value {
    debug!(charge_point_id = handler.charge_point_id.as_str(), "Heartbeat");

    let response = HeartbeatResponse {
        current_time: Utc::now(),
    };

    serde_json::to_value(&response).unwrap_or_default()
}
