//! StatusNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::status_notification::{
    StatusNotificationRequest, StatusNotificationResponse,
};
use rust_ocpp::v1_6::types::{ChargePointErrorCode, ChargePointStatus};
use serde_json::Value;
use tracing::{info, warn};

use crate::application::handlers::OcppHandlerV16;
use crate::domain::{ConnectorStatus, LiveStateUpdate};

pub async fn handle_status_notification(
    handler: &OcppHandlerV16,
    req: StatusNotificationRequest,
) -> Value {
    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        status = ?req.status,
        error_code = ?req.error_code,
        "StatusNotification"
    );

    let connector_status = match req.status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Preparing => ConnectorStatus::Preparing,
        ChargePointStatus::Charging => ConnectorStatus::Charging,
        ChargePointStatus::SuspendedEV => ConnectorStatus::SuspendedEV,
        ChargePointStatus::SuspendedEVSE => ConnectorStatus::SuspendedEVSE,
        ChargePointStatus::Finishing => ConnectorStatus::Finishing,
        ChargePointStatus::Reserved => ConnectorStatus::Reserved,
        ChargePointStatus::Unavailable => ConnectorStatus::Unavailable,
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
    };
    let error_code = match req.error_code {
        ChargePointErrorCode::NoError => None,
        other => Some(format!("{:?}", other)),
    };

    if let Err(e) = handler.core.registry.update_connector_status(
        &handler.charge_point_id,
        req.connector_id,
        connector_status,
        error_code.clone(),
    ) {
        warn!(
            charge_point_id = handler.charge_point_id.as_str(),
            error = %e,
            "Failed to update connector status"
        );
    }

    handler.core.ports.mirror.publish(LiveStateUpdate::ConnectorStatus {
        charge_point_id: handler.charge_point_id.clone(),
        connector_id: req.connector_id,
        status: connector_status.to_string(),
        error_code,
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
    });

    serde_json::to_value(&StatusNotificationResponse {}).unwrap_or_default()
}
