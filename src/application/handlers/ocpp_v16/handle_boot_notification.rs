//! BootNotification handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::boot_notification::{
    BootNotificationRequest, BootNotificationResponse,
};
use rust_ocpp::v1_6::types::RegistrationStatus;
use serde_json::Value;
use tracing::{error, info};

use crate::application::handlers::OcppHandlerV16;
use crate::application::session::BootInfo;

pub async fn handle_boot_notification(
    handler: &OcppHandlerV16,
    req: BootNotificationRequest,
) -> Value {
    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        vendor = req.charge_point_vendor.as_str(),
        model = req.charge_point_model.as_str(),
        firmware = ?req.firmware_version,
        "BootNotification"
    );

    let boot = BootInfo {
        vendor: req.charge_point_vendor,
        model: req.charge_point_model,
        serial_number: req.charge_point_serial_number,
        firmware_version: req.firmware_version,
    };

    let interval = match handler.core.registry.record_boot(&handler.charge_point_id, boot) {
        Ok(interval) => interval,
        Err(e) => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                error = %e,
                "Failed to record boot"
            );
            handler
                .core
                .registry
                .snapshot(&handler.charge_point_id)
                .map(|s| s.heartbeat_interval)
                .unwrap_or(300)
        }
    };

    let response = BootNotificationResponse {
        current_time: Utc::now(),
        interval: interval as _,
        status: RegistrationStatus::Accepted,
    };

    serde_json::to_value(&response).unwrap_or_default()
}
