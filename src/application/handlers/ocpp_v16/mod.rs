//! OCPP 1.6 action handlers
//!
//! One module per station-initiated action.

mod handle_authorize;
mod handle_boot_notification;
mod handle_data_transfer;
mod handle_heartbeat;
mod handle_meter_values;
mod handle_start_transaction;
mod handle_status_notification;
mod handle_stop_transaction;

pub use handle_authorize::handle_authorize;
pub use handle_boot_notification::handle_boot_notification;
pub use handle_data_transfer::handle_data_transfer;
pub use handle_heartbeat::handle_heartbeat;
pub use handle_meter_values::handle_meter_values;
pub use handle_start_transaction::handle_start_transaction;
pub use handle_status_notification::handle_status_notification;
pub use handle_stop_transaction::handle_stop_transaction;

use serde_json::Value;

use super::inbound::InboundCall;
use super::OcppHandlerV16;

/// Route a validated Call to its handler. `None` means the answer is sent
/// later through the connection's outbox.
pub async fn action_matcher(
    handler: &OcppHandlerV16,
    unique_id: &str,
    call: InboundCall,
) -> Option<Value> {
    let response = match call {
        InboundCall::BootNotification(req) => handle_boot_notification(handler, req).await,
        InboundCall::Heartbeat(_) => handle_heartbeat(handler).await,
        InboundCall::StatusNotification(req) => handle_status_notification(handler, req).await,
        InboundCall::Authorize(req) => handle_authorize(handler, req).await,
        InboundCall::StartTransaction(req) => {
            return handle_start_transaction(handler, unique_id, req).await
        }
        InboundCall::StopTransaction(req) => handle_stop_transaction(handler, req).await,
        InboundCall::MeterValues(req) => handle_meter_values(handler, req).await,
        InboundCall::DataTransfer(req) => handle_data_transfer(handler, req).await,
    };
    Some(response)
}
