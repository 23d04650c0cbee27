//! StartTransaction handler
//!
//! The connector is claimed before this returns, so a second start for the
//! same connector arriving on this connection is refused straight away.
//! Authorization then runs in its own task and the CallResult goes out
//! through the connection's outbox once the user has answered.

use rust_ocpp::v1_6::messages::start_transaction::{
    StartTransactionRequest, StartTransactionResponse,
};
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use serde_json::Value;
use tracing::{info, warn};

use crate::application::charging::{StartRequest, StartVerdict};
use crate::application::handlers::OcppHandlerV16;
use crate::shared::OcppFrame;

pub async fn handle_start_transaction(
    handler: &OcppHandlerV16,
    unique_id: &str,
    req: StartTransactionRequest,
) -> Option<Value> {
    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        connector_id = req.connector_id,
        id_tag = req.id_tag.as_str(),
        meter_start = req.meter_start,
        "StartTransaction"
    );

    let request = StartRequest {
        charge_point_id: handler.charge_point_id.clone(),
        connector_id: req.connector_id,
        id_tag: req.id_tag,
        meter_start: req.meter_start,
        timestamp: req.timestamp,
    };

    let claim = match handler.core.authorizer.claim(&request) {
        Ok(claim) => claim,
        Err(verdict) => return Some(start_response(&verdict)),
    };

    let authorizer = handler.core.authorizer.clone();
    let outbox = handler.outbox.clone();
    let unique_id = unique_id.to_string();
    tokio::spawn(async move {
        let charge_point_id = request.charge_point_id.clone();
        let verdict = authorizer.authorize(request, claim).await;
        let frame = OcppFrame::result(unique_id.as_str(), start_response(&verdict)).serialize();
        if outbox.send(frame).is_err() {
            warn!(
                charge_point_id = charge_point_id.as_str(),
                message_id = unique_id.as_str(),
                "Connection closed before StartTransaction reply"
            );
        }
    });

    None
}

pub(crate) fn start_response(verdict: &StartVerdict) -> Value {
    let status = match verdict {
        StartVerdict::Accepted { .. } => AuthorizationStatus::Accepted,
        StartVerdict::Blocked(_) => AuthorizationStatus::Blocked,
        StartVerdict::ConcurrentTx => AuthorizationStatus::ConcurrentTx,
        StartVerdict::Invalid => AuthorizationStatus::Invalid,
    };

    let response = StartTransactionResponse {
        id_tag_info: IdTagInfo {
            status,
            expiry_date: None,
            parent_id_tag: None,
        },
        transaction_id: verdict.transaction_id(),
    };

    serde_json::to_value(&response).unwrap_or_default()
}
