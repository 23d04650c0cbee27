//! Authorize handler

use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use serde_json::Value;
use tracing::{error, info};

use crate::application::handlers::OcppHandlerV16;
use crate::domain::WalletStore;

pub async fn handle_authorize(handler: &OcppHandlerV16, req: AuthorizeRequest) -> Value {
    let status = match handler.core.ports.wallets.get_user(&req.id_tag).await {
        Ok(Some(_)) => AuthorizationStatus::Accepted,
        Ok(None) => AuthorizationStatus::Invalid,
        Err(e) => {
            error!(
                charge_point_id = handler.charge_point_id.as_str(),
                id_tag = req.id_tag.as_str(),
                error = %e,
                "Identity lookup failed"
            );
            AuthorizationStatus::Invalid
        }
    };

    info!(
        charge_point_id = handler.charge_point_id.as_str(),
        id_tag = req.id_tag.as_str(),
        ?status,
        "Authorize"
    );

    let response = AuthorizeResponse {
        id_tag_info: IdTagInfo {
            status,
            expiry_date: None,
            parent_id_tag: None,
        },
    };

    serde_json::to_value(&response).unwrap_or_default()
}
