//! RemoteStartTransaction command
//!
//! The station answers with a plain status; the transaction itself arrives
//! later as a regular StartTransaction and goes through authorization.

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{from_payload, CommandError, CommandSender};

#[derive(Debug, Deserialize)]
struct RemoteStartResponse {
    status: String,
}

pub async fn remote_start_transaction(
    command_sender: &CommandSender,
    charge_point_id: &str,
    id_tag: &str,
    connector_id: Option<u32>,
) -> Result<String, CommandError> {
    info!(charge_point_id, id_tag, ?connector_id, "RemoteStartTransaction");

    let mut payload = json!({ "idTag": id_tag });
    if let Some(connector_id) = connector_id {
        payload["connectorId"] = json!(connector_id);
    }

    let result = command_sender
        .send_command(charge_point_id, "RemoteStartTransaction", payload)
        .await?;

    let response: RemoteStartResponse = from_payload(result)?;
    Ok(response.status)
}
