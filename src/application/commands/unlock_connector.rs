//! UnlockConnector command

use rust_ocpp::v1_6::messages::unlock_connector::{
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use tracing::info;

use super::{from_payload, to_payload, CommandError, CommandSender};

pub async fn unlock_connector(
    command_sender: &CommandSender,
    charge_point_id: &str,
    connector_id: u32,
) -> Result<String, CommandError> {
    info!(charge_point_id, connector_id, "UnlockConnector");

    let payload = to_payload(&UnlockConnectorRequest { connector_id })?;
    let result = command_sender
        .send_command(charge_point_id, "UnlockConnector", payload)
        .await?;

    let response: UnlockConnectorResponse = from_payload(result)?;
    Ok(format!("{:?}", response.status))
}
