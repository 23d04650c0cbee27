//! RemoteStopTransaction command

use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use tracing::info;

use super::{from_payload, to_payload, CommandError, CommandSender};

pub async fn remote_stop_transaction(
    command_sender: &CommandSender,
    charge_point_id: &str,
    transaction_id: i32,
) -> Result<String, CommandError> {
    info!(charge_point_id, transaction_id, "RemoteStopTransaction");

    let payload = to_payload(&RemoteStopTransactionRequest { transaction_id })?;
    let result = command_sender
        .send_command(charge_point_id, "RemoteStopTransaction", payload)
        .await?;

    let response: RemoteStopTransactionResponse = from_payload(result)?;
    Ok(format!("{:?}", response.status))
}
