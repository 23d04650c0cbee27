//! Reset command

use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::types::ResetRequestStatus;
use tracing::info;

use super::{from_payload, to_payload, CommandError, CommandSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Restart without power cycle
    Soft,
    /// Full power cycle
    Hard,
}

pub async fn reset(
    command_sender: &CommandSender,
    charge_point_id: &str,
    reset_type: ResetKind,
) -> Result<String, CommandError> {
    info!(charge_point_id, ?reset_type, "Reset");

    let kind = match reset_type {
        ResetKind::Soft => ResetRequestStatus::Soft,
        ResetKind::Hard => ResetRequestStatus::Hard,
    };

    let payload = to_payload(&ResetRequest { kind })?;
    let result = command_sender
        .send_command(charge_point_id, "Reset", payload)
        .await?;

    let response: ResetResponse = from_payload(result)?;
    Ok(format!("{:?}", response.status))
}
