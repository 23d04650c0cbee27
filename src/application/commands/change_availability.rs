//! ChangeAvailability command

use rust_ocpp::v1_6::messages::change_availability::{
    ChangeAvailabilityRequest, ChangeAvailabilityResponse,
};
use rust_ocpp::v1_6::types::AvailabilityType;
use tracing::info;

use super::{from_payload, to_payload, CommandError, CommandSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Operative,
    Inoperative,
}

/// Change the availability of one connector, or of the whole station with `connector_id = 0`.
pub async fn change_availability(
    command_sender: &CommandSender,
    charge_point_id: &str,
    connector_id: u32,
    availability: Availability,
) -> Result<String, CommandError> {
    info!(charge_point_id, connector_id, ?availability, "ChangeAvailability");

    let kind = match availability {
        Availability::Operative => AvailabilityType::Operative,
        Availability::Inoperative => AvailabilityType::Inoperative,
    };

    let payload = to_payload(&ChangeAvailabilityRequest { connector_id, kind })?;
    let result = command_sender
        .send_command(charge_point_id, "ChangeAvailability", payload)
        .await?;

    let response: ChangeAvailabilityResponse = from_payload(result)?;
    Ok(format!("{:?}", response.status))
}
