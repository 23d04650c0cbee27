//! Inbound Call payloads
//!
//! Each supported station-initiated action is one variant carrying its typed
//! `rust_ocpp` request. Parsing validates the payload before any handler
//! runs; failures map onto OCPP-J CallError codes.

use rust_ocpp::v1_6::messages::authorize::AuthorizeRequest;
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v1_6::messages::data_transfer::DataTransferRequest;
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatRequest;
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::start_transaction::StartTransactionRequest;
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionRequest;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::shared::ErrorCode;

/// Maximum idTag length (CiString20Type)
const ID_TAG_MAX_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {description}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub description: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn not_supported(action: &str) -> Self {
        Self::new(ErrorCode::NotSupported, format!("Action {} is not supported", action))
    }

    fn property(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::PropertyConstraintViolation, description)
    }
}

#[derive(Debug, Clone)]
pub enum InboundCall {
    BootNotification(BootNotificationRequest),
    Heartbeat(HeartbeatRequest),
    StatusNotification(StatusNotificationRequest),
    Authorize(AuthorizeRequest),
    StartTransaction(StartTransactionRequest),
    StopTransaction(StopTransactionRequest),
    MeterValues(MeterValuesRequest),
    DataTransfer(DataTransferRequest),
}

impl InboundCall {
    pub fn parse(action: &str, payload: Value) -> Result<Self, ProtocolError> {
        let call = match action {
            "BootNotification" => Self::BootNotification(decode(action, payload)?),
            "Heartbeat" => Self::Heartbeat(decode(action, payload)?),
            "StatusNotification" => Self::StatusNotification(decode(action, payload)?),
            "Authorize" => Self::Authorize(decode(action, payload)?),
            "StartTransaction" => Self::StartTransaction(decode(action, payload)?),
            "StopTransaction" => Self::StopTransaction(decode(action, payload)?),
            "MeterValues" => Self::MeterValues(decode(action, payload)?),
            "DataTransfer" => Self::DataTransfer(decode(action, payload)?),
            other => return Err(ProtocolError::not_supported(other)),
        };
        call.validate()?;
        Ok(call)
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::BootNotification(_) => "BootNotification",
            Self::Heartbeat(_) => "Heartbeat",
            Self::StatusNotification(_) => "StatusNotification",
            Self::Authorize(_) => "Authorize",
            Self::StartTransaction(_) => "StartTransaction",
            Self::StopTransaction(_) => "StopTransaction",
            Self::MeterValues(_) => "MeterValues",
            Self::DataTransfer(_) => "DataTransfer",
        }
    }

    /// Constraints serde cannot express on the `rust_ocpp` types.
    fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Authorize(req) => check_id_tag(&req.id_tag),
            Self::StartTransaction(req) => {
                check_id_tag(&req.id_tag)?;
                if req.connector_id == 0 {
                    return Err(ProtocolError::property("connectorId must be greater than 0"));
                }
                Ok(())
            }
            Self::StopTransaction(req) => match req.id_tag.as_deref() {
                Some(tag) => check_id_tag(tag),
                None => Ok(()),
            },
            Self::MeterValues(req) if req.meter_value.is_empty() => {
                Err(ProtocolError::property("meterValue must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

fn check_id_tag(id_tag: &str) -> Result<(), ProtocolError> {
    if id_tag.is_empty() || id_tag.chars().count() > ID_TAG_MAX_LEN {
        return Err(ProtocolError::property(format!(
            "idTag must be 1..={} characters",
            ID_TAG_MAX_LEN
        )));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(action: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| {
        let message = e.to_string();
        let code = if message.contains("invalid type")
            || message.contains("invalid value")
            || message.contains("unknown variant")
        {
            ErrorCode::TypeConstraintViolation
        } else {
            ErrorCode::FormationViolation
        };
        ProtocolError::new(code, format!("Invalid {} payload: {}", action, message))
    })
}
