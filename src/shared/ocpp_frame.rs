//! OCPP-J message framing
//!
//! Every message on a station connection is a JSON array:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::Value;
use thiserror::Error;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── Error codes ────────────────────────────────────────────────

/// OCPP-J CallError codes used by this central system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    FormationViolation,
    PropertyConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse a raw JSON text into an `OcppFrame`.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| OcppFrameError::InvalidJson(e.to_string()))?;

        let msg_type = arr
            .first()
            .ok_or(OcppFrameError::EmptyArray)?
            .as_u64()
            .ok_or(OcppFrameError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(arr),
            _ => Err(OcppFrameError::UnknownMessageType(msg_type)),
        }
    }

    /// Best-effort extraction of the unique id from a frame that failed to parse,
    /// so the sender can still be answered with a CallError.
    pub fn peek_unique_id(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        let arr = value.as_array()?;
        if arr.first()?.as_u64()? != MSG_TYPE_CALL {
            return None;
        }
        arr.get(1)?.as_str().map(String::from)
    }

    fn unique_id_at(arr: &[Value]) -> Result<String, OcppFrameError> {
        arr[1]
            .as_str()
            .map(String::from)
            .ok_or(OcppFrameError::FieldTypeMismatch("uniqueId must be a string"))
    }

    fn parse_call(mut arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        if arr.len() < 4 {
            return Err(OcppFrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = Self::unique_id_at(&arr)?;
        let action = arr[2]
            .as_str()
            .ok_or(OcppFrameError::FieldTypeMismatch("action must be a string"))?
            .to_string();
        let payload = arr.swap_remove(3);

        Ok(Self::Call {
            unique_id,
            action,
            payload,
        })
    }

    fn parse_call_result(mut arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        if arr.len() < 3 {
            return Err(OcppFrameError::MissingFields {
                expected: 3,
                got: arr.len(),
            });
        }

        let unique_id = Self::unique_id_at(&arr)?;
        let payload = match arr.swap_remove(2) {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        Ok(Self::CallResult { unique_id, payload })
    }

    fn parse_call_error(arr: Vec<Value>) -> Result<Self, OcppFrameError> {
        if arr.len() < 4 {
            return Err(OcppFrameError::MissingFields {
                expected: 4,
                got: arr.len(),
            });
        }

        let unique_id = Self::unique_id_at(&arr)?;
        let error_code = arr[2].as_str().unwrap_or("GenericError").to_string();
        let error_description = arr[3].as_str().unwrap_or("").to_string();
        let error_details = arr
            .get(4)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details,
        })
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to a JSON string.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),

            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_RESULT),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),

            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_ERROR),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };

        arr.to_string()
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    pub fn result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Create a `CallError` response for a given unique ID.
    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.as_str().to_string(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors that can occur when parsing an OCPP-J frame.
#[derive(Debug, Error)]
pub enum OcppFrameError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Empty OCPP message array")]
    EmptyArray,
    #[error("Message type is not a number")]
    InvalidMessageType,
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("Field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor","chargePointModel":"Model"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            other => panic!("Expected Call frame, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_result_with_null_payload() {
        match OcppFrame::parse(r#"[3,"m1",null]"#).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "m1");
                assert!(payload.is_object());
            }
            other => panic!("Expected CallResult frame, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_error_without_details() {
        match OcppFrame::parse(r#"[4,"abc123","NotImplemented","Action not supported"]"#).unwrap() {
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_description, "Action not supported");
                assert!(error_details.is_object());
            }
            other => panic!("Expected CallError frame, got {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            OcppFrame::parse("not json"),
            Err(OcppFrameError::InvalidJson(_))
        ));
        assert!(matches!(OcppFrame::parse("[]"), Err(OcppFrameError::EmptyArray)));
        assert!(matches!(
            OcppFrame::parse(r#"[9,"x",{}]"#),
            Err(OcppFrameError::UnknownMessageType(9))
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[2,"x","Heartbeat"]"#),
            Err(OcppFrameError::MissingFields { expected: 4, got: 3 })
        ));
        assert!(matches!(
            OcppFrame::parse(r#"[2,7,"Heartbeat",{}]"#),
            Err(OcppFrameError::FieldTypeMismatch(_))
        ));
    }

    #[test]
    fn peek_unique_id_of_truncated_call() {
        assert_eq!(
            OcppFrame::peek_unique_id(r#"[2,"abc","Heartbeat"]"#).as_deref(),
            Some("abc")
        );
        assert_eq!(OcppFrame::peek_unique_id(r#"[3,"abc"]"#), None);
        assert_eq!(OcppFrame::peek_unique_id("garbage"), None);
    }

    #[test]
    fn error_response_serializes_five_elements() {
        let json = OcppFrame::error_response("id3", ErrorCode::FormationViolation, "bad").serialize();
        assert_eq!(json, r#"[4,"id3","FormationViolation","bad",{}]"#);
    }
}
