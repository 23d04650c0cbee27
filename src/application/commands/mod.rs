//! Command sender for Central System to Charge Point communication
//!
//! ## Architecture
//!
//! ```text
//! caller ──► remote_stop / reset / ... ──► CommandSender ──► StationRegistry outbox
//!                                               │
//!                              pending table keyed by (station, message id)
//!                                               │
//!            CallResult / CallError ◄── station read loop ◄── station
//! ```
//!
//! - [`CommandSender`] sends raw `[2, id, action, payload]` frames and
//!   correlates responses through a `DashMap` of pending calls with a
//!   bounded wait.
//! - The per-action modules build typed requests and parse the responses.

pub mod change_availability;
pub mod remote_start;
pub mod remote_stop;
pub mod reset;
pub mod unlock_connector;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::session::SharedStationRegistry;
use crate::shared::ocpp_frame::OcppFrame;

pub use change_availability::{change_availability, Availability};
pub use remote_start::remote_start_transaction;
pub use remote_stop::remote_stop_transaction;
pub use reset::{reset, ResetKind};
pub use unlock_connector::unlock_connector;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

struct PendingRequest {
    action_name: String,
    response_sender: oneshot::Sender<Result<Value, CommandError>>,
    sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Charge point not connected: {0}")]
    NotConnected(String),
    #[error("Failed to send: {0}")]
    SendFailed(String),
    #[error("Response timeout")]
    Timeout,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("CallError {code}: {description}")]
    CallError { code: String, description: String },
    #[error("Charge point {0} disconnected before responding")]
    Disconnected(String),
}

impl CommandError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::SendFailed(_) => "send_failed",
            Self::Timeout => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::CallError { .. } => "call_error",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

/// Command sender for sending OCPP commands to charge points
pub struct CommandSender {
    registry: SharedStationRegistry,
    pending_requests: DashMap<(String, String), PendingRequest>,
    call_timeout: Duration,
}

impl CommandSender {
    pub fn new(registry: SharedStationRegistry) -> Self {
        Self::with_timeout(registry, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(registry: SharedStationRegistry, call_timeout: Duration) -> Self {
        Self {
            registry,
            pending_requests: DashMap::new(),
            call_timeout,
        }
    }

    fn generate_message_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Send an OCPP command to a charge point and wait for its answer.
    ///
    /// `action` is the OCPP action name (e.g. "RemoteStopTransaction").
    /// Returns the CallResult payload.
    pub async fn send_command(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let started = Instant::now();
        let result = self.dispatch(charge_point_id, action, payload).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        metrics::histogram!("ocpp_command_latency_seconds", "action" => action.to_string())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            "ocpp_commands_total",
            "action" => action.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        result
    }

    async fn dispatch(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CommandError> {
        let message_id = Self::generate_message_id();

        let frame = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.to_string(),
            payload,
        };
        let json = frame.serialize();

        let (tx, rx) = oneshot::channel();

        let key = (charge_point_id.to_string(), message_id.clone());
        self.pending_requests.insert(
            key.clone(),
            PendingRequest {
                action_name: action.to_string(),
                response_sender: tx,
                sent_at: Instant::now(),
            },
        );

        info!(
            charge_point_id,
            action,
            message_id = message_id.as_str(),
            "Sending command"
        );

        if let Err(e) = self.registry.send_to(charge_point_id, json) {
            self.pending_requests.remove(&key);
            return Err(CommandError::NotConnected(e.to_string()));
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending_requests.remove(&key);
                Err(CommandError::InvalidResponse("Channel closed".to_string()))
            }
            Err(_) => {
                self.pending_requests.remove(&key);
                warn!(
                    charge_point_id,
                    action,
                    message_id = message_id.as_str(),
                    "Command timed out"
                );
                Err(CommandError::Timeout)
            }
        }
    }

    /// Resolve a pending call with a CallResult. Returns `false` for unknown ids.
    pub fn handle_response(&self, charge_point_id: &str, message_id: &str, payload: Value) -> bool {
        let key = (charge_point_id.to_string(), message_id.to_string());
        match self.pending_requests.remove(&key) {
            Some((_, pending)) => {
                info!(
                    charge_point_id,
                    action = pending.action_name.as_str(),
                    message_id,
                    elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
                    "Received response"
                );
                let _ = pending.response_sender.send(Ok(payload));
                true
            }
            None => {
                warn!(charge_point_id, message_id, "Response for unknown request");
                false
            }
        }
    }

    /// Resolve a pending call with a CallError. Returns `false` for unknown ids.
    pub fn handle_error(
        &self,
        charge_point_id: &str,
        message_id: &str,
        error_code: &str,
        error_description: &str,
    ) -> bool {
        let key = (charge_point_id.to_string(), message_id.to_string());
        match self.pending_requests.remove(&key) {
            Some((_, pending)) => {
                warn!(
                    charge_point_id,
                    action = pending.action_name.as_str(),
                    message_id,
                    error_code,
                    error_description,
                    "Received error"
                );
                let _ = pending.response_sender.send(Err(CommandError::CallError {
                    code: error_code.to_string(),
                    description: error_description.to_string(),
                }));
                true
            }
            None => {
                warn!(charge_point_id, message_id, error_code, "Error for unknown request");
                false
            }
        }
    }

    /// Reject every call still waiting on `charge_point_id`.
    pub fn cleanup_charge_point(&self, charge_point_id: &str) -> usize {
        let keys: Vec<(String, String)> = self
            .pending_requests
            .iter()
            .filter(|entry| entry.key().0 == charge_point_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut rejected = 0;
        for key in keys {
            if let Some((_, pending)) = self.pending_requests.remove(&key) {
                let _ = pending
                    .response_sender
                    .send(Err(CommandError::Disconnected(charge_point_id.to_string())));
                rejected += 1;
            }
        }

        if rejected > 0 {
            info!(charge_point_id, rejected, "Rejected pending calls on disconnect");
        }
        rejected
    }

    pub fn pending_count(&self, charge_point_id: &str) -> usize {
        self.pending_requests
            .iter()
            .filter(|entry| entry.key().0 == charge_point_id)
            .count()
    }
}

pub type SharedCommandSender = Arc<CommandSender>;

pub fn create_command_sender(
    registry: SharedStationRegistry,
    call_timeout: Duration,
) -> SharedCommandSender {
    Arc::new(CommandSender::with_timeout(registry, call_timeout))
}

/// Serialize a typed request payload.
pub(crate) fn to_payload<T: serde::Serialize>(request: &T) -> Result<Value, CommandError> {
    serde_json::to_value(request)
        .map_err(|e| CommandError::SendFailed(format!("Serialization failed: {}", e)))
}

/// Parse a typed response payload.
pub(crate) fn from_payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CommandError> {
    serde_json::from_value(value)
        .map_err(|e| CommandError::InvalidResponse(format!("Failed to parse response: {}", e)))
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::session::StationRegistry;
    use tokio::sync::mpsc;

    pub(crate) fn connected(
        id: &str,
        call_timeout: Duration,
    ) -> (SharedCommandSender, SharedStationRegistry, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(StationRegistry::new(Vec::new(), 300, 10));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(id, tx);
        let sender = create_command_sender(registry.clone(), call_timeout);
        (sender, registry, rx)
    }

    /// Read the next outbound Call and return `(unique_id, action, payload)`.
    pub(crate) async fn next_call(rx: &mut mpsc::UnboundedReceiver<String>) -> (String, String, Value) {
        let text = rx.recv().await.expect("outbox closed");
        match OcppFrame::parse(&text).expect("valid frame") {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => (unique_id, action, payload),
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn response_resolves_pending_call() {
        let (sender, _registry, mut rx) = connected("CP001", Duration::from_secs(5));

        let task = {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender
                    .send_command("CP001", "Reset", serde_json::json!({"type": "Soft"}))
                    .await
            })
        };

        let (id, action, payload) = next_call(&mut rx).await;
        assert_eq!(action, "Reset");
        assert_eq!(payload["type"], "Soft");
        assert_eq!(sender.pending_count("CP001"), 1);

        assert!(sender.handle_response("CP001", &id, serde_json::json!({"status": "Accepted"})));
        let result = task.await.unwrap().unwrap();
        assert_eq!(result["status"], "Accepted");
        assert_eq!(sender.pending_count("CP001"), 0);
    }

    #[tokio::test]
    async fn call_error_rejects_pending_call() {
        let (sender, _registry, mut rx) = connected("CP001", Duration::from_secs(5));
        let task = {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender
                    .send_command("CP001", "UnlockConnector", serde_json::json!({"connectorId": 1}))
                    .await
            })
        };

        let (id, _, _) = next_call(&mut rx).await;
        assert!(sender.handle_error("CP001", &id, "NotSupported", "nope"));
        assert_eq!(
            task.await.unwrap(),
            Err(CommandError::CallError {
                code: "NotSupported".into(),
                description: "nope".into()
            })
        );
    }

    #[tokio::test]
    async fn unanswered_call_times_out_and_is_removed() {
        let (sender, _registry, _rx) = connected("CP001", Duration::from_millis(30));
        let result = sender
            .send_command("CP001", "Reset", serde_json::json!({"type": "Hard"}))
            .await;
        assert_eq!(result, Err(CommandError::Timeout));
        assert_eq!(sender.pending_count("CP001"), 0);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_ignored() {
        let (sender, _registry, mut rx) = connected("CP001", Duration::from_millis(30));
        let result = sender
            .send_command("CP001", "Reset", serde_json::json!({"type": "Hard"}))
            .await;
        assert_eq!(result, Err(CommandError::Timeout));

        let (id, _, _) = next_call(&mut rx).await;
        assert!(!sender.handle_response("CP001", &id, serde_json::json!({})));
    }

    #[tokio::test]
    async fn send_to_unknown_station_fails_fast() {
        let (sender, _registry, _rx) = connected("CP001", Duration::from_secs(5));
        let result = sender
            .send_command("CP404", "Reset", serde_json::json!({"type": "Soft"}))
            .await;
        assert!(matches!(result, Err(CommandError::NotConnected(_))));
        assert_eq!(sender.pending_count("CP404"), 0);
    }

    #[tokio::test]
    async fn cleanup_rejects_every_pending_call() {
        let (sender, _registry, mut rx) = connected("CP001", Duration::from_secs(5));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                sender
                    .send_command("CP001", "Reset", serde_json::json!({"type": "Soft"}))
                    .await
            }));
        }
        next_call(&mut rx).await;
        next_call(&mut rx).await;

        assert_eq!(sender.cleanup_charge_point("CP001"), 2);
        for task in tasks {
            assert_eq!(
                task.await.unwrap(),
                Err(CommandError::Disconnected("CP001".into()))
            );
        }
    }
}
