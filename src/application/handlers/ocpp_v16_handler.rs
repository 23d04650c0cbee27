//! OCPP 1.6 message handler
//!
//! Parses raw OCPP-J frames, dispatches Calls to action handlers and hands
//! CallResult / CallError frames back to the command sender.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::inbound::{InboundCall, ProtocolError};
use super::ocpp_v16::action_matcher;
use crate::application::core::ChargingCore;
use crate::shared::{ErrorCode, OcppFrame};

/// Per-connection handler for OCPP 1.6 messages
pub struct OcppHandlerV16 {
    pub charge_point_id: String,
    pub core: Arc<ChargingCore>,
    /// This connection's outbox, for answers produced after the read loop moved on
    pub outbox: mpsc::UnboundedSender<String>,
}

impl OcppHandlerV16 {
    pub fn new(
        charge_point_id: impl Into<String>,
        core: Arc<ChargingCore>,
        outbox: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            core,
            outbox,
        }
    }

    /// Handle one text frame. Returns the immediate reply, if any.
    pub async fn handle(&self, text: &str) -> Option<String> {
        debug!(
            charge_point_id = self.charge_point_id.as_str(),
            "Received raw message: {}", text
        );
        self.core.registry.touch(&self.charge_point_id);

        let frame = match OcppFrame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    error = %e,
                    raw = text,
                    "Failed to parse OCPP frame"
                );
                // Answer only when we can tell which Call it was
                return OcppFrame::peek_unique_id(text).map(|unique_id| {
                    OcppFrame::error_response(unique_id, ErrorCode::FormationViolation, e.to_string())
                        .serialize()
                });
            }
        };

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => self.handle_call(&unique_id, &action, payload).await,

            OcppFrame::CallResult { unique_id, payload } => {
                self.handle_call_result(&unique_id, payload);
                None
            }

            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                self.handle_call_error(&unique_id, &error_code, &error_description);
                None
            }
        }
    }

    async fn handle_call(&self, unique_id: &str, action: &str, payload: Value) -> Option<String> {
        info!(
            charge_point_id = self.charge_point_id.as_str(),
            action,
            message_id = unique_id,
            "Received Call"
        );

        let call = match InboundCall::parse(action, payload) {
            Ok(call) => call,
            Err(ProtocolError { code, description }) => {
                warn!(
                    charge_point_id = self.charge_point_id.as_str(),
                    action,
                    error_code = %code,
                    description = description.as_str(),
                    "Rejected Call"
                );
                return Some(OcppFrame::error_response(unique_id, code, description).serialize());
            }
        };

        action_matcher(self, unique_id, call)
            .await
            .map(|payload| OcppFrame::result(unique_id, payload).serialize())
    }

    fn handle_call_result(&self, unique_id: &str, payload: Value) {
        debug!(
            charge_point_id = self.charge_point_id.as_str(),
            message_id = unique_id,
            "Received CallResult"
        );
        if !self
            .core
            .command_sender
            .handle_response(&self.charge_point_id, unique_id, payload)
        {
            warn!(
                charge_point_id = self.charge_point_id.as_str(),
                message_id = unique_id,
                "CallResult for unknown or expired call"
            );
        }
    }

    fn handle_call_error(&self, unique_id: &str, error_code: &str, error_description: &str) {
        warn!(
            charge_point_id = self.charge_point_id.as_str(),
            message_id = unique_id,
            error_code,
            "Received CallError"
        );
        self.core
            .command_sender
            .handle_error(&self.charge_point_id, unique_id, error_code, error_description);
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::application::commands::{reset, ResetKind};
    use crate::domain::{PaymentStatus, SessionStore, UserRole};
    use crate::test_support::{Harness, TestStation};

    fn call(id: &str, action: &str, payload: Value) -> String {
        json!([2, id, action, payload]).to_string()
    }

    fn result_payload(frame: &str, expected_id: &str) -> Value {
        match OcppFrame::parse(frame).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, expected_id);
                payload
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    fn start(id_tag: &str) -> Value {
        json!({"connectorId": 1, "idTag": id_tag, "meterStart": 10_000, "timestamp": "2024-01-01T10:00:00Z"})
    }

    async fn connected(h: &Harness) -> (OcppHandlerV16, TestStation) {
        let station = h.connect("CP001").await;
        let handler = OcppHandlerV16::new("CP001", h.core.clone(), station.outbox.clone());
        (handler, station)
    }

    async fn wait_for_payment(h: &Harness, transaction_id: i32) -> PaymentStatus {
        for _ in 0..200 {
            let session = h.sessions.get_session(transaction_id).await.unwrap().unwrap();
            if !matches!(session.payment_status, PaymentStatus::Pending | PaymentStatus::Processing) {
                return session.payment_status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("settlement of {} did not finish", transaction_id);
    }

    #[tokio::test]
    async fn full_session_settles_and_splits_revenue() {
        let h = Harness::new().await;
        let (handler, mut station) = connected(&h).await;
        h.confirm_next("driver-1", true);

        assert!(handler.handle(&call("s-1", "StartTransaction", start("driver-1"))).await.is_none());
        let reply = result_payload(&station.next_frame().await, "s-1");
        assert_eq!(reply["idTagInfo"]["status"], "Accepted");
        let transaction_id = reply["transactionId"].as_i64().unwrap() as i32;
        assert!(transaction_id > 0);

        let meter = json!({
            "connectorId": 1,
            "transactionId": transaction_id,
            "meterValue": [{"timestamp": "2024-01-01T10:30:00Z", "sampledValue": [{"value": "10600"}]}]
        });
        let reply = handler.handle(&call("m-1", "MeterValues", meter)).await.unwrap();
        assert_eq!(result_payload(&reply, "m-1"), json!({}));

        let stop = json!({"transactionId": transaction_id, "meterStop": 11_000, "timestamp": "2024-01-01T11:00:00Z", "reason": "EVDisconnected"});
        let reply = handler.handle(&call("t-1", "StopTransaction", stop)).await.unwrap();
        assert_eq!(result_payload(&reply, "t-1")["idTagInfo"]["status"], "Accepted");

        assert_eq!(wait_for_payment(&h, transaction_id).await, PaymentStatus::Paid);
        assert_eq!(h.balance("driver-1").await, 97_500);
        assert_eq!(h.balance("owner-1").await, 2_250);
        assert_eq!(h.balance("platform").await, 250);
        assert_eq!(h.registry.connector_transaction("CP001", 1), None);
    }

    #[tokio::test]
    async fn short_balance_is_blocked_with_zero_transaction_id() {
        let h = Harness::new().await;
        h.wallets.insert_user("low", UserRole::Customer, 5_000);
        let (handler, mut station) = connected(&h).await;

        assert!(handler.handle(&call("s-1", "StartTransaction", start("low"))).await.is_none());
        let reply = result_payload(&station.next_frame().await, "s-1");
        assert_eq!(reply["idTagInfo"]["status"], "Blocked");
        assert_eq!(reply["transactionId"], 0);
        assert_eq!(h.confirmations.published_count("low"), 0);
        assert_eq!(h.shortfall_notified("low"), Some(45_000));
    }

    #[tokio::test]
    async fn second_start_on_busy_connector_is_concurrent_tx() {
        let h = Harness::new().await;
        let (handler, mut station) = connected(&h).await;

        assert!(handler.handle(&call("s-1", "StartTransaction", start("driver-1"))).await.is_none());
        h.wait_for_pending("driver-1").await;

        let reply = handler
            .handle(&call("s-2", "StartTransaction", start("driver-1")))
            .await
            .unwrap();
        let second = result_payload(&reply, "s-2");
        assert_eq!(second["idTagInfo"]["status"], "ConcurrentTx");
        assert_eq!(second["transactionId"], 0);

        h.confirmations.respond("driver-1", true);
        let first = result_payload(&station.next_frame().await, "s-1");
        assert_eq!(first["idTagInfo"]["status"], "Accepted");
        assert_eq!(h.ledger.active_count(), 1);
    }

    #[tokio::test]
    async fn heartbeat_is_answered_while_confirmation_is_pending() {
        let h = Harness::new().await;
        let (handler, _station) = connected(&h).await;

        handler.handle(&call("s-1", "StartTransaction", start("driver-1"))).await;
        h.wait_for_pending("driver-1").await;

        let reply = handler.handle(&call("h-1", "Heartbeat", json!({}))).await.unwrap();
        assert!(result_payload(&reply, "h-1")["currentTime"].is_string());
    }

    #[tokio::test]
    async fn protocol_errors_become_call_errors() {
        let h = Harness::new().await;
        let (handler, _station) = connected(&h).await;

        let reply = handler.handle(&call("x-1", "SignCertificate", json!({}))).await.unwrap();
        assert!(matches!(
            OcppFrame::parse(&reply).unwrap(),
            OcppFrame::CallError { ref unique_id, ref error_code, .. }
                if unique_id == "x-1" && error_code == "NotSupported"
        ));

        let reply = handler.handle(r#"[2, "x-2", "Heartbeat"]"#).await.unwrap();
        assert!(matches!(
            OcppFrame::parse(&reply).unwrap(),
            OcppFrame::CallError { ref error_code, .. } if error_code == "FormationViolation"
        ));

        assert!(handler.handle("not json at all").await.is_none());
    }

    #[tokio::test]
    async fn stop_for_unknown_transaction_is_invalid() {
        let h = Harness::new().await;
        let (handler, _station) = connected(&h).await;

        let stop = json!({"transactionId": 4242, "meterStop": 10, "timestamp": "2024-01-01T11:00:00Z"});
        let reply = handler.handle(&call("t-1", "StopTransaction", stop)).await.unwrap();
        assert_eq!(result_payload(&reply, "t-1")["idTagInfo"]["status"], "Invalid");
    }

    #[tokio::test]
    async fn call_result_resolves_pending_command() {
        let h = Harness::new().await;
        let (handler, mut station) = connected(&h).await;

        let command = {
            let sender = h.core.command_sender.clone();
            tokio::spawn(async move { reset(&sender, "CP001", ResetKind::Soft).await })
        };
        let (unique_id, action) = match OcppFrame::parse(&station.next_frame().await).unwrap() {
            OcppFrame::Call { unique_id, action, .. } => (unique_id, action),
            other => panic!("expected Call, got {:?}", other),
        };
        assert_eq!(action, "Reset");

        let answer = json!([3, unique_id, {"status": "Accepted"}]).to_string();
        assert!(handler.handle(&answer).await.is_none());
        assert_eq!(command.await.unwrap().unwrap(), "Accepted");
    }
}
