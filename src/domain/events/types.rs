//! Domain events
//!
//! Live-state updates mirrored to dashboards, user-facing notifications and
//! transaction lifecycle facts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live station state forwarded to the external mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveStateUpdate {
    StationOnline {
        charge_point_id: String,
        timestamp: DateTime<Utc>,
    },
    StationOffline {
        charge_point_id: String,
        timestamp: DateTime<Utc>,
    },
    ConnectorStatus {
        charge_point_id: String,
        connector_id: u32,
        status: String,
        error_code: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Meter {
        charge_point_id: String,
        connector_id: u32,
        transaction_id: Option<i32>,
        energy_wh: Option<f64>,
        power_w: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    SessionCost {
        charge_point_id: String,
        transaction_id: i32,
        energy_consumed_wh: i64,
        estimated_cost: i64,
        timestamp: DateTime<Utc>,
    },
}

impl LiveStateUpdate {
    pub fn charge_point_id(&self) -> &str {
        match self {
            Self::StationOnline { charge_point_id, .. }
            | Self::StationOffline { charge_point_id, .. }
            | Self::ConnectorStatus { charge_point_id, .. }
            | Self::Meter { charge_point_id, .. }
            | Self::SessionCost { charge_point_id, .. } => charge_point_id,
        }
    }
}

/// Typed user-facing message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserNotification {
    InsufficientBalance {
        charge_point_id: String,
        connector_id: u32,
        balance: i64,
        required: i64,
        shortfall: i64,
    },
    PaymentSuccess {
        transaction_id: i32,
        amount: i64,
        new_balance: i64,
        energy_consumed_wh: i64,
    },
    PaymentFailed {
        transaction_id: i32,
        amount: i64,
        balance: Option<i64>,
        reason: String,
    },
    PaymentError {
        transaction_id: i32,
        reason: String,
    },
    ChargingStopped {
        transaction_id: i32,
        charge_point_id: String,
        balance: i64,
        cost_so_far: i64,
    },
}

impl UserNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::PaymentSuccess { .. } => "payment_success",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::PaymentError { .. } => "payment_error",
            Self::ChargingStopped { .. } => "charging_stopped",
        }
    }
}

/// Everything published on the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    LiveState(LiveStateUpdate),
    Notification {
        user_id: String,
        notification: UserNotification,
    },
    TransactionStarted(TransactionStartedEvent),
    TransactionStopped(TransactionStoppedEvent),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::LiveState(_) => "live_state",
            Event::Notification { .. } => "notification",
            Event::TransactionStarted(_) => "transaction_started",
            Event::TransactionStopped(_) => "transaction_stopped",
        }
    }

    pub fn charge_point_id(&self) -> Option<&str> {
        match self {
            Event::LiveState(update) => Some(update.charge_point_id()),
            Event::Notification { .. } => None,
            Event::TransactionStarted(e) => Some(&e.charge_point_id),
            Event::TransactionStopped(e) => Some(&e.charge_point_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStartedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: String,
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStoppedEvent {
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: String,
    pub meter_stop: i32,
    pub energy_consumed_wh: i64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Wrapper for sending events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_with_kind_tag() {
        let n = UserNotification::InsufficientBalance {
            charge_point_id: "CP001".into(),
            connector_id: 1,
            balance: 5_000,
            required: 50_000,
            shortfall: 45_000,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "insufficient_balance");
        assert_eq!(json["shortfall"], 45_000);
        assert_eq!(n.kind(), "insufficient_balance");
    }

    #[test]
    fn event_message_flattens_event() {
        let msg = EventMessage::new(Event::LiveState(LiveStateUpdate::StationOnline {
            charge_point_id: "CP001".into(),
            timestamp: Utc::now(),
        }));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "LiveState");
        assert_eq!(json["data"]["kind"], "station_online");
        assert_eq!(msg.event.charge_point_id(), Some("CP001"));
    }
}
