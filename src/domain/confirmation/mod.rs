//! Charging confirmation handshake records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Ephemeral per-user record awaiting the user's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingConfirmationRequest {
    /// Distinguishes a request from a later one for the same payer
    pub id: String,
    pub user_id: String,
    pub charge_point_id: String,
    pub connector_id: u32,
    pub requested_at: DateTime<Utc>,
    pub status: ConfirmationStatus,
    pub estimated_cost: i64,
}

impl ChargingConfirmationRequest {
    pub fn pending(
        user_id: impl Into<String>,
        charge_point_id: impl Into<String>,
        connector_id: u32,
        estimated_cost: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            charge_point_id: charge_point_id.into(),
            connector_id,
            requested_at: Utc::now(),
            status: ConfirmationStatus::Pending,
            estimated_cost,
        }
    }
}
