//! Transaction domain entity

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::station::MeterSample;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Completed,
    Failed,
}

/// Settlement progress of a closed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Not settled yet
    Pending,
    /// Settlement has claimed the transaction
    Processing,
    Paid,
    Failed,
    Error,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Refunded => "refunded",
        }
    }
}

/// Why a transaction ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Reason as reported in StopTransaction (`Local`, `Remote`, `EVDisconnected`, ...)
    Reported(String),
    /// Closed by the central system because the station connection dropped
    StationDisconnected,
    /// Stopped by the balance cutoff during charging
    StoppedBySystem,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported(reason) => f.write_str(reason),
            Self::StationDisconnected => f.write_str("StationDisconnected"),
            Self::StoppedBySystem => f.write_str("StoppedBySystem"),
        }
    }
}

/// Charging transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    /// Payer identity
    pub id_tag: String,
    /// Meter value at start (Wh)
    pub meter_start: i32,
    /// Meter value at stop (Wh), never below `meter_start`
    pub meter_stop: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub stop_reason: Option<StopReason>,
    pub duration_secs: i64,
    pub energy_consumed_wh: i64,
    /// Last cumulative register reading (Wh)
    pub last_meter_value: Option<f64>,
    pub current_power_w: Option<f64>,
    pub meter_log: Vec<MeterSample>,
    /// Maximum session cost estimated during authorization
    pub estimated_cost: Option<i64>,
    /// Balance cutoff already requested a remote stop
    pub stopped_by_system: bool,
    pub payment_status: PaymentStatus,
    /// Settled cost, set once settlement has priced the session
    pub cost: Option<i64>,
}

impl Transaction {
    pub fn new(
        id: i32,
        charge_point_id: impl Into<String>,
        connector_id: u32,
        id_tag: impl Into<String>,
        meter_start: i32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            charge_point_id: charge_point_id.into(),
            connector_id,
            id_tag: id_tag.into(),
            meter_start,
            meter_stop: None,
            started_at,
            stopped_at: None,
            status: TransactionStatus::Active,
            stop_reason: None,
            duration_secs: 0,
            energy_consumed_wh: 0,
            last_meter_value: None,
            current_power_w: None,
            meter_log: Vec::new(),
            estimated_cost: None,
            stopped_by_system: false,
            payment_status: PaymentStatus::Pending,
            cost: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Apply a meter sample: append to the log and recompute the running totals.
    pub fn record_sample(&mut self, sample: MeterSample) {
        if let Some(energy) = sample.energy_wh {
            self.last_meter_value = Some(energy);
            self.energy_consumed_wh = (energy.round() as i64 - self.meter_start as i64).max(0);
        }
        if let Some(power) = sample.power_w {
            self.current_power_w = Some(power);
        }
        self.duration_secs = (sample.timestamp - self.started_at).num_seconds().max(0);
        self.meter_log.push(sample);
    }

    /// Best known register value, used when the station cannot report `meterStop`.
    pub fn last_known_meter(&self) -> i32 {
        self.last_meter_value
            .map(|v| v.round() as i32)
            .unwrap_or(self.meter_start)
            .max(self.meter_start)
    }

    /// Close the transaction. A `meter_stop` below `meter_start` is clamped so
    /// consumed energy never goes negative; returns `true` if clamping happened.
    pub fn close(&mut self, meter_stop: i32, stopped_at: DateTime<Utc>, reason: StopReason) -> bool {
        let clamped = meter_stop < self.meter_start;
        let meter_stop = meter_stop.max(self.meter_start);

        self.meter_stop = Some(meter_stop);
        self.stopped_at = Some(stopped_at);
        self.stop_reason = Some(reason);
        self.status = TransactionStatus::Completed;
        self.energy_consumed_wh = meter_stop as i64 - self.meter_start as i64;
        self.duration_secs = (stopped_at - self.started_at).num_seconds().max(0);
        clamped
    }

    pub fn energy_kwh(&self) -> f64 {
        self.energy_consumed_wh as f64 / 1000.0
    }
}

// ── Tests ──────────────────────────────────────────────────────
