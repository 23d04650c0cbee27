//! Charging station and connector entities

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connector status as reported by the station (OCPP 1.6 `ChargePointStatus`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectorStatus {
    #[default]
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    /// Statuses in which no new transaction may be started.
    pub fn blocks_start(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Faulted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEV => "SuspendedEV",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Station connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StationStatus {
    Online,
    #[default]
    Offline,
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// One energy/power reading taken from a MeterValues message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    /// Cumulative energy register (Wh)
    pub energy_wh: Option<f64>,
    /// Instantaneous active power (W)
    pub power_w: Option<f64>,
    /// State of charge (%)
    pub soc: Option<f64>,
}

/// Descriptive station data: vendor fields come from BootNotification,
/// ownership and location from provisioning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A physical outlet on a station
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: u32,
    pub status: ConnectorStatus,
    pub error_code: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Transaction currently bound to this connector
    pub transaction_id: Option<i32>,
    pub reservation_id: Option<i32>,
    /// Connection whose start request is going through authorization
    pub start_pending: Option<u64>,
    samples: VecDeque<MeterSample>,
    sample_capacity: usize,
}

impl Connector {
    pub fn new(id: u32, sample_capacity: usize) -> Self {
        Self {
            id,
            status: ConnectorStatus::default(),
            error_code: None,
            updated_at: Utc::now(),
            transaction_id: None,
            reservation_id: None,
            start_pending: None,
            samples: VecDeque::with_capacity(sample_capacity),
            sample_capacity: sample_capacity.max(1),
        }
    }

    pub fn set_status(&mut self, status: ConnectorStatus, error_code: Option<String>) {
        self.status = status;
        self.error_code = error_code;
        self.updated_at = Utc::now();
    }

    /// Append to the ring buffer, dropping the oldest sample when full.
    pub fn push_sample(&mut self, sample: MeterSample) {
        if self.samples.len() == self.sample_capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn samples(&self) -> impl Iterator<Item = &MeterSample> {
        self.samples.iter()
    }

    pub fn latest_sample(&self) -> Option<&MeterSample> {
        self.samples.back()
    }

    /// No bound transaction and no start in flight.
    pub fn is_free(&self) -> bool {
        self.transaction_id.is_none() && self.start_pending.is_none()
    }
}

/// Charging station entity (connection handle lives in the session registry)
#[derive(Debug, Clone)]
pub struct Station {
    pub id: String,
    pub status: StationStatus,
    pub info: StationInfo,
    pub connectors: BTreeMap<u32, Connector>,
    pub last_seen: DateTime<Utc>,
    pub boot_at: Option<DateTime<Utc>>,
    pub heartbeat_interval: u32,
    /// Ids of every transaction started on this station
    pub transactions: BTreeSet<i32>,
}

impl Station {
    pub fn new(id: impl Into<String>, heartbeat_interval: u32) -> Self {
        Self {
            id: id.into(),
            status: StationStatus::Offline,
            info: StationInfo::default(),
            connectors: BTreeMap::new(),
            last_seen: Utc::now(),
            boot_at: None,
            heartbeat_interval,
            transactions: BTreeSet::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == StationStatus::Online
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn connector_mut(&mut self, connector_id: u32, sample_capacity: usize) -> &mut Connector {
        self.connectors
            .entry(connector_id)
            .or_insert_with(|| Connector::new(connector_id, sample_capacity))
    }

    /// Connectors that currently hold a transaction, as `(connector_id, transaction_id)`.
    pub fn active_transactions(&self) -> Vec<(u32, i32)> {
        self.connectors
            .values()
            .filter_map(|c| c.transaction_id.map(|tx| (c.id, tx)))
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────
