//! Station aggregate
//!
//! Stations, their connectors and the provisioning profile applied on connect.

pub mod model;

pub use model::{
    Connector, ConnectorStatus, MeterSample, Station, StationInfo, StationStatus,
};

use serde::Deserialize;

/// Static station data loaded from configuration (`[[stations]]`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationProfile {
    pub id: String,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StationProfile {
    pub fn apply(&self, info: &mut StationInfo) {
        info.owner_id = self.owner_id.clone();
        info.name = self.name.clone();
        info.address = self.address.clone();
        info.latitude = self.latitude;
        info.longitude = self.longitude;
    }
}
