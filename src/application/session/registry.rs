//! Station registry
//!
//! In-memory directory of stations, their connectors and live connections.
//! This is the single source of truth for "is this station online" and
//! "may a transaction start on this connector".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::domain::{
    ConnectorStatus, DomainError, DomainResult, MeterSample, Station, StationProfile,
    StationStatus,
};

struct StationEntry {
    station: Station,
    connection: Option<Connection>,
}

/// Vendor data carried by BootNotification
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

/// Result of registering a connection
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub connection_id: u64,
    /// An older connection for the same station was replaced
    pub evicted: bool,
}

/// Why a connector cannot take a new transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimRejection {
    UnknownStation,
    StationOffline,
    UnknownConnector(u32),
    /// Already bound to a transaction or a start is in flight
    Busy { transaction_id: Option<i32> },
    Unavailable(ConnectorStatus),
}

/// Thread-safe registry of stations
pub struct StationRegistry {
    stations: DashMap<String, StationEntry>,
    profiles: HashMap<String, StationProfile>,
    heartbeat_interval: u32,
    sample_capacity: usize,
    next_connection_id: AtomicU64,
}

pub type SharedStationRegistry = Arc<StationRegistry>;

impl StationRegistry {
    pub fn new(
        profiles: impl IntoIterator<Item = StationProfile>,
        heartbeat_interval: u32,
        sample_capacity: usize,
    ) -> Self {
        Self {
            stations: DashMap::new(),
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
            heartbeat_interval,
            sample_capacity,
            next_connection_id: AtomicU64::new(1),
        }
    }

    // ── Connection lifecycle ───────────────────────────────

    /// Register a live connection, creating the station on first contact.
    /// A previous connection for the same id is replaced.
    pub fn connect(
        &self,
        charge_point_id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> Registration {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);

        let mut entry = self
            .stations
            .entry(charge_point_id.to_string())
            .or_insert_with(|| {
                let mut station = Station::new(charge_point_id, self.heartbeat_interval);
                if let Some(profile) = self.profiles.get(charge_point_id) {
                    profile.apply(&mut station.info);
                }
                StationEntry {
                    station,
                    connection: None,
                }
            });

        let evicted = entry.connection.is_some();
        if evicted {
            warn!(charge_point_id, "Replacing existing connection");
        }
        entry.connection = Some(Connection::new(connection_id, sender));
        entry.station.status = StationStatus::Online;
        entry.station.touch();

        info!(charge_point_id, connection_id, "Station connected");
        Registration {
            connection_id,
            evicted,
        }
    }

    /// Tear down `connection_id`. Returns `None` when that connection was
    /// already replaced, otherwise the `(connector_id, transaction_id)` pairs
    /// still bound at the time of the disconnect.
    pub fn disconnect(&self, charge_point_id: &str, connection_id: u64) -> Option<Vec<(u32, i32)>> {
        let mut entry = self.stations.get_mut(charge_point_id)?;

        match entry.connection.as_ref() {
            Some(conn) if conn.connection_id == connection_id => {}
            _ => {
                debug!(
                    charge_point_id,
                    connection_id, "Stale connection closed, session already replaced"
                );
                return None;
            }
        }

        entry.connection = None;
        entry.station.status = StationStatus::Offline;
        for connector in entry.station.connectors.values_mut() {
            connector.start_pending = None;
            connector.set_status(ConnectorStatus::Unavailable, None);
        }

        info!(charge_point_id, connection_id, "Station disconnected");
        Some(entry.station.active_transactions())
    }

    /// Evict an offline station.
    pub fn remove(&self, charge_point_id: &str) -> DomainResult<Station> {
        if self.is_online(charge_point_id) {
            return Err(DomainError::Conflict(format!(
                "Station {} is still connected",
                charge_point_id
            )));
        }
        self.stations
            .remove(charge_point_id)
            .map(|(_, entry)| {
                info!(charge_point_id, "Station removed");
                entry.station
            })
            .ok_or_else(|| DomainError::not_found("Station", "id", charge_point_id))
    }

    /// Push a raw frame to the station's outbox.
    pub fn send_to(&self, charge_point_id: &str, message: String) -> DomainResult<()> {
        let entry = self
            .stations
            .get(charge_point_id)
            .ok_or_else(|| DomainError::StationOffline(charge_point_id.to_string()))?;
        match entry.connection.as_ref() {
            Some(conn) => conn.send(message).map_err(DomainError::Storage),
            None => Err(DomainError::StationOffline(charge_point_id.to_string())),
        }
    }

    pub fn touch(&self, charge_point_id: &str) {
        if let Some(mut entry) = self.stations.get_mut(charge_point_id) {
            entry.station.touch();
            if let Some(conn) = entry.connection.as_mut() {
                conn.touch();
            }
        }
    }

    /// Apply BootNotification data. Returns the heartbeat interval to hand back.
    pub fn record_boot(&self, charge_point_id: &str, boot: BootInfo) -> DomainResult<u32> {
        let mut entry = self
            .stations
            .get_mut(charge_point_id)
            .ok_or_else(|| DomainError::not_found("Station", "id", charge_point_id))?;

        let station = &mut entry.station;
        station.info.vendor = Some(boot.vendor);
        station.info.model = Some(boot.model);
        station.info.serial_number = boot.serial_number;
        station.info.firmware_version = boot.firmware_version;
        station.boot_at = Some(Utc::now());
        station.heartbeat_interval = self.heartbeat_interval;
        station.touch();
        Ok(station.heartbeat_interval)
    }

    // ── Connector state ────────────────────────────────────

    /// Record a station-reported connector status. Connector 0 addresses the
    /// station as a whole and is not tracked as a connector.
    pub fn update_connector_status(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
        error_code: Option<String>,
    ) -> DomainResult<()> {
        let mut entry = self
            .stations
            .get_mut(charge_point_id)
            .ok_or_else(|| DomainError::not_found("Station", "id", charge_point_id))?;

        if connector_id == 0 {
            debug!(charge_point_id, %status, "Station-level status");
            return Ok(());
        }

        let connector = entry
            .station
            .connector_mut(connector_id, self.sample_capacity);
        connector.set_status(status, error_code);
        Ok(())
    }

    /// Reserve a connector for a start request in flight. Exactly one claim
    /// can succeed per connector until it is bound or released. The claim is
    /// tied to the current connection, whose id is returned as the token.
    pub fn claim_connector(
        &self,
        charge_point_id: &str,
        connector_id: u32,
    ) -> Result<u64, ClaimRejection> {
        let mut entry = self
            .stations
            .get_mut(charge_point_id)
            .ok_or(ClaimRejection::UnknownStation)?;

        let connection_id = match entry.connection.as_ref() {
            Some(conn) if entry.station.is_online() => conn.connection_id,
            _ => return Err(ClaimRejection::StationOffline),
        };

        let connector = entry
            .station
            .connectors
            .get_mut(&connector_id)
            .ok_or(ClaimRejection::UnknownConnector(connector_id))?;

        if !connector.is_free() {
            return Err(ClaimRejection::Busy {
                transaction_id: connector.transaction_id,
            });
        }
        if connector.status.blocks_start() {
            return Err(ClaimRejection::Unavailable(connector.status));
        }

        connector.start_pending = Some(connection_id);
        Ok(connection_id)
    }

    /// Drop a claim without binding a transaction. A claim taken by another
    /// connection is left alone.
    pub fn release_claim(&self, charge_point_id: &str, connector_id: u32, claim: u64) {
        if let Some(mut entry) = self.stations.get_mut(charge_point_id) {
            if let Some(connector) = entry.station.connectors.get_mut(&connector_id) {
                if connector.start_pending == Some(claim) {
                    connector.start_pending = None;
                }
            }
        }
    }

    /// Whether `claim` still holds the connector on a live connection.
    pub fn holds_claim(&self, charge_point_id: &str, connector_id: u32, claim: u64) -> bool {
        self.stations
            .get(charge_point_id)
            .map(|e| {
                e.connection.as_ref().map(|c| c.connection_id) == Some(claim)
                    && e.station
                        .connectors
                        .get(&connector_id)
                        .is_some_and(|c| c.start_pending == Some(claim))
            })
            .unwrap_or(false)
    }

    /// Bind an accepted transaction to its claimed connector and flip it to
    /// Charging. Fails unless `claim` still holds the connector on the
    /// station's current connection.
    pub fn bind_transaction(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        claim: u64,
        transaction_id: i32,
    ) -> DomainResult<()> {
        let mut entry = self
            .stations
            .get_mut(charge_point_id)
            .ok_or_else(|| DomainError::not_found("Station", "id", charge_point_id))?;

        if entry.connection.as_ref().map(|c| c.connection_id) != Some(claim) {
            return Err(DomainError::StationOffline(charge_point_id.to_string()));
        }

        let station = &mut entry.station;
        let connector = station
            .connectors
            .get_mut(&connector_id)
            .ok_or_else(|| DomainError::not_found("Connector", "id", connector_id))?;

        if let Some(existing) = connector.transaction_id {
            return Err(DomainError::Conflict(format!(
                "Connector {} already bound to transaction {}",
                connector_id, existing
            )));
        }
        if connector.start_pending != Some(claim) {
            return Err(DomainError::Conflict(format!(
                "Connector {} is not claimed by connection {}",
                connector_id, claim
            )));
        }

        connector.transaction_id = Some(transaction_id);
        connector.start_pending = None;
        connector.set_status(ConnectorStatus::Charging, None);
        station.transactions.insert(transaction_id);
        Ok(())
    }

    /// Clear the connector holding `transaction_id`, optionally setting its
    /// status. Returns the connector id it was bound to.
    pub fn unbind_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i32,
        status_after: Option<ConnectorStatus>,
    ) -> Option<u32> {
        let mut entry = self.stations.get_mut(charge_point_id)?;
        let connector = entry
            .station
            .connectors
            .values_mut()
            .find(|c| c.transaction_id == Some(transaction_id))?;

        connector.transaction_id = None;
        if let Some(status) = status_after {
            connector.set_status(status, None);
        }
        Some(connector.id)
    }

    pub fn push_meter_sample(&self, charge_point_id: &str, connector_id: u32, sample: MeterSample) {
        if let Some(mut entry) = self.stations.get_mut(charge_point_id) {
            entry
                .station
                .connector_mut(connector_id, self.sample_capacity)
                .push_sample(sample);
        }
    }

    // ── Queries ────────────────────────────────────────────

    pub fn is_online(&self, charge_point_id: &str) -> bool {
        self.stations
            .get(charge_point_id)
            .map(|e| e.station.is_online() && e.connection.is_some())
            .unwrap_or(false)
    }

    /// Owner from the live station, else from its provisioning profile.
    pub fn owner_of(&self, charge_point_id: &str) -> Option<String> {
        self.stations
            .get(charge_point_id)
            .and_then(|e| e.station.info.owner_id.clone())
            .or_else(|| {
                self.profiles
                    .get(charge_point_id)
                    .and_then(|p| p.owner_id.clone())
            })
    }

    pub fn connector_transaction(&self, charge_point_id: &str, connector_id: u32) -> Option<i32> {
        self.stations
            .get(charge_point_id)
            .and_then(|e| e.station.connectors.get(&connector_id).and_then(|c| c.transaction_id))
    }

    pub fn connection_id(&self, charge_point_id: &str) -> Option<u64> {
        self.stations
            .get(charge_point_id)
            .and_then(|e| e.connection.as_ref().map(|c| c.connection_id))
    }

    /// Point-in-time copy of a station.
    pub fn snapshot(&self, charge_point_id: &str) -> Option<Station> {
        self.stations.get(charge_point_id).map(|e| e.station.clone())
    }

    pub fn station_ids(&self) -> Vec<String> {
        self.stations.iter().map(|r| r.key().clone()).collect()
    }

    pub fn online_count(&self) -> usize {
        self.stations.iter().filter(|r| r.station.is_online()).count()
    }

    pub fn count(&self) -> usize {
        self.stations.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StationRegistry {
        StationRegistry::new(
            vec![StationProfile {
                id: "CP001".into(),
                owner_id: Some("owner-1".into()),
                name: Some("Depot".into()),
                ..Default::default()
            }],
            300,
            4,
        )
    }

    fn connect(reg: &StationRegistry, id: &str) -> (Registration, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (reg.connect(id, tx), rx)
    }

    #[test]
    fn connect_applies_profile_and_goes_online() {
        let reg = registry();
        let (registration, _rx) = connect(&reg, "CP001");
        assert!(!registration.evicted);
        assert!(reg.is_online("CP001"));
        assert_eq!(reg.owner_of("CP001").as_deref(), Some("owner-1"));
        let station = reg.snapshot("CP001").unwrap();
        assert_eq!(station.info.name.as_deref(), Some("Depot"));
    }

    #[test]
    fn send_to_offline_station_fails() {
        let reg = registry();
        assert!(matches!(
            reg.send_to("CP404", "x".into()),
            Err(DomainError::StationOffline(_))
        ));
    }

    #[test]
    fn reconnect_evicts_old_connection_and_ignores_its_teardown() {
        let reg = registry();
        let (first, _rx1) = connect(&reg, "CP001");
        let (second, mut rx2) = connect(&reg, "CP001");
        assert!(second.evicted);

        assert!(reg.disconnect("CP001", first.connection_id).is_none());
        assert!(reg.is_online("CP001"));

        reg.send_to("CP001", "ping".into()).unwrap();
        assert_eq!(rx2.try_recv().unwrap(), "ping");
    }

    #[test]
    fn claim_requires_known_free_connector() {
        let reg = registry();
        let (_r, _rx) = connect(&reg, "CP001");

        assert_eq!(
            reg.claim_connector("CP001", 1),
            Err(ClaimRejection::UnknownConnector(1))
        );

        reg.update_connector_status("CP001", 1, ConnectorStatus::Preparing, None)
            .unwrap();
        let claim = reg.claim_connector("CP001", 1).unwrap();
        assert_eq!(
            reg.claim_connector("CP001", 1),
            Err(ClaimRejection::Busy {
                transaction_id: None
            })
        );

        reg.release_claim("CP001", 1, claim);
        assert!(reg.claim_connector("CP001", 1).is_ok());
    }

    #[test]
    fn claim_from_replaced_connection_cannot_bind() {
        let reg = registry();
        let (first, _rx1) = connect(&reg, "CP001");
        reg.update_connector_status("CP001", 1, ConnectorStatus::Available, None)
            .unwrap();
        let stale = reg.claim_connector("CP001", 1).unwrap();
        assert_eq!(stale, first.connection_id);

        reg.disconnect("CP001", first.connection_id);
        let (second, _rx2) = connect(&reg, "CP001");
        reg.update_connector_status("CP001", 1, ConnectorStatus::Available, None)
            .unwrap();
        assert!(!reg.holds_claim("CP001", 1, stale));
        assert!(reg.bind_transaction("CP001", 1, stale, 9).is_err());
        assert_eq!(reg.connector_transaction("CP001", 1), None);

        let fresh = reg.claim_connector("CP001", 1).unwrap();
        assert_eq!(fresh, second.connection_id);
        // The stale request's cleanup leaves the new claim in place
        reg.release_claim("CP001", 1, stale);
        assert!(reg.holds_claim("CP001", 1, fresh));
        reg.bind_transaction("CP001", 1, fresh, 9).unwrap();
    }

    #[test]
    fn faulted_connector_rejects_claim_until_recovered() {
        let reg = registry();
        let (_r, _rx) = connect(&reg, "CP001");
        reg.update_connector_status("CP001", 1, ConnectorStatus::Faulted, Some("GroundFailure".into()))
            .unwrap();
        assert_eq!(
            reg.claim_connector("CP001", 1),
            Err(ClaimRejection::Unavailable(ConnectorStatus::Faulted))
        );

        reg.update_connector_status("CP001", 1, ConnectorStatus::Available, None)
            .unwrap();
        assert!(reg.claim_connector("CP001", 1).is_ok());
    }

    #[test]
    fn bind_and_unbind_transaction() {
        let reg = registry();
        let (_r, _rx) = connect(&reg, "CP001");
        reg.update_connector_status("CP001", 1, ConnectorStatus::Preparing, None)
            .unwrap();
        let claim = reg.claim_connector("CP001", 1).unwrap();
        reg.bind_transaction("CP001", 1, claim, 42).unwrap();

        let station = reg.snapshot("CP001").unwrap();
        assert_eq!(station.connectors[&1].status, ConnectorStatus::Charging);
        assert!(station.transactions.contains(&42));
        assert!(reg.bind_transaction("CP001", 1, claim, 43).is_err());
        assert_eq!(
            reg.claim_connector("CP001", 1),
            Err(ClaimRejection::Busy {
                transaction_id: Some(42)
            })
        );

        assert_eq!(
            reg.unbind_transaction("CP001", 42, Some(ConnectorStatus::Available)),
            Some(1)
        );
        assert_eq!(reg.connector_transaction("CP001", 1), None);
        assert_eq!(
            reg.snapshot("CP001").unwrap().connectors[&1].status,
            ConnectorStatus::Available
        );
    }

    #[test]
    fn disconnect_marks_everything_unavailable() {
        let reg = registry();
        let (registration, _rx) = connect(&reg, "CP001");
        reg.update_connector_status("CP001", 1, ConnectorStatus::Preparing, None)
            .unwrap();
        reg.update_connector_status("CP001", 2, ConnectorStatus::Available, None)
            .unwrap();
        let claim = reg.claim_connector("CP001", 1).unwrap();
        reg.bind_transaction("CP001", 1, claim, 7).unwrap();

        let active = reg.disconnect("CP001", registration.connection_id).unwrap();
        assert_eq!(active, vec![(1, 7)]);
        assert!(!reg.is_online("CP001"));

        let station = reg.snapshot("CP001").unwrap();
        assert_eq!(station.status, StationStatus::Offline);
        assert!(station
            .connectors
            .values()
            .all(|c| c.status == ConnectorStatus::Unavailable));
    }

    #[test]
    fn remove_only_offline_stations() {
        let reg = registry();
        let (registration, _rx) = connect(&reg, "CP001");
        assert!(matches!(reg.remove("CP001"), Err(DomainError::Conflict(_))));

        reg.disconnect("CP001", registration.connection_id);
        assert!(reg.remove("CP001").is_ok());
        assert_eq!(reg.count(), 0);
        assert!(matches!(reg.remove("CP001"), Err(DomainError::NotFound { .. })));
    }

    #[test]
    fn boot_fills_vendor_info() {
        let reg = registry();
        let (_r, _rx) = connect(&reg, "CP001");
        let interval = reg
            .record_boot(
                "CP001",
                BootInfo {
                    vendor: "Acme".into(),
                    model: "X1".into(),
                    serial_number: Some("SN1".into()),
                    firmware_version: None,
                },
            )
            .unwrap();
        assert_eq!(interval, 300);
        let station = reg.snapshot("CP001").unwrap();
        assert_eq!(station.info.vendor.as_deref(), Some("Acme"));
        assert!(station.boot_at.is_some());
    }
}
