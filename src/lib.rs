//! # VoltPay OCPP Central System
//!
//! OCPP 1.6-J central system for prepaid EV charging: stations connect over
//! WebSocket, drivers confirm each start against their wallet balance,
//! charging is cut off when the balance runs out, and every finished
//! session is settled with an owner/platform revenue split.
//!
//! ## Architecture
//!
//! - **domain**: entities, value types, errors and the port traits for the
//!   external stores
//! - **application**: registry, RPC correlation, charging flow, settlement
//!   and the OCPP message handlers
//! - **infrastructure**: WebSocket server and in-memory store adapters
//! - **shared**: OCPP-J framing, retry and shutdown utilities

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod server;
pub mod shared;

#[cfg(test)]
pub(crate) mod test_support;

pub use application::core::{ChargingCore, ExternalPorts, SharedChargingCore};
pub use application::events::{create_event_bus, Event, EventBus, SharedEventBus};
pub use config::{default_config_path, AppConfig};
