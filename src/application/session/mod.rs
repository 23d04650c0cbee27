//! Station registry and connection bookkeeping

pub mod connection;
pub mod registry;

pub use connection::Connection;
pub use registry::{BootInfo, ClaimRejection, Registration, SharedStationRegistry, StationRegistry};
