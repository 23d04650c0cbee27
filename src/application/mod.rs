//! Application layer: the charging core and the OCPP message handlers

pub mod billing;
pub mod charging;
pub mod commands;
pub mod core;
pub mod events;
pub mod handlers;
pub mod session;

pub use commands::{
    change_availability, remote_start_transaction, remote_stop_transaction, reset,
    unlock_connector, Availability, CommandError, CommandSender, ResetKind, SharedCommandSender,
};
pub use events::{create_event_bus, Event, EventBus, EventSubscriber, SharedEventBus};
pub use handlers::OcppHandlerV16;
pub use session::{SharedStationRegistry, StationRegistry};
