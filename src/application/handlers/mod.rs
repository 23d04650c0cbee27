//! OCPP message handlers

pub mod inbound;
mod ocpp_v16;
mod ocpp_v16_handler;

pub use inbound::{InboundCall, ProtocolError};
pub use ocpp_v16_handler::OcppHandlerV16;
