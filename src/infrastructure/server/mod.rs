//! WebSocket server module

mod websocket;

pub use websocket::{extract_charge_point_id, OcppServer};
