//! Application events (pub/sub)
//!
//! Event types are defined in `domain::events`. The `EventBus`
//! implementation (broadcast channel) lives here and serves as both the
//! live-state mirror and the notification channel.

pub mod event_bus;

pub use crate::domain::events::types::*;

pub use event_bus::{create_event_bus, EventBus, EventSubscriber, SharedEventBus};
