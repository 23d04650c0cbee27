//! Transaction aggregate
//!
//! Contains the Transaction entity, related types, and the session store interface.

pub mod model;
pub mod repository;

pub use model::{PaymentStatus, StopReason, Transaction, TransactionStatus};
pub use repository::SessionStore;
