//! Pricing, wallet locking and settlement

pub mod locks;
pub mod pricing;
pub mod settlement;

pub use locks::AccountLocks;
pub use pricing::{energy_cost, estimate_max_cost, PriceBook, SharedPriceBook};
pub use settlement::{
    split_revenue, SettlementEngine, SettlementError, SettlementOutcome, SettlementSettings,
    SharedSettlementEngine,
};
