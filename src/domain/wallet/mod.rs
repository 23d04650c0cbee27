//! Prepaid wallet accounts

pub mod model;
pub mod repository;

pub use model::{UserAccount, UserRole};
pub use repository::WalletStore;
