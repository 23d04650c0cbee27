//! In-memory implementations of the external store ports

mod confirmation;
mod memory;
mod wallet;

pub use confirmation::InMemoryConfirmationChannel;
pub use memory::InMemorySessionStore;
pub use wallet::InMemoryWalletStore;
