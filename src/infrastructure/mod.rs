//! Infrastructure layer: WebSocket transport and in-memory stores

pub mod server;
pub mod storage;

pub use server::OcppServer;
pub use storage::{InMemoryConfirmationChannel, InMemorySessionStore, InMemoryWalletStore};
