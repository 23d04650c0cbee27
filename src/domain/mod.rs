//! Domain layer: entities, value types, errors and port traits.

pub mod billing;
pub mod confirmation;
pub mod error;
pub mod events;
pub mod ports;
pub mod station;
pub mod transaction;
pub mod wallet;

pub use billing::{PaymentRecord, PaymentRecordStatus, PaymentType, RevenueShare, RevenueShareRecord};
pub use confirmation::{ChargingConfirmationRequest, ConfirmationStatus};
pub use error::{DomainError, DomainResult};
pub use events::{Event, LiveStateUpdate, UserNotification};
pub use ports::{ConfirmationChannel, LiveStateMirror, Notifier};
pub use station::{
    Connector, ConnectorStatus, MeterSample, Station, StationInfo, StationProfile, StationStatus,
};
pub use transaction::{PaymentStatus, SessionStore, StopReason, Transaction, TransactionStatus};
pub use wallet::{UserAccount, UserRole, WalletStore};
