//! Payment and revenue-share history records

pub mod model;

pub use model::{
    PaymentRecord, PaymentRecordStatus, PaymentType, RevenueShare, RevenueShareRecord,
};
