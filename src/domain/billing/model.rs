use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentType {
    Payment,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentRecordStatus {
    Completed,
    Failed,
}

/// Append-only wallet movement history
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub id: String,
    pub kind: PaymentType,
    pub amount: i64,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub user_id: String,
    pub transaction_id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    pub status: PaymentRecordStatus,
    /// Failure detail for `Failed` records
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn is_completed(&self) -> bool {
        self.status == PaymentRecordStatus::Completed
    }
}

/// One leg of a revenue split
#[derive(Debug, Clone, PartialEq)]
pub struct RevenueShare {
    pub amount: i64,
    pub rate: Decimal,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevenueShareRecord {
    pub id: String,
    pub transaction_id: i32,
    pub charge_point_id: String,
    pub connector_id: u32,
    pub total: i64,
    pub commission: RevenueShare,
    pub owner: RevenueShare,
    pub timestamp: DateTime<Utc>,
}

impl RevenueShareRecord {
    pub fn is_balanced(&self) -> bool {
        self.commission.amount + self.owner.amount == self.total
    }
}
