use serde::{Deserialize, Serialize};

/// Account role. Only `Owner` accounts receive revenue shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Customer,
    Owner,
    Platform,
    Admin,
}

/// A wallet holder as seen by the identity store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    #[serde(default)]
    pub role: UserRole,
    /// Balance in minor currency units, never negative
    #[serde(default)]
    pub balance: i64,
}

impl UserAccount {
    pub fn new(id: impl Into<String>, role: UserRole, balance: i64) -> Self {
        Self {
            id: id.into(),
            role,
            balance,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role == UserRole::Owner
    }
}
