//! Per-account serialization of wallet read-modify-write sequences

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the returned guard for the whole check-then-adjust sequence.
    pub async fn lock(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_account_is_serialized() {
        let locks = Arc::new(AccountLocks::new());
        let guard = locks.lock("user-1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("user-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_accounts_do_not_block() {
        let locks = AccountLocks::new();
        let _a = locks.lock("user-1").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock("user-2"))
            .await
            .expect("independent lock");
    }
}
