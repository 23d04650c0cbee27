//! Flat per-kWh tariff
//!
//! The current price is shared through a `watch` channel so the settlement
//! engine, meter ingestion and authorization all read the same value, and
//! listeners can react to changes.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{DomainError, DomainResult, SessionStore};
use crate::shared::ShutdownSignal;

/// Cost of `energy_wh` at `price_per_kwh`, rounded up to a whole unit.
/// `None` when the result does not fit.
pub fn energy_cost(energy_wh: i64, price_per_kwh: i64) -> Option<i64> {
    let kwh = Decimal::from(energy_wh.max(0)) / Decimal::from(1000);
    kwh.checked_mul(Decimal::from(price_per_kwh))?
        .ceil()
        .to_i64()
}

/// Upper-bound cost of a session drawing `average_kw` for `hours`.
pub fn estimate_max_cost(average_kw: f64, hours: f64, price_per_kwh: i64) -> Option<i64> {
    let kwh = Decimal::from_f64_retain(average_kw * hours)?.round_dp(6);
    kwh.checked_mul(Decimal::from(price_per_kwh))?.ceil().to_i64()
}

/// Process-wide current price per kWh
pub struct PriceBook {
    sender: watch::Sender<i64>,
}

pub type SharedPriceBook = Arc<PriceBook>;

impl PriceBook {
    pub fn new(initial_price_per_kwh: i64) -> Self {
        let (sender, _) = watch::channel(initial_price_per_kwh);
        Self { sender }
    }

    pub fn current(&self) -> i64 {
        *self.sender.borrow()
    }

    /// Replace the price. Returns `true` if it changed.
    pub fn set(&self, price_per_kwh: i64) -> DomainResult<bool> {
        if price_per_kwh < 0 {
            return Err(DomainError::Validation(format!(
                "price per kWh must not be negative, got {}",
                price_per_kwh
            )));
        }
        let changed = self.sender.send_if_modified(|current| {
            if *current == price_per_kwh {
                false
            } else {
                *current = price_per_kwh;
                true
            }
        });
        if changed {
            info!(price_per_kwh, "Tariff updated");
        }
        Ok(changed)
    }

    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.sender.subscribe()
    }

    /// Reload the tariff from the session store. Keeps the current price
    /// when the store has none.
    pub async fn refresh_from(&self, store: &dyn SessionStore) -> DomainResult<i64> {
        match store.current_tariff().await? {
            Some(price) => {
                self.set(price)?;
            }
            None => debug!("No stored tariff, keeping current price"),
        }
        Ok(self.current())
    }

    /// Periodic refresh until shutdown.
    pub fn spawn_refresh(
        self: Arc<Self>,
        store: Arc<dyn SessionStore>,
        every: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_from(store.as_ref()).await {
                            warn!(error = %e, "Tariff refresh failed");
                        }
                    }
                    _ = shutdown.wait() => {
                        debug!("Tariff refresh stopped");
                        break;
                    }
                }
            }
        })
    }
}
