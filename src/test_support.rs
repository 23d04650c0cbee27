//! Test wiring: the charging core over in-memory ports with short timeouts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::application::billing::{SharedPriceBook, SharedSettlementEngine};
use crate::application::charging::{
    AuthorizationSettings, ChargingAuthorizer, SharedChargingAuthorizer, SharedMeterIngestion,
    SharedTransactionLedger,
};
use crate::application::core::{ChargingCore, ExternalPorts};
use crate::application::events::{create_event_bus, Event, EventSubscriber};
use crate::application::session::SharedStationRegistry;
use crate::config::AppConfig;
use crate::domain::{
    ConnectorStatus, StationProfile, StopReason, Transaction, UserAccount, UserNotification,
    UserRole, WalletStore,
};
use crate::infrastructure::storage::{
    InMemoryConfirmationChannel, InMemorySessionStore, InMemoryWalletStore,
};

const CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(250);
const RETRY_DELAY: Duration = Duration::from_millis(10);
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct Harness {
    pub core: Arc<ChargingCore>,
    pub registry: SharedStationRegistry,
    pub ledger: SharedTransactionLedger,
    pub authorizer: SharedChargingAuthorizer,
    pub metering: SharedMeterIngestion,
    pub settlement: SharedSettlementEngine,
    pub prices: SharedPriceBook,
    pub sessions: Arc<InMemorySessionStore>,
    pub wallets: Arc<InMemoryWalletStore>,
    pub confirmations: Arc<InMemoryConfirmationChannel>,
    events: Mutex<EventSubscriber>,
    seen: Mutex<Vec<(String, UserNotification)>>,
}

pub(crate) struct TestStation {
    pub connection_id: u64,
    /// Sender side of the registered outbox, for building handlers
    pub outbox: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl TestStation {
    /// Next frame written to this station's outbox.
    pub async fn next_frame(&mut self) -> String {
        tokio::time::timeout(FRAME_TIMEOUT, self.rx.recv())
            .await
            .expect("no frame within timeout")
            .expect("outbox closed")
    }
}

pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.ocpp.call_timeout_secs = 1;
    config.billing.settlement_retry_delay_ms = RETRY_DELAY.as_millis() as u64;
    config.stations = vec![StationProfile {
        id: "CP001".into(),
        owner_id: Some("owner-1".into()),
        name: Some("Depot 1".into()),
        address: None,
        latitude: None,
        longitude: None,
    }];
    config.accounts = vec![
        UserAccount::new("driver-1", UserRole::Customer, 100_000),
        UserAccount::new("owner-1", UserRole::Owner, 0),
        UserAccount::new("platform", UserRole::Platform, 0),
    ];
    config
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config())
    }

    pub async fn with_retry_delay(delay: Duration) -> Self {
        let mut config = test_config();
        config.billing.settlement_retry_delay_ms = delay.as_millis() as u64;
        Self::with_config(config)
    }

    fn with_config(config: AppConfig) -> Self {
        let sessions = Arc::new(InMemorySessionStore::new());
        let wallets = Arc::new(InMemoryWalletStore::with_accounts(config.accounts.clone()));
        let confirmations = Arc::new(InMemoryConfirmationChannel::new());
        let bus = create_event_bus();
        let events = Mutex::new(bus.subscribe());

        let ports =
            ExternalPorts::with_event_bus(sessions.clone(), wallets.clone(), confirmations.clone(), &bus);
        let mut core = ChargingCore::new(&config, ports.clone(), bus);
        core.authorizer = Arc::new(ChargingAuthorizer::new(
            core.registry.clone(),
            core.ledger.clone(),
            ports.wallets.clone(),
            ports.confirmations.clone(),
            ports.notifier.clone(),
            core.prices.clone(),
            AuthorizationSettings {
                confirmation_timeout: CONFIRMATION_TIMEOUT,
                ..AuthorizationSettings::from(&config.charging)
            },
        ));
        let core = Arc::new(core);

        Self {
            registry: core.registry.clone(),
            ledger: core.ledger.clone(),
            authorizer: core.authorizer.clone(),
            metering: core.metering.clone(),
            settlement: core.settlement.clone(),
            prices: core.prices.clone(),
            core,
            sessions,
            wallets,
            confirmations,
            events,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Connect `charge_point_id` and report connector 1 as Available.
    pub async fn connect(&self, charge_point_id: &str) -> TestStation {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.core.handle_connect(charge_point_id, tx.clone());
        self.registry
            .update_connector_status(charge_point_id, 1, ConnectorStatus::Available, None)
            .unwrap();
        TestStation {
            connection_id: registration.connection_id,
            outbox: tx,
            rx,
        }
    }

    pub async fn balance(&self, user_id: &str) -> i64 {
        self.wallets.get_balance(user_id).await.unwrap()
    }

    /// Answer the next confirmation request for `user_id` once it shows up.
    pub fn confirm_next(&self, user_id: &str, accepted: bool) {
        let confirmations = self.confirmations.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            wait_until_pending(&confirmations, &user_id).await;
            confirmations.respond(&user_id, accepted);
        });
    }

    pub async fn wait_for_pending(&self, user_id: &str) {
        wait_until_pending(&self.confirmations, user_id).await;
    }

    /// Whether `user_id` received a notification of `kind` so far.
    pub fn notified(&self, user_id: &str, kind: &str) -> bool {
        self.collect();
        self.seen
            .lock()
            .unwrap()
            .iter()
            .any(|(user, n)| user == user_id && n.kind() == kind)
    }

    /// Shortfall carried by the latest insufficient-balance notification.
    pub fn shortfall_notified(&self, user_id: &str) -> Option<i64> {
        self.collect();
        self.seen
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|(user, n)| match n {
                UserNotification::InsufficientBalance { shortfall, .. } if user == user_id => {
                    Some(*shortfall)
                }
                _ => None,
            })
    }

    fn collect(&self) {
        let drained = self.events.lock().unwrap().drain();
        let mut seen = self.seen.lock().unwrap();
        for message in drained {
            if let Event::Notification {
                user_id,
                notification,
            } = message.event
            {
                seen.push((user_id, notification));
            }
        }
    }
}

async fn wait_until_pending(confirmations: &InMemoryConfirmationChannel, user_id: &str) {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while !confirmations.has_pending(user_id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no confirmation request for {}",
            user_id
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// A closed, unsettled session on CP001 connector 1 paid by `driver-1`.
pub(crate) fn closed_session(id: i32, meter_start: i32, meter_stop: i32) -> Transaction {
    let started_at = Utc::now() - chrono::Duration::minutes(30);
    let mut tx = Transaction::new(id, "CP001", 1, "driver-1", meter_start, started_at);
    tx.close(meter_stop, Utc::now(), StopReason::Reported("Local".into()));
    tx
}
