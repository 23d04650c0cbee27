//! Reusable central system runtime.
//!
//! [`ServerHandle`] encapsulates the server lifecycle: metrics, in-memory
//! stores, the charging core, the tariff refresh task, the OCPP WebSocket
//! server and graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::application::core::{ChargingCore, ExternalPorts, SharedChargingCore};
use crate::application::events::{create_event_bus, SharedEventBus};
use crate::config::AppConfig;
use crate::domain::{SessionStore, UserRole};
use crate::infrastructure::server::OcppServer;
use crate::infrastructure::storage::{
    InMemoryConfirmationChannel, InMemorySessionStore, InMemoryWalletStore,
};
use crate::shared::{listen_for_shutdown_signals, ShutdownSignal};

// ── Options ────────────────────────────────────────────────────────

/// Options for starting the central system.
#[derive(Default)]
pub struct ServerOptions {
    pub config: AppConfig,
}

// ── ServerHandle ───────────────────────────────────────────────────

/// Handle to a running central system.
///
/// ```rust,no_run
/// use voltpay_csms::server::{ServerHandle, ServerOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let handle = ServerHandle::start(ServerOptions::default()).await?;
///     handle.install_signal_handler();
///     handle.wait().await;
///     Ok(())
/// }
/// ```
pub struct ServerHandle {
    pub core: SharedChargingCore,
    /// Live-state updates and user notifications.
    pub event_bus: SharedEventBus,
    pub sessions: Arc<InMemorySessionStore>,
    pub wallets: Arc<InMemoryWalletStore>,
    /// Where an embedding app answers charging confirmations.
    pub confirmations: Arc<InMemoryConfirmationChannel>,
    pub config: AppConfig,
    /// Address the WebSocket server is bound to.
    pub ws_addr: SocketAddr,

    shutdown: ShutdownSignal,
    ws_task: JoinHandle<()>,
    refresh_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Start the central system.
    ///
    /// 1. Install the Prometheus exporter (when enabled)
    /// 2. Seed the in-memory stores from configuration
    /// 3. Build the charging core
    /// 4. Start the tariff refresh task
    /// 5. Bind and start the OCPP WebSocket server
    pub async fn start(opts: ServerOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let config = opts.config;
        info!("Starting VoltPay CSMS...");

        if config.metrics.enabled {
            install_metrics_exporter(&config.metrics.listen)?;
        }

        // ── Stores ─────────────────────────────────────────────
        let sessions = Arc::new(InMemorySessionStore::new());
        let wallets = Arc::new(InMemoryWalletStore::with_accounts(config.accounts.clone()));
        wallets.ensure_account(&config.billing.platform_account_id, UserRole::Platform);
        let confirmations = Arc::new(InMemoryConfirmationChannel::new());
        info!(
            accounts = config.accounts.len(),
            stations = config.stations.len(),
            "In-memory stores seeded"
        );

        // ── Core ───────────────────────────────────────────────
        let event_bus = create_event_bus();
        let ports = ExternalPorts::with_event_bus(
            sessions.clone(),
            wallets.clone(),
            confirmations.clone(),
            &event_bus,
        );
        let core = Arc::new(ChargingCore::new(&config, ports, event_bus.clone()));
        let shutdown = ShutdownSignal::new();

        let refresh_task = (config.billing.tariff_refresh_secs > 0).then(|| {
            let store: Arc<dyn SessionStore> = sessions.clone();
            core.prices.clone().spawn_refresh(
                store,
                Duration::from_secs(config.billing.tariff_refresh_secs),
                shutdown.clone(),
            )
        });

        // ── OCPP WebSocket server ──────────────────────────────
        let server = OcppServer::bind(
            &config.ws_address(),
            core.clone(),
            shutdown.clone(),
            Duration::from_secs(config.server.shutdown_timeout_secs),
        )
        .await?;
        let ws_addr = server.local_addr()?;
        let ws_task = tokio::spawn(server.run());

        info!(%ws_addr, price_per_kwh = core.prices.current(), "VoltPay CSMS started");

        Ok(Self {
            core,
            event_bus,
            sessions,
            wallets,
            confirmations,
            config,
            ws_addr,
            shutdown,
            ws_task,
            refresh_task,
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Install OS signal listeners (SIGTERM, SIGINT) that trigger shutdown.
    pub fn install_signal_handler(&self) {
        tokio::spawn(listen_for_shutdown_signals(self.shutdown.clone()));
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the server to stop after shutdown has been triggered.
    pub async fn wait(self) {
        match self.ws_task.await {
            Ok(()) => info!("WebSocket server stopped"),
            Err(e) => error!(error = %e, "WebSocket server task panicked"),
        }
        if let Some(task) = self.refresh_task {
            let _ = task.await;
        }
        info!("VoltPay CSMS shutdown complete");
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("Shutting down central system...");
        self.trigger_shutdown();
        self.wait().await;
    }

    pub fn is_running(&self) -> bool {
        !self.ws_task.is_finished()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// The global recorder can only be installed once per process.
fn install_metrics_exporter(listen: &str) -> Result<(), Box<dyn std::error::Error>> {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let addr: SocketAddr = listen.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    let _ = INSTALLED.set(());
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Initialize tracing from the application config. `RUST_LOG` wins over
/// `[logging] level`.
///
/// Call this once at process startup (before [`ServerHandle::start`]).
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
