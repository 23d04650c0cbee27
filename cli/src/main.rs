//! VoltPay CSMS CLI server
//!
//! Headless OCPP 1.6-J central system for a systemd service, a container or
//! a standalone process.
//!
//! ```sh
//! # Run with default config (~/.config/voltpay-csms/config.toml)
//! voltpay-csms
//!
//! # Custom config path and port
//! voltpay-csms --config /etc/voltpay-csms/config.toml --ws-port 9000
//!
//! # Validate config without starting
//! voltpay-csms --check
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use voltpay_csms::config::{default_config_path, AppConfig};
use voltpay_csms::server::{init_tracing, ServerHandle, ServerOptions};

/// VoltPay CSMS: OCPP 1.6 central system with prepaid wallets.
#[derive(Parser, Debug)]
#[command(
    name = "voltpay-csms",
    version,
    about = "OCPP 1.6-J central system with prepaid wallets and revenue sharing",
    long_about = "VoltPay CSMS: WebSocket server for EV charging stations speaking OCPP 1.6-J, \
                  with balance-checked charging and automatic settlement.\n\n\
                  Default config: ~/.config/voltpay-csms/config.toml"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "VOLTPAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the WebSocket listen port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration file and exit without starting the server.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Invalid configuration {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = cli.ws_port {
        config.server.ws_port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Err(e) = config.check() {
        eprintln!("Invalid configuration after overrides: {}", e);
        return ExitCode::FAILURE;
    }

    if cli.check {
        println!("Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   WS address  : {}", config.ws_address());
        println!("   Price/kWh   : {}", config.billing.price_per_kwh);
        println!("   Commission  : {}", config.billing.commission_rate);
        println!("   Stations    : {}", config.stations.len());
        println!("   Accounts    : {}", config.accounts.len());
        println!("   Log level   : {}", config.logging.level);
        return ExitCode::SUCCESS;
    }

    init_tracing(&config);
    info!(config = %config_path.display(), "Configuration loaded");

    let handle = match ServerHandle::start(ServerOptions { config }).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return ExitCode::FAILURE;
        }
    };
    handle.install_signal_handler();
    info!("Press Ctrl+C to shut down");

    handle.shutdown_signal().wait().await;
    handle.wait().await;
    ExitCode::SUCCESS
}
