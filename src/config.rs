//! Application configuration
//!
//! Loaded from a TOML file. Every section has defaults, so a missing file or
//! a partial file is fine:
//!
//! ```toml
//! [server]
//! ws_port = 9000
//!
//! [billing]
//! price_per_kwh = 2500
//! commission_rate = 0.10
//!
//! [[stations]]
//! id = "CP001"
//! owner_id = "owner-1"
//!
//! [[accounts]]
//! id = "owner-1"
//! role = "owner"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::domain::{StationProfile, UserAccount};

const APP_DIR: &str = "voltpay-csms";
const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_ENV: &str = "VOLTPAY_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("Duplicate {kind} id: {id}")]
    Duplicate { kind: &'static str, id: String },
}

/// Default config location: `$VOLTPAY_CONFIG`, else `<config_dir>/voltpay-csms/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub ocpp: OcppConfig,
    #[validate(nested)]
    pub charging: ChargingConfig,
    #[validate(nested)]
    pub billing: BillingConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    #[serde(skip_serializing)]
    pub stations: Vec<StationProfile>,
    #[serde(skip_serializing)]
    pub accounts: Vec<UserAccount>,
}

impl AppConfig {
    /// Load and validate the file at `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.check()?;
            return Ok(config);
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Field validation plus id uniqueness of the provisioning tables.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let mut seen = HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "station",
                    id: station.id.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "account",
                    id: account.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.server.ws_host, self.server.ws_port)
    }

    pub fn station_profile(&self, charge_point_id: &str) -> Option<&StationProfile> {
        self.stations.iter().find(|s| s.id == charge_point_id)
    }
}

// ── Sections ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub ws_host: String,
    #[validate(range(min = 1))]
    pub ws_port: u16,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OcppConfig {
    /// Bounded wait for a station's answer to a server-initiated call
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u32,
    /// Per-connector meter sample ring buffer size
    #[validate(range(min = 1))]
    pub meter_buffer_size: usize,
}

impl OcppConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 15,
            heartbeat_interval_secs: 300,
            meter_buffer_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ChargingConfig {
    #[validate(range(min = 1))]
    pub confirmation_timeout_secs: u64,
    /// Assumed average power for the pre-start cost estimate
    #[validate(range(min = 0.0))]
    pub estimate_average_power_kw: f64,
    #[validate(range(min = 0.0))]
    pub estimate_max_hours: f64,
}

impl ChargingConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 30,
            estimate_average_power_kw: 20.0,
            estimate_max_hours: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BillingConfig {
    /// Initial price per kWh in minor currency units; the session store's
    /// tariff overrides it once loaded.
    #[validate(range(min = 0))]
    pub price_per_kwh: i64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub commission_rate: f64,
    #[validate(length(min = 1))]
    pub platform_account_id: String,
    pub settlement_retry_delay_ms: u64,
    /// Upper bound on cost per delivered kWh accepted by settlement
    #[validate(range(min = 1))]
    pub max_cost_per_kwh: i64,
    /// Tariff reload period; 0 disables the refresh task
    pub tariff_refresh_secs: u64,
}

impl BillingConfig {
    pub fn settlement_retry_delay(&self) -> Duration {
        Duration::from_millis(self.settlement_retry_delay_ms)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            price_per_kwh: 2500,
            commission_rate: 0.10,
            platform_account_id: "platform".to_string(),
            settlement_retry_delay_ms: 1000,
            max_cost_per_kwh: 100_000,
            tariff_refresh_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    #[validate(length(min = 1))]
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9100".to_string(),
        }
    }
}
