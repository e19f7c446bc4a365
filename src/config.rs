//! Configuration management for CashHandle

use crate::error::{Result, StoreError};
use rand::RngCore;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
const MIN_SESSION_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub handcash: HandCashConfig,
    #[serde(default)]
    pub bsv: BsvConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub divvy: DivvyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Talk to the HandCash Connect API.
    Connect,
    /// Local provider that accepts `mock-token` and `dev:<handle>` tokens.
    Dev,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandCashConfig {
    #[serde(default = "default_identity_mode")]
    pub mode: IdentityMode,
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_app_secret")]
    pub app_secret: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_client_base")]
    pub client_base: String,
    #[serde(default = "default_profile_cache_size")]
    pub profile_cache_size: usize,
}

impl Default for HandCashConfig {
    fn default() -> Self {
        Self {
            mode: default_identity_mode(),
            app_id: default_app_id(),
            app_secret: default_app_secret(),
            api_base: default_api_base(),
            client_base: default_client_base(),
            profile_cache_size: default_profile_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BsvConfig {
    #[serde(default)]
    pub network: BsvNetwork,
    /// Hex-encoded secp256k1 secret key. A random key is generated when unset.
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsvNetwork {
    Mainnet,
    #[default]
    Testnet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub secure_cookies: bool,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            secure_cookies: false,
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DivvyConfig {
    #[serde(default = "default_min_holding")]
    pub min_holding: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay", with = "humantime_serde")]
    pub batch_delay: Duration,
    #[serde(default = "default_monitor_enabled")]
    pub monitor_enabled: bool,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Default for DivvyConfig {
    fn default() -> Self {
        Self {
            min_holding: default_min_holding(),
            batch_size: default_batch_size(),
            batch_delay: default_batch_delay(),
            monitor_enabled: default_monitor_enabled(),
            poll_interval: default_poll_interval(),
            webhook_secret: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_static_dir() -> String {
    "public".to_string()
}

fn default_database_path() -> String {
    "./data/cashhandle.db".to_string()
}

fn default_identity_mode() -> IdentityMode {
    IdentityMode::Connect
}

fn default_app_id() -> String {
    "your-app-id-here".to_string()
}

fn default_app_secret() -> String {
    "your-app-secret-here".to_string()
}

fn default_api_base() -> String {
    "https://cloud.handcash.io".to_string()
}

fn default_client_base() -> String {
    "https://app.handcash.io".to_string()
}

fn default_profile_cache_size() -> usize {
    1024
}

fn default_max_age_days() -> u64 {
    30
}

fn default_min_holding() -> u64 {
    crate::marketplace::MINIMUM_TRANCHE
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| StoreError::ConfigError(format!("Invalid config: {}", e)))
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(app_id) = lookup("HANDCASH_APP_ID") {
            self.handcash.app_id = app_id;
        }
        if let Some(app_secret) = lookup("HANDCASH_APP_SECRET") {
            self.handcash.app_secret = app_secret;
        }
        if let Some(network) = lookup("BSV_NETWORK") {
            self.bsv.network = if network.eq_ignore_ascii_case("mainnet") {
                BsvNetwork::Mainnet
            } else {
                BsvNetwork::Testnet
            };
        }
        if let Some(key) = lookup("BSV_PRIVATE_KEY").filter(|k| !k.is_empty()) {
            self.bsv.private_key = Some(key);
        }
        if let Some(interval) =
            lookup("DIVVY_POLL_INTERVAL").and_then(|v| humantime::parse_duration(v.trim()).ok())
        {
            self.divvy.poll_interval = interval;
        }
        if let Some(secret) = lookup("SESSION_SECRET") {
            self.session.secret = secret;
        }
        if lookup("APP_ENV").as_deref() == Some("production") {
            self.session.secure_cookies = true;
        }
    }

    /// Check critical values and fill in a session secret when none is set.
    pub fn validate(&mut self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(StoreError::ConfigError(
                "database.path must be set in config.toml".to_string(),
            ));
        }
        if self.divvy.batch_size == 0 {
            return Err(StoreError::ConfigError(
                "divvy.batch_size must be at least 1".to_string(),
            ));
        }
        if self.session.secret.is_empty() {
            warn!("session.secret is not set; generating a random one. Sessions will not survive a restart.");
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            self.session.secret = hex::encode(bytes);
        } else if self.session.secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(StoreError::ConfigError(format!(
                "session.secret must be at least {} bytes",
                MIN_SESSION_SECRET_LEN
            )));
        }
        Ok(())
    }
}

/// Load `config.toml` from the working directory, falling back to defaults.
pub fn load_config() -> Result<Config> {
    load_config_from(DEFAULT_CONFIG_PATH)
}

/// Load a config file (defaults when absent), apply environment overrides and validate.
pub fn load_config_from<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let mut config = if config_str.trim().is_empty() {
        Config::default()
    } else {
        Config::from_toml_str(&config_str)?
    };

    config.apply_env();
    config.validate()?;
    Ok(config)
}
