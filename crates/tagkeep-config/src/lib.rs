//! Configuration file for tagkeep.
//!
//! TOML on disk, layered with `TAGKEEP_*` environment overrides, and
//! translated into the plain runtime structs of `tagkeep_core`
//! ([`FleetConfig`], [`DeviceConfig`]). The core never reads files
//! itself.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tagkeep_core::{DeviceConfig, FleetConfig, SessionOptions, SessionTuning, TagAddress};

/// Longest device name accepted.
pub const MAX_NAME_LEN: usize = 248;
/// Battery poll interval bounds, in minutes.
pub const MIN_POLL_INTERVAL_MIN: u64 = 5;
pub const MAX_POLL_INTERVAL_MIN: u64 = 7 * 24 * 60;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("device {address} is listed more than once")]
    DuplicateDevice { address: TagAddress },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub fleet: Fleet,

    /// Policy applied to every device unless overridden.
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub tuning: Tuning,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Fleet {
    /// Simultaneous GATT connections the adapter can hold.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for Fleet {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default)]
    pub alarm_on_disconnect: bool,

    #[serde(default = "default_true")]
    pub maintain_connection: bool,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_poll_interval")]
    pub battery_poll_interval_min: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            alarm_on_disconnect: false,
            maintain_connection: true,
            auto_reconnect: true,
            battery_poll_interval_min: default_poll_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    360
}

/// Heuristic thresholds. None of these affect correctness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tuning {
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_fail_count")]
    pub max_fail_count: u32,
    #[serde(default = "default_slot_timeout")]
    pub slot_timeout_secs: u64,
    #[serde(default = "default_alarm_cooloff")]
    pub alarm_cooloff_secs: u64,
    #[serde(default = "default_defer_sleep")]
    pub defer_sleep_secs: u64,
    #[serde(default = "default_queue_busy_depth")]
    pub queue_busy_depth: usize,
    #[serde(default = "default_congestion_wait")]
    pub congestion_wait_ms: u64,
    #[serde(default = "default_true")]
    pub battery_polling: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_backoff_secs: default_max_backoff(),
            max_fail_count: default_max_fail_count(),
            slot_timeout_secs: default_slot_timeout(),
            alarm_cooloff_secs: default_alarm_cooloff(),
            defer_sleep_secs: default_defer_sleep(),
            queue_busy_depth: default_queue_busy_depth(),
            congestion_wait_ms: default_congestion_wait(),
            battery_polling: true,
        }
    }
}

fn default_max_backoff() -> u64 {
    60
}
fn default_max_fail_count() -> u32 {
    6
}
fn default_slot_timeout() -> u64 {
    20
}
fn default_alarm_cooloff() -> u64 {
    8
}
fn default_defer_sleep() -> u64 {
    15
}
fn default_queue_busy_depth() -> usize {
    3
}
fn default_congestion_wait() -> u64 {
    1500
}

/// One managed tag. Unset policy keys fall back to `[defaults]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// BLE address, `AA:BB:CC:DD:EE:FF` or dash separated.
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_on_disconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintain_connection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_poll_interval_min: Option<u64>,
}

impl DeviceEntry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            alarm_on_disconnect: None,
            maintain_connection: None,
            auto_reconnect: None,
            battery_poll_interval_min: None,
        }
    }
}

// ── Validation and translation ──────────────────────────────────────

fn validate_name(field: &str, name: &str) -> Result<(), ConfigError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(invalid(
            field,
            format!("must be 1-{MAX_NAME_LEN} characters, got {len}"),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid(field, "must not contain control characters"));
    }
    Ok(())
}

fn validate_poll_interval(field: &str, minutes: u64) -> Result<(), ConfigError> {
    if (MIN_POLL_INTERVAL_MIN..=MAX_POLL_INTERVAL_MIN).contains(&minutes) {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!(
                "must be between {MIN_POLL_INTERVAL_MIN} and {MAX_POLL_INTERVAL_MIN} minutes, got {minutes}"
            ),
        ))
    }
}

impl Config {
    /// Check every value and return the normalized device addresses.
    pub fn validate(&self) -> Result<Vec<TagAddress>, ConfigError> {
        if self.fleet.max_connections == 0 {
            return Err(invalid("fleet.max_connections", "must be at least 1"));
        }
        if self.tuning.max_fail_count == 0 {
            return Err(invalid("tuning.max_fail_count", "must be at least 1"));
        }
        if self.tuning.slot_timeout_secs == 0 {
            return Err(invalid("tuning.slot_timeout_secs", "must be at least 1"));
        }
        validate_poll_interval(
            "defaults.battery_poll_interval_min",
            self.defaults.battery_poll_interval_min,
        )?;

        let mut seen = HashSet::new();
        let mut addresses = Vec::with_capacity(self.devices.len());
        for (i, device) in self.devices.iter().enumerate() {
            let address = TagAddress::parse(&device.address)
                .map_err(|e| invalid(format!("devices[{i}].address"), e.to_string()))?;
            if let Some(name) = &device.name {
                validate_name(&format!("devices[{i}].name"), name)?;
            }
            if let Some(minutes) = device.battery_poll_interval_min {
                validate_poll_interval(&format!("devices[{i}].battery_poll_interval_min"), minutes)?;
            }
            if !seen.insert(address.clone()) {
                return Err(ConfigError::DuplicateDevice { address });
            }
            addresses.push(address);
        }
        Ok(addresses)
    }

    pub fn session_tuning(&self) -> SessionTuning {
        let t = &self.tuning;
        let mut tuning = SessionTuning::default();
        tuning.backoff.max_backoff = Duration::from_secs(t.max_backoff_secs);
        tuning.backoff.max_fail_count = t.max_fail_count;
        tuning.slots.acquire_timeout = Duration::from_secs(t.slot_timeout_secs);
        tuning.poller.enabled = t.battery_polling;
        tuning.poller.alarm_cooloff = Duration::from_secs(t.alarm_cooloff_secs);
        tuning.poller.defer_sleep = Duration::from_secs(t.defer_sleep_secs);
        tuning.poller.queue_busy_depth = t.queue_busy_depth;
        tuning.poller.congestion_wait = Duration::from_millis(t.congestion_wait_ms);
        tuning
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            max_connections: self.fleet.max_connections,
            tuning: self.session_tuning(),
        }
    }

    /// Validated per-device runtime configs, defaults applied.
    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        let addresses = self.validate()?;
        let d = &self.defaults;
        Ok(self
            .devices
            .iter()
            .zip(addresses)
            .map(|(entry, address)| DeviceConfig {
                address,
                name: entry.name.clone(),
                options: SessionOptions {
                    alarm_on_disconnect: entry.alarm_on_disconnect.unwrap_or(d.alarm_on_disconnect),
                    maintain_connection: entry.maintain_connection.unwrap_or(d.maintain_connection),
                    auto_reconnect: entry.auto_reconnect.unwrap_or(d.auto_reconnect),
                    battery_poll_interval: Duration::from_secs(
                        entry
                            .battery_poll_interval_min
                            .unwrap_or(d.battery_poll_interval_min)
                            * 60,
                    ),
                },
            })
            .collect())
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "tagkeep", "tagkeep").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("tagkeep");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` plus environment. A missing file yields defaults.
///
/// Environment keys nest with a double underscore:
/// `TAGKEEP_FLEET__MAX_CONNECTIONS=2`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TAGKEEP_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
