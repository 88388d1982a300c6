// ── Observable device state ──
//
// `DeviceSnapshot` is what observers see through a session's watch
// channel. Presence fields are owned by the availability tracker,
// everything else by the session's connection logic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ErrorClass;
use crate::model::TagAddress;

/// Connection lifecycle of a single tag.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    /// No transport path currently reaches the device.
    Scanning,
    Connecting,
    Discovering,
    Ready,
    /// Link lost, or connected without button notifications.
    Degraded,
    /// Connect attempts suppressed until the cooldown expires.
    Backoff,
}

/// A button press reported by the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonEvent {
    pub at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub address: TagAddress,
    pub name: String,

    // ── Presence ──
    pub available: bool,
    pub rssi: Option<i16>,
    pub last_seen: Option<DateTime<Utc>>,

    // ── Connection ──
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub connect_fail_count: u32,
    #[serde(skip)]
    pub cooldown_until: Option<Instant>,
    pub conn_slot_held: bool,
    pub cached_handles: usize,

    // ── Device data ──
    pub battery_percent: Option<u8>,
    pub last_battery_read_at: Option<DateTime<Utc>>,
    pub last_button_event: Option<ButtonEvent>,

    // ── Errors ──
    pub last_error: Option<String>,
    pub last_error_class: Option<ErrorClass>,

    /// Filled in when the snapshot is taken; not tracked by the watch.
    pub queue_depth: usize,
}

impl DeviceSnapshot {
    pub fn new(address: TagAddress, name: String) -> Self {
        Self {
            address,
            name,
            available: false,
            rssi: None,
            last_seen: None,
            connected: false,
            connection_state: ConnectionState::Idle,
            connect_fail_count: 0,
            cooldown_until: None,
            conn_slot_held: false,
            cached_handles: 0,
            battery_percent: None,
            last_battery_read_at: None,
            last_button_event: None,
            last_error: None,
            last_error_class: None,
            queue_depth: 0,
        }
    }

    /// Time left before another connect attempt is allowed.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }
}
