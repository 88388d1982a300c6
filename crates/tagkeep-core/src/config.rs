// ── Runtime configuration ──
//
// Plain structs handed to the fleet and its sessions. The core never
// reads config files; tagkeep-config translates its TOML into these.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Serialize;

use crate::model::TagAddress;

/// Per-device user policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOptions {
    /// Tag beeps on its own when the link drops.
    pub alarm_on_disconnect: bool,
    /// Keep a link open whenever the tag is reachable.
    pub maintain_connection: bool,
    /// Reconnect after an unexpected link loss.
    pub auto_reconnect: bool,
    pub battery_poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            alarm_on_disconnect: false,
            maintain_connection: true,
            auto_reconnect: true,
            battery_poll_interval: Duration::from_secs(360 * 60),
        }
    }
}

/// Connect-failure cooldown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffTuning {
    /// Cap on the cooldown; slot-acquisition failures use half of it.
    pub max_backoff: Duration,
    /// Consecutive failures counted before the exponent stops growing.
    pub max_fail_count: u32,
}

impl Default for BackoffTuning {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_secs(60),
            max_fail_count: 6,
        }
    }
}

/// How long a session waits for a connection slot, by purpose and load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotTuning {
    pub acquire_timeout: Duration,
    pub background_cap: Duration,
    pub background_contended_cap: Duration,
    pub background_timeout_high_cap: Duration,
    pub interactive_floor: Duration,
    pub ceiling: Duration,
    pub contended_bump: Duration,
    pub timeout_high_bump: Duration,
    /// Attempts seen before the timeout ratio is trusted.
    pub adaptive_min_samples: u64,
    pub adaptive_timeout_ratio: f64,
}

impl Default for SlotTuning {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(20),
            background_cap: Duration::from_secs(6),
            background_contended_cap: Duration::from_secs(4),
            background_timeout_high_cap: Duration::from_secs(3),
            interactive_floor: Duration::from_secs(25),
            ceiling: Duration::from_secs(30),
            contended_bump: Duration::from_secs(5),
            timeout_high_bump: Duration::from_secs(4),
            adaptive_min_samples: 10,
            adaptive_timeout_ratio: 0.4,
        }
    }
}

/// Battery poller heuristics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollerTuning {
    pub enabled: bool,
    pub startup_jitter: RangeInclusive<Duration>,
    /// Background polls stay away this long after an alarm started.
    pub alarm_cooloff: Duration,
    pub defer_sleep: Duration,
    pub queue_busy_depth: usize,
    pub queue_busy_sleep: Duration,
    pub congestion_wait: Duration,
    pub congested_sleep: Duration,
    pub bootstrap_sleep: Duration,
    pub recovery_sleep: Duration,
    pub poll_jitter: Duration,
}

impl Default for PollerTuning {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_jitter: Duration::from_millis(500)..=Duration::from_secs(3),
            alarm_cooloff: Duration::from_secs(8),
            defer_sleep: Duration::from_secs(15),
            queue_busy_depth: 3,
            queue_busy_sleep: Duration::from_secs(120),
            congestion_wait: Duration::from_millis(1500),
            congested_sleep: Duration::from_secs(240),
            bootstrap_sleep: Duration::from_secs(90),
            recovery_sleep: Duration::from_secs(180),
            poll_jitter: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionTuning {
    pub backoff: BackoffTuning,
    pub slots: SlotTuning,
    pub poller: PollerTuning,
}

/// One tag to manage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub address: TagAddress,
    pub name: Option<String>,
    pub options: SessionOptions,
}

impl DeviceConfig {
    pub fn new(address: TagAddress) -> Self {
        Self {
            address,
            name: None,
            options: SessionOptions::default(),
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Tag {}", self.address))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Simultaneous links across all tags.
    pub max_connections: usize,
    pub tuning: SessionTuning,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            tuning: SessionTuning::default(),
        }
    }
}
