//! `tagkeep simulate`: run a fleet over the in-memory transport.
//!
//! Every configured tag (plus any generated ones) gets a simulated
//! peripheral. Advertisements arrive on a fixed tick with a random RSSI
//! until the run ends, then the final snapshots are printed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tabled::Tabled;
use tokio::time::Instant;

use tagkeep_core::sim::{SimPeripheral, SimTransport};
use tagkeep_core::{DeviceConfig, DeviceSession, DeviceSnapshot, SessionError, TagAddress, TagFleet};

use crate::cli::{GlobalOpts, SimulateArgs};
use crate::error::CliError;
use crate::output;

const ADVERTISE_EVERY: Duration = Duration::from_millis(500);
const DEFAULT_GENERATED: usize = 3;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Seen")]
    available: String,
    #[tabled(rename = "RSSI")]
    rssi: String,
    #[tabled(rename = "Battery")]
    battery: String,
    #[tabled(rename = "Cooldown")]
    cooldown: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&DeviceSnapshot> for SnapshotRow {
    fn from(s: &DeviceSnapshot) -> Self {
        Self {
            address: s.address.to_string(),
            name: s.name.clone(),
            state: s.connection_state.to_string(),
            available: if s.available { "yes" } else { "no" }.into(),
            rssi: s.rssi.map(|r| format!("{r} dBm")).unwrap_or_default(),
            battery: s.battery_percent.map(|b| format!("{b}%")).unwrap_or_default(),
            cooldown: s
                .cooldown_remaining()
                .map(|d| humantime::format_duration(Duration::from_secs(d.as_secs())).to_string())
                .unwrap_or_default(),
            last_error: s.last_error.clone().unwrap_or_default(),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn generated_address(index: usize) -> String {
    format!("AA:BB:CC:00:{:02X}:{:02X}", (index >> 8) & 0xFF, index & 0xFF)
}

fn random_rssi() -> i16 {
    rand::thread_rng().gen_range(-95..=-45)
}

fn advertise(fleet: &TagFleet, addresses: &[TagAddress]) {
    let now = Utc::now();
    for address in addresses {
        fleet.on_advertisement(address, random_rssi(), now);
    }
}

/// Device list for the run: configured tags first, then generated ones.
fn plan_devices(
    configured: Vec<DeviceConfig>,
    generated: Option<usize>,
) -> Result<Vec<DeviceConfig>, CliError> {
    let extra = generated.unwrap_or(if configured.is_empty() {
        DEFAULT_GENERATED
    } else {
        0
    });

    let mut devices = configured;
    let mut index = 1;
    let target = devices.len() + extra;
    while devices.len() < target {
        let address = TagAddress::parse(&generated_address(index)).map_err(|e| {
            CliError::Validation {
                field: "devices".into(),
                reason: e.to_string(),
            }
        })?;
        index += 1;
        if devices.iter().any(|d| d.address == address) {
            continue;
        }
        let mut config = DeviceConfig::new(address);
        config.name = Some(format!("Sim tag {}", devices.len() + 1));
        devices.push(config);
    }
    Ok(devices)
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(args: SimulateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = tagkeep_config::load_config_from(&global.config_path())?;
    let mut fleet_config = cfg.fleet_config();
    if let Some(slots) = args.slots {
        if slots == 0 {
            return Err(CliError::Validation {
                field: "slots".into(),
                reason: "must be at least 1".into(),
            });
        }
        fleet_config.max_connections = slots;
    }

    let ring_address = args
        .ring
        .as_deref()
        .map(TagAddress::parse)
        .transpose()
        .map_err(|e| CliError::Validation {
            field: "ring".into(),
            reason: e.to_string(),
        })?;

    let devices = plan_devices(cfg.device_configs()?, args.devices)?;
    let transport = Arc::new(SimTransport::new());
    for device in &devices {
        transport.add(SimPeripheral::tag(device.address.clone()).with_name(device.display_name()));
    }

    let fleet = TagFleet::new(fleet_config, transport);
    for device in devices {
        fleet.add_device(device)?;
    }

    let ring_target = match ring_address {
        Some(address) => match fleet.device(&address) {
            Some(session) => Some(session),
            None => {
                fleet.shutdown().await;
                return Err(CliError::UnknownDevice {
                    address: address.to_string(),
                });
            }
        },
        None => None,
    };

    tracing::info!(
        devices = fleet.len(),
        slots = fleet.admission().max_slots(),
        duration = %humantime::format_duration(args.duration),
        "simulation started"
    );

    let result = run(&fleet, args.duration, ring_target).await;
    let snapshots = fleet.snapshots();
    fleet.shutdown().await;
    result?;

    let out = output::render_list(global.output, &snapshots, |s| SnapshotRow::from(s))?;
    output::print_output(&out);
    Ok(())
}

async fn run(
    fleet: &TagFleet,
    duration: Duration,
    mut ring: Option<DeviceSession>,
) -> Result<(), SessionError> {
    let addresses: Vec<TagAddress> = fleet.devices().iter().map(|s| s.address().clone()).collect();
    let started = Instant::now();
    let deadline = started + duration;
    let ring_at = started + duration / 2;
    let mut ringing: Option<DeviceSession> = None;
    let mut ticker = tokio::time::interval(ADVERTISE_EVERY);

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                advertise(fleet, &addresses);
                if Instant::now() >= ring_at {
                    if let Some(tag) = ring.take() {
                        tracing::info!(address = %tag.address(), "ringing");
                        tag.start_alarm().await?;
                        ringing = Some(tag);
                    }
                }
            }
        }
    }

    if let Some(tag) = ringing {
        tag.stop_alarm().await?;
    }
    Ok(())
}
