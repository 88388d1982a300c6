// Fleet registry: routing, duplicates, shared admission, shutdown.
#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use chrono::Utc;
use tagkeep_core::sim::{SimPeripheral, SimTransport};
use tagkeep_core::{
    AdmissionError, ConnectionState, DeviceConfig, FleetConfig, FleetError, SessionOptions,
    TagFleet,
};

use common::{addr, quiet_tuning, settle, wait_for};

fn fleet(max_connections: usize) -> (TagFleet, Arc<SimTransport>) {
    let transport = Arc::new(SimTransport::new());
    let config = FleetConfig {
        max_connections,
        tuning: quiet_tuning(),
    };
    (TagFleet::new(config, transport.clone()), transport)
}

fn on_demand(address: &str) -> DeviceConfig {
    DeviceConfig {
        address: addr(address),
        name: Some(format!("keys {address}")),
        options: SessionOptions {
            maintain_connection: false,
            ..SessionOptions::default()
        },
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_device_rejected() {
    let (fleet, _) = fleet(2);
    fleet.add_device(on_demand("AA:BB:CC:00:00:01")).unwrap();

    let err = fleet
        .add_device(on_demand("aa-bb-cc-00-00-01"))
        .unwrap_err();
    assert_eq!(err, FleetError::DuplicateDevice {
        address: addr("AA:BB:CC:00:00:01"),
    });
    assert_eq!(fleet.len(), 1);
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_presence_events_route_by_address() {
    let (fleet, _) = fleet(2);
    let keys = fleet.add_device(on_demand("AA:BB:CC:00:00:02")).unwrap();
    let wallet = fleet.add_device(on_demand("AA:BB:CC:00:00:03")).unwrap();

    fleet.on_advertisement(&addr("AA:BB:CC:00:00:02"), -71, Utc::now());
    fleet.on_advertisement(&addr("AA:BB:CC:00:00:99"), -40, Utc::now());
    assert!(keys.snapshot().available);
    assert_eq!(keys.snapshot().rssi, Some(-71));
    assert!(!wallet.snapshot().available);

    fleet.on_presence_lost(&addr("AA:BB:CC:00:00:02"));
    assert!(!keys.snapshot().available);

    let names: Vec<String> = fleet.snapshots().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["keys AA:BB:CC:00:00:02", "keys AA:BB:CC:00:00:03"]);
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sessions_share_one_admission_controller() {
    let (fleet, transport) = fleet(1);
    transport.add(SimPeripheral::tag(addr("AA:BB:CC:00:00:04")));
    transport.add(SimPeripheral::tag(addr("AA:BB:CC:00:00:05")));

    let maintained = |address: &str| DeviceConfig::new(addr(address));
    let first = fleet.add_device(maintained("AA:BB:CC:00:00:04")).unwrap();
    let mut rx = first.watch();
    wait_for(&mut rx, |s| s.connection_state == ConnectionState::Ready).await;

    let second = fleet.add_device(maintained("AA:BB:CC:00:00:05")).unwrap();
    settle().await;
    assert_eq!(fleet.admission().in_use(), 1);
    assert!(!second.snapshot().connected);

    fleet.remove_device(&addr("AA:BB:CC:00:00:04")).await.unwrap();
    assert!(fleet.device(&addr("AA:BB:CC:00:00:04")).is_none());
    assert!(first.is_shut_down());

    let mut rx = second.watch();
    wait_for(&mut rx, |s| s.connection_state == ConnectionState::Ready).await;
    assert_eq!(fleet.admission().in_use(), 1);

    let diag = fleet.diagnostics();
    assert_eq!(diag.admission.max_slots, 1);
    assert_eq!(diag.devices.len(), 1);
    assert_eq!(diag.devices[0].address, "AA:BB:****");
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remove_unknown_device() {
    let (fleet, _) = fleet(1);
    let err = fleet
        .remove_device(&addr("AA:BB:CC:00:00:06"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::UnknownDevice { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_sessions_and_closes_admission() {
    let (fleet, transport) = fleet(2);
    transport.add(SimPeripheral::tag(addr("AA:BB:CC:00:00:07")));
    let session = fleet
        .add_device(DeviceConfig::new(addr("AA:BB:CC:00:00:07")))
        .unwrap();
    let mut rx = session.watch();
    wait_for(&mut rx, |s| s.connected).await;

    fleet.shutdown().await;

    assert!(fleet.is_empty());
    assert!(session.is_shut_down());
    assert_eq!(fleet.admission().in_use(), 0);
    assert!(fleet.admission().is_closed());
    let err = fleet.admission().acquire(None).await.unwrap_err();
    assert_eq!(err, AdmissionError::Closed);
}
