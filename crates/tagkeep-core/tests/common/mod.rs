// Shared fixtures for the session and fleet integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tagkeep_core::sim::{SimPeripheral, SimTransport};
use tagkeep_core::{
    AdmissionController, DeviceConfig, DeviceSession, DeviceSnapshot, SessionOptions,
    SessionTuning, TagAddress,
};
use tokio::sync::watch;

pub fn addr(s: &str) -> TagAddress {
    s.parse().unwrap()
}

/// Default tuning with the battery poller switched off, so tests only
/// see the traffic they cause.
pub fn quiet_tuning() -> SessionTuning {
    let mut tuning = SessionTuning::default();
    tuning.poller.enabled = false;
    tuning
}

/// Poller on, with a one second startup delay and no jitter.
pub fn polling_tuning() -> SessionTuning {
    let mut tuning = SessionTuning::default();
    tuning.poller.startup_jitter = Duration::from_secs(1)..=Duration::from_secs(1);
    tuning.poller.poll_jitter = Duration::ZERO;
    tuning
}

pub struct Rig {
    pub transport: Arc<SimTransport>,
    pub admission: Arc<AdmissionController>,
}

impl Rig {
    pub fn new(max_slots: usize) -> Self {
        Self {
            transport: Arc::new(SimTransport::new()),
            admission: Arc::new(AdmissionController::new(max_slots)),
        }
    }

    /// A standard tag plus an unstarted session for it.
    pub fn tag(&self, address: &str, options: SessionOptions) -> (DeviceSession, Arc<SimPeripheral>) {
        self.tag_with_tuning(address, options, quiet_tuning())
    }

    pub fn tag_with_tuning(
        &self,
        address: &str,
        options: SessionOptions,
        tuning: SessionTuning,
    ) -> (DeviceSession, Arc<SimPeripheral>) {
        let address = addr(address);
        let peripheral = self.transport.add(SimPeripheral::tag(address.clone()));
        let config = DeviceConfig {
            address,
            name: None,
            options,
        };
        let session = DeviceSession::new(
            config,
            self.transport.clone(),
            Arc::clone(&self.admission),
            tuning,
        );
        (session, peripheral)
    }
}

pub fn no_reconnect() -> SessionOptions {
    SessionOptions {
        auto_reconnect: false,
        ..SessionOptions::default()
    }
}

pub fn on_demand() -> SessionOptions {
    SessionOptions {
        maintain_connection: false,
        ..SessionOptions::default()
    }
}

/// Wait until the snapshot satisfies `pred`; fails after ten (virtual)
/// seconds.
pub async fn wait_for(
    rx: &mut watch::Receiver<DeviceSnapshot>,
    pred: impl FnMut(&DeviceSnapshot) -> bool,
) -> DeviceSnapshot {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .expect("snapshot condition not reached")
        .unwrap()
        .clone()
}

/// Let spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
