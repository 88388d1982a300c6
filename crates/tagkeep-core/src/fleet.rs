// ── Tag fleet ──
//
// Registry of sessions sharing one transport and one admission
// controller. Presence events from the transport are routed here by
// address.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::admission::{AdmissionController, AdmissionStats};
use crate::config::{DeviceConfig, FleetConfig, SessionTuning};
use crate::error::FleetError;
use crate::model::{DeviceSnapshot, TagAddress};
use crate::session::{DeviceSession, SessionDiagnostics};
use crate::transport::Transport;

#[derive(Debug, Clone, Serialize)]
pub struct FleetDiagnostics {
    pub admission: AdmissionStats,
    pub devices: Vec<SessionDiagnostics>,
}

pub struct TagFleet {
    transport: Arc<dyn Transport>,
    admission: Arc<AdmissionController>,
    tuning: SessionTuning,
    sessions: DashMap<TagAddress, DeviceSession>,
}

impl TagFleet {
    pub fn new(config: FleetConfig, transport: Arc<dyn Transport>) -> Self {
        info!(max_connections = config.max_connections, "tag fleet created");
        Self {
            transport,
            admission: Arc::new(AdmissionController::new(config.max_connections)),
            tuning: config.tuning,
            sessions: DashMap::new(),
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Register and start a session for `config.address`.
    pub fn add_device(&self, config: DeviceConfig) -> Result<DeviceSession, FleetError> {
        match self.sessions.entry(config.address.clone()) {
            Entry::Occupied(_) => Err(FleetError::DuplicateDevice {
                address: config.address,
            }),
            Entry::Vacant(slot) => {
                let session = DeviceSession::new(
                    config,
                    Arc::clone(&self.transport),
                    Arc::clone(&self.admission),
                    self.tuning.clone(),
                );
                slot.insert(session.clone());
                session.start();
                Ok(session)
            }
        }
    }

    /// Stop a session and forget it. Its queued operations resolve as
    /// cancelled and its slot, if any, is returned.
    pub async fn remove_device(&self, address: &TagAddress) -> Result<(), FleetError> {
        let (_, session) = self
            .sessions
            .remove(address)
            .ok_or_else(|| FleetError::UnknownDevice {
                address: address.clone(),
            })?;
        session.shutdown().await;
        debug!(%address, "device removed");
        Ok(())
    }

    pub fn device(&self, address: &TagAddress) -> Option<DeviceSession> {
        self.sessions.get(address).map(|entry| entry.value().clone())
    }

    /// All sessions, ordered by address.
    pub fn devices(&self) -> Vec<DeviceSession> {
        let mut devices: Vec<DeviceSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.address().cmp(b.address()));
        devices
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices().iter().map(DeviceSession::snapshot).collect()
    }

    // ── Transport events ──

    pub fn on_advertisement(&self, address: &TagAddress, rssi: i16, seen_at: DateTime<Utc>) {
        match self.device(address) {
            Some(session) => session.on_advertisement(rssi, seen_at),
            None => trace!(%address, "advertisement from unmanaged device"),
        }
    }

    pub fn on_presence_lost(&self, address: &TagAddress) {
        if let Some(session) = self.device(address) {
            session.on_presence_lost();
        }
    }

    // ── Lifecycle ──

    /// Stop every session, then refuse further slot acquisitions.
    pub async fn shutdown(&self) {
        let sessions = self.devices();
        self.sessions.clear();
        join_all(sessions.iter().map(DeviceSession::shutdown)).await;
        self.admission.close();
        info!(devices = sessions.len(), "tag fleet stopped");
    }

    pub fn diagnostics(&self) -> FleetDiagnostics {
        FleetDiagnostics {
            admission: self.admission.stats(),
            devices: self.devices().iter().map(DeviceSession::diagnostics).collect(),
        }
    }
}
