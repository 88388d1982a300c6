// ── GATT exchanges ──
//
// Reads and writes over an active link, post-connect setup, and the
// command bodies the operation queue runs. Callers hold the link lock.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::SessionInner;
use super::link::{ActiveLink, ConnectPurpose, LinkState};
use crate::error::{SessionError, TransportError};
use crate::model::{ButtonEvent, CharTarget};
use crate::protocol::{
    self, ALERT_LEVEL_SPEC, BATTERY_LEVEL, BATTERY_LEVEL_SPEC, BUTTON_NOTIFY,
    CharacteristicSpec, DISCONNECT_POLICY_SPEC,
};
use crate::transport::NotificationSink;

#[derive(Debug, Clone, Copy)]
enum GattRequest<'a> {
    Read,
    Write { data: &'a [u8], with_response: bool },
}

impl GattRequest<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write { .. } => "write",
        }
    }
}

impl ActiveLink {
    async fn perform(
        &self,
        target: CharTarget,
        request: GattRequest<'_>,
    ) -> Result<Vec<u8>, TransportError> {
        match request {
            GattRequest::Read => self.link.read(target).await,
            GattRequest::Write {
                data,
                with_response,
            } => self
                .link
                .write(target, data, with_response)
                .await
                .map(|()| Vec::new()),
        }
    }

    /// Run `request` against `spec`, by cached handle when known.
    ///
    /// A UUID-addressed call rejected as ambiguous drops the handle
    /// cache, resolves a concrete handle, and is retried once by handle.
    async fn request(
        &mut self,
        spec: &CharacteristicSpec,
        request: GattRequest<'_>,
    ) -> Result<Vec<u8>, SessionError> {
        let target = self
            .resolver
            .cached(&spec.uuid)
            .map_or(CharTarget::Uuid(spec.uuid), CharTarget::Handle);

        match self.perform(target, request).await {
            Ok(payload) => Ok(payload),
            Err(TransportError::AmbiguousCharacteristic { uuid })
                if matches!(target, CharTarget::Uuid(_)) =>
            {
                debug!(%uuid, op = request.name(), "ambiguous UUID, retrying by handle");
                self.resolver.invalidate();
                let handle = self.resolver.resolve(spec)?;
                let target = CharTarget::Handle(handle);
                self.perform(target, request)
                    .await
                    .map_err(|source| gatt_error(request, target, source))
            }
            Err(source) => Err(gatt_error(request, target, source)),
        }
    }

    pub(crate) async fn read(&mut self, spec: &CharacteristicSpec) -> Result<Vec<u8>, SessionError> {
        self.request(spec, GattRequest::Read).await
    }

    /// Write with the preferred response mode, falling back to the other
    /// mode once.
    pub(crate) async fn write(
        &mut self,
        spec: &CharacteristicSpec,
        data: &[u8],
        prefer_response: bool,
    ) -> Result<(), SessionError> {
        let preferred = GattRequest::Write {
            data,
            with_response: prefer_response,
        };
        match self.request(spec, preferred).await {
            Ok(_) => Ok(()),
            Err(first) => {
                debug!(uuid = %spec.uuid, error = %first, "write failed, trying other response mode");
                let fallback = GattRequest::Write {
                    data,
                    with_response: !prefer_response,
                };
                self.request(spec, fallback).await.map(|_| ())
            }
        }
    }
}

fn gatt_error(request: GattRequest<'_>, target: CharTarget, source: TransportError) -> SessionError {
    SessionError::Gatt {
        op: request.name(),
        target: target.to_string(),
        source,
    }
}

impl SessionInner {
    // ── Post-connect setup ───────────────────────────────────────────

    /// One-time setup on a fresh link. Returns whether button
    /// notifications are flowing; every other step is best effort.
    pub(crate) async fn post_connect_setup(&self, link: &mut LinkState) -> bool {
        let Some(active) = link.active.as_mut() else {
            return false;
        };

        for spec in [ALERT_LEVEL_SPEC, BATTERY_LEVEL_SPEC, DISCONNECT_POLICY_SPEC] {
            if let Err(e) = active.resolver.resolve(&spec) {
                debug!(address = %self.address, error = %e, "characteristic not resolved");
            }
        }

        let sink = NotificationSink::new(self.events_tx.clone());
        let notifications_ok = match active.link.subscribe(BUTTON_NOTIFY, sink).await {
            Ok(()) => true,
            Err(source) => {
                let source = match source {
                    TransportError::Notify(_) => source,
                    other => TransportError::Notify(other.to_string()),
                };
                let err = SessionError::Gatt {
                    op: "subscribe",
                    target: CharTarget::Uuid(BUTTON_NOTIFY).to_string(),
                    source,
                };
                warn!(address = %self.address, error = %err, "button notifications unavailable");
                self.record_error(&err);
                false
            }
        };

        if let Err(e) = self.read_battery_from(active).await {
            debug!(address = %self.address, error = %e, "battery read during setup failed");
        }

        let enabled = self.options.borrow().alarm_on_disconnect;
        if let Err(e) = active
            .write(&DISCONNECT_POLICY_SPEC, &[protocol::policy_byte(enabled)], true)
            .await
        {
            debug!(address = %self.address, error = %e, "disconnect policy sync during setup failed");
            self.record_error(&e);
        }

        notifications_ok
    }

    pub(crate) async fn read_battery_from(&self, active: &mut ActiveLink) -> Result<u8, SessionError> {
        let payload = active
            .read(&BATTERY_LEVEL_SPEC)
            .await
            .inspect_err(|e| self.record_error(e))?;
        let level = protocol::battery_percent(&payload)
            .ok_or(SessionError::EmptyPayload {
                uuid: BATTERY_LEVEL,
            })
            .inspect_err(|e| self.record_error(e))?;

        self.state.send_modify(|snap| {
            snap.battery_percent = Some(level);
            snap.last_battery_read_at = Some(Utc::now());
        });
        debug!(address = %self.address, level, "battery read");
        Ok(level)
    }

    // ── Notifications ────────────────────────────────────────────────

    pub(crate) fn handle_notification(&self, payload: Vec<u8>) {
        if !protocol::is_button_press(&payload) {
            trace!(address = %self.address, ?payload, "ignoring notification");
            return;
        }
        let event = ButtonEvent {
            at: Utc::now(),
            payload,
        };
        debug!(address = %self.address, "button pressed");
        self.state
            .send_modify(|snap| snap.last_button_event = Some(event.clone()));
        // No subscribers is fine.
        let _ = self.buttons.send(event);
    }

    // ── Command bodies ───────────────────────────────────────────────

    pub(crate) async fn write_alert(self: &Arc<Self>, level: u8) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.ensure_connected_locked(&mut link, ConnectPurpose::InteractiveAlarm)
            .await?;
        let active = self.active_link(&mut link)?;
        active
            .write(&ALERT_LEVEL_SPEC, &[level], false)
            .await
            .inspect_err(|e| self.record_error(e))
    }

    pub(crate) async fn sync_policy(
        self: &Arc<Self>,
        enabled: bool,
        force_connect: bool,
    ) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        let value = [protocol::policy_byte(enabled)];

        if link.is_connected() {
            let active = self.active_link(&mut link)?;
            return active
                .write(&DISCONNECT_POLICY_SPEC, &value, true)
                .await
                .inspect_err(|e| self.record_error(e));
        }

        if !force_connect {
            debug!(address = %self.address, enabled, "policy stored, syncs on next connect");
            return Ok(());
        }

        self.ensure_connected_locked(&mut link, ConnectPurpose::PolicySync)
            .await?;
        let result = match self.active_link(&mut link) {
            Ok(active) => active.write(&DISCONNECT_POLICY_SPEC, &value, true).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.record_error(e);
        }

        let maintain = self.options.borrow().maintain_connection;
        if !maintain {
            self.disconnect_locked(&mut link).await;
        }
        result
    }

    /// Read the battery. Without `force_connect` an unconnected session
    /// returns `Ok(None)` instead of opening a link.
    pub(crate) async fn read_battery_op(
        self: &Arc<Self>,
        force_connect: bool,
    ) -> Result<Option<u8>, SessionError> {
        let mut link = self.link.lock().await;
        let opened_here = !link.is_connected();
        if opened_here {
            if !force_connect {
                trace!(address = %self.address, "battery read skipped, not connected");
                return Ok(None);
            }
            self.ensure_connected_locked(&mut link, ConnectPurpose::BackgroundBattery)
                .await?;
        }

        let result = match self.active_link(&mut link) {
            Ok(active) => self.read_battery_from(active).await.map(Some),
            Err(e) => Err(e),
        };

        let maintain = self.options.borrow().maintain_connection;
        if opened_here && !maintain {
            self.disconnect_locked(&mut link).await;
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::model::{CharProperties, GattUuid, TagAddress};
    use crate::protocol::{BATTERY_SERVICE, IMMEDIATE_ALERT_SERVICE};
    use crate::resolver::HandleResolver;
    use crate::transport::sim::{SimPeripheral, SimTransport};
    use crate::transport::{ConnectableDevice, DisconnectNotifier, Transport};

    const READ_ONLY: CharProperties = CharProperties {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
    };
    const WRITE_ONLY: CharProperties = CharProperties {
        read: false,
        write: true,
        write_without_response: false,
        notify: false,
    };

    async fn open(peripheral: SimPeripheral) -> (ActiveLink, Arc<SimPeripheral>) {
        let transport = SimTransport::new();
        let address = peripheral.address().clone();
        let peripheral = transport.add(peripheral);
        let (tx, _rx) = mpsc::unbounded_channel();
        let device = ConnectableDevice {
            address,
            name: None,
        };
        let link = transport
            .connect(&device, DisconnectNotifier::new(1, tx))
            .await
            .unwrap();
        let services = link.discover_services().await.unwrap();
        let active = ActiveLink {
            link,
            generation: 1,
            resolver: HandleResolver::new(services),
        };
        (active, peripheral)
    }

    fn address() -> TagAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[tokio::test]
    async fn ambiguous_uuid_read_falls_back_to_handle() {
        let battery = GattUuid::from_short(0x2A19);
        let peripheral = SimPeripheral::new(address())
            .with_service(GattUuid::from_short(0xFFF0), &[(battery, 0x0040, READ_ONLY)])
            .with_service(BATTERY_SERVICE, &[(battery, 0x0050, READ_ONLY)]);
        peripheral.set_value(0x0040, vec![11]);
        peripheral.set_value(0x0050, vec![66]);

        let (mut active, _peripheral) = open(peripheral).await;
        assert_eq!(active.resolver.cached_len(), 0);

        let payload = active.read(&BATTERY_LEVEL_SPEC).await.unwrap();
        assert_eq!(payload, vec![66]);
        assert_eq!(active.resolver.cached(&battery), Some(0x0050));
    }

    #[tokio::test]
    async fn write_falls_back_to_other_response_mode() {
        let alert = GattUuid::from_short(0x2A06);
        let peripheral = SimPeripheral::new(address())
            .with_service(IMMEDIATE_ALERT_SERVICE, &[(alert, 0x0020, WRITE_ONLY)]);

        let (mut active, peripheral) = open(peripheral).await;
        active.write(&ALERT_LEVEL_SPEC, &[1], false).await.unwrap();

        let writes = peripheral.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].handle, 0x0020);
        assert!(writes[0].with_response);
    }

    #[tokio::test]
    async fn missing_characteristic_surfaces_gatt_error() {
        let (mut active, _peripheral) = open(SimPeripheral::new(address())).await;
        let err = active.read(&BATTERY_LEVEL_SPEC).await.unwrap_err();
        assert!(matches!(err, SessionError::Gatt { op: "read", .. }), "got: {err:?}");
    }
}
