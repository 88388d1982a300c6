// ── Simulated transport ──
//
// In-process stand-in for a BLE stack. Each `SimPeripheral` models one
// tag: its service table, characteristic values, scripted failures and
// at most one open link. Used by the test suites and `tagkeep simulate`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{ConnectableDevice, DisconnectNotifier, GattLink, NotificationSink, Transport};
use crate::error::TransportError;
use crate::model::{
    CharProperties, CharTarget, GattCharacteristic, GattService, GattUuid, TagAddress,
};
use crate::protocol::{
    ALERT_LEVEL, BATTERY_LEVEL, BATTERY_SERVICE, BUTTON_NOTIFY, DISCONNECT_POLICY,
    IMMEDIATE_ALERT_SERVICE, TAG_SERVICE,
};

/// Handles used by [`SimPeripheral::tag`].
pub mod handles {
    pub const BUTTON_NOTIFY: u16 = 0x0010;
    pub const DISCONNECT_POLICY: u16 = 0x0012;
    pub const ALERT_LEVEL: u16 = 0x0020;
    pub const BATTERY_LEVEL: u16 = 0x0030;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Transport ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SimTransport {
    peripherals: Mutex<HashMap<TagAddress, Arc<SimPeripheral>>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral, replacing any previous one at its address.
    pub fn add(&self, peripheral: SimPeripheral) -> Arc<SimPeripheral> {
        let peripheral = Arc::new(peripheral);
        lock(&self.peripherals).insert(peripheral.address.clone(), Arc::clone(&peripheral));
        peripheral
    }

    pub fn peripheral(&self, address: &TagAddress) -> Option<Arc<SimPeripheral>> {
        lock(&self.peripherals).get(address).cloned()
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn connectable_device(&self, address: &TagAddress) -> Option<ConnectableDevice> {
        let peripheral = self.peripheral(address)?;
        let state = lock(&peripheral.state);
        state.connectable.then(|| ConnectableDevice {
            address: address.clone(),
            name: state.name.clone(),
        })
    }

    async fn connect(
        &self,
        device: &ConnectableDevice,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Box<dyn GattLink>, TransportError> {
        let peripheral = self
            .peripheral(&device.address)
            .ok_or(TransportError::NotFound)?;

        let delay = lock(&peripheral.state).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let link_id = {
            let mut state = lock(&peripheral.state);
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            if !state.connectable {
                return Err(TransportError::NotFound);
            }
            let link_id = peripheral.next_link.fetch_add(1, Ordering::Relaxed) + 1;
            state.issued.push((link_id, on_disconnect.clone()));
            state.link = Some(OpenLink {
                id: link_id,
                notifier: on_disconnect,
                sink: None,
            });
            state.connects += 1;
            link_id
        };

        trace!(address = %device.address, link_id, "sim link opened");
        Ok(Box::new(SimLink {
            peripheral,
            link_id,
        }))
    }
}

// ── Peripheral ───────────────────────────────────────────────────────

/// A write observed by a simulated tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
    pub handle: u16,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[derive(Debug)]
pub struct SimPeripheral {
    address: TagAddress,
    next_link: AtomicU64,
    state: Mutex<SimState>,
}

#[derive(Debug)]
struct SimState {
    name: Option<String>,
    connectable: bool,
    services: Vec<GattService>,
    values: HashMap<u16, Vec<u8>>,
    writes: Vec<SimWrite>,
    connect_failures: VecDeque<TransportError>,
    discovery_failures: VecDeque<TransportError>,
    subscribe_failure: Option<TransportError>,
    connect_delay: Duration,
    link: Option<OpenLink>,
    /// Every disconnect callback handed out, by link id.
    issued: Vec<(u64, DisconnectNotifier)>,
    connects: u32,
}

#[derive(Debug)]
struct OpenLink {
    id: u64,
    notifier: DisconnectNotifier,
    sink: Option<NotificationSink>,
}

#[allow(clippy::fn_params_excessive_bools)]
const fn props(read: bool, write: bool, write_without_response: bool, notify: bool) -> CharProperties {
    CharProperties {
        read,
        write,
        write_without_response,
        notify,
    }
}

impl SimPeripheral {
    /// A peripheral with no services.
    pub fn new(address: TagAddress) -> Self {
        Self {
            address,
            next_link: AtomicU64::new(0),
            state: Mutex::new(SimState {
                name: None,
                connectable: true,
                services: Vec::new(),
                values: HashMap::new(),
                writes: Vec::new(),
                connect_failures: VecDeque::new(),
                discovery_failures: VecDeque::new(),
                subscribe_failure: None,
                connect_delay: Duration::ZERO,
                link: None,
                issued: Vec::new(),
                connects: 0,
            }),
        }
    }

    /// A peripheral laid out like a production tag, battery at 87 %.
    pub fn tag(address: TagAddress) -> Self {
        let peripheral = Self::new(address)
            .with_service(TAG_SERVICE, &[
                (BUTTON_NOTIFY, handles::BUTTON_NOTIFY, props(false, false, false, true)),
                (DISCONNECT_POLICY, handles::DISCONNECT_POLICY, props(true, true, true, false)),
            ])
            .with_service(IMMEDIATE_ALERT_SERVICE, &[(
                ALERT_LEVEL,
                handles::ALERT_LEVEL,
                props(false, false, true, false),
            )])
            .with_service(BATTERY_SERVICE, &[(
                BATTERY_LEVEL,
                handles::BATTERY_LEVEL,
                props(true, false, false, true),
            )]);
        peripheral.set_value(handles::BATTERY_LEVEL, vec![87]);
        peripheral
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        lock(&self.state).name = Some(name.into());
        self
    }

    pub fn with_service(self, uuid: GattUuid, chars: &[(GattUuid, u16, CharProperties)]) -> Self {
        lock(&self.state).services.push(GattService {
            uuid,
            characteristics: chars
                .iter()
                .map(|&(uuid, handle, properties)| GattCharacteristic {
                    uuid,
                    handle,
                    properties,
                })
                .collect(),
        });
        self
    }

    pub fn address(&self) -> &TagAddress {
        &self.address
    }

    // ── Scripting ──

    pub fn set_connectable(&self, connectable: bool) {
        lock(&self.state).connectable = connectable;
    }

    pub fn set_value(&self, handle: u16, value: Vec<u8>) {
        lock(&self.state).values.insert(handle, value);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// The next connect attempt fails with `err`; calls queue up.
    pub fn fail_next_connect(&self, err: TransportError) {
        lock(&self.state).connect_failures.push_back(err);
    }

    pub fn fail_next_discovery(&self, err: TransportError) {
        lock(&self.state).discovery_failures.push_back(err);
    }

    pub fn fail_subscribe(&self, err: Option<TransportError>) {
        lock(&self.state).subscribe_failure = err;
    }

    /// Drop the link from the peripheral side, as a radio loss would.
    pub fn drop_link(&self) -> bool {
        let link = lock(&self.state).link.take();
        match link {
            Some(link) => {
                link.notifier.notify();
                true
            }
            None => false,
        }
    }

    /// Fire the disconnect callbacks of all earlier links again, as a
    /// late or duplicated transport callback would. The open link's own
    /// callback is left alone.
    pub fn replay_stale_disconnects(&self) -> usize {
        let stale: Vec<DisconnectNotifier> = {
            let state = lock(&self.state);
            let open = state.link.as_ref().map(|link| link.id);
            state
                .issued
                .iter()
                .filter(|(id, _)| Some(*id) != open)
                .map(|(_, notifier)| notifier.clone())
                .collect()
        };
        for notifier in &stale {
            notifier.notify();
        }
        stale.len()
    }

    /// Push a notification to the subscriber of the open link, if any.
    pub fn notify(&self, payload: Vec<u8>) -> bool {
        let sink = lock(&self.state)
            .link
            .as_ref()
            .and_then(|link| link.sink.clone());
        match sink {
            Some(sink) => {
                sink.deliver(payload);
                true
            }
            None => false,
        }
    }

    // ── Inspection ──

    pub fn writes(&self) -> Vec<SimWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn connect_count(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).link.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.state)
            .link
            .as_ref()
            .is_some_and(|link| link.sink.is_some())
    }
}

impl SimState {
    fn check_link(&self, link_id: u64) -> Result<(), TransportError> {
        match &self.link {
            Some(link) if link.id == link_id => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn characteristic(&self, target: CharTarget) -> Result<GattCharacteristic, TransportError> {
        let mut all = self.services.iter().flat_map(|svc| svc.characteristics.iter());
        match target {
            CharTarget::Handle(handle) => all
                .find(|ch| ch.handle == handle)
                .cloned()
                .ok_or_else(|| TransportError::Gatt(format!("no attribute at 0x{handle:04x}"))),
            CharTarget::Uuid(uuid) => {
                let matches: Vec<_> = all.filter(|ch| ch.uuid == uuid).collect();
                match matches.as_slice() {
                    [] => Err(TransportError::Gatt(format!("characteristic {uuid} not found"))),
                    [only] => Ok((*only).clone()),
                    _ => Err(TransportError::AmbiguousCharacteristic { uuid }),
                }
            }
        }
    }
}

// ── Link ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimLink {
    peripheral: Arc<SimPeripheral>,
    link_id: u64,
}

#[async_trait]
impl GattLink for SimLink {
    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        let mut state = lock(&self.peripheral.state);
        state.check_link(self.link_id)?;
        if let Some(err) = state.discovery_failures.pop_front() {
            return Err(err);
        }
        Ok(state.services.clone())
    }

    async fn read(&self, target: CharTarget) -> Result<Vec<u8>, TransportError> {
        let state = lock(&self.peripheral.state);
        state.check_link(self.link_id)?;
        let ch = state.characteristic(target)?;
        if !ch.properties.read {
            return Err(TransportError::Gatt(format!("{target} is not readable")));
        }
        Ok(state.values.get(&ch.handle).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        target: CharTarget,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.peripheral.state);
        state.check_link(self.link_id)?;
        let ch = state.characteristic(target)?;
        let permitted = if with_response {
            ch.properties.write
        } else {
            ch.properties.write_without_response
        };
        if !permitted {
            return Err(TransportError::Gatt(format!(
                "{target} rejects write (with_response={with_response})"
            )));
        }
        state.values.insert(ch.handle, data.to_vec());
        state.writes.push(SimWrite {
            handle: ch.handle,
            data: data.to_vec(),
            with_response,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        uuid: GattUuid,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.peripheral.state);
        state.check_link(self.link_id)?;
        if let Some(err) = state.subscribe_failure.clone() {
            return Err(err);
        }
        let ch = state.characteristic(CharTarget::Uuid(uuid))?;
        if !ch.properties.notify {
            return Err(TransportError::Notify(format!("{uuid} does not notify")));
        }
        if let Some(link) = state.link.as_mut() {
            link.sink = Some(sink);
        }
        Ok(())
    }

    async fn unsubscribe(&self, _uuid: GattUuid) -> Result<(), TransportError> {
        let mut state = lock(&self.peripheral.state);
        state.check_link(self.link_id)?;
        if let Some(link) = state.link.as_mut() {
            link.sink = None;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = {
            let mut state = lock(&self.peripheral.state);
            state.check_link(self.link_id)?;
            state.link.take()
        };
        if let Some(link) = link {
            link.notifier.notify();
        }
        Ok(())
    }
}
