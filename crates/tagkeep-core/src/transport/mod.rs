// ── Transport seam ──
//
// The BLE stack lives behind two object-safe traits. `Transport` finds
// connectable devices and opens links; `GattLink` is one open link.
// Callbacks from the transport (link dropped, notification received)
// never touch session state directly: they post a `LinkEvent` onto the
// owning session's event channel and return.

pub mod sim;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::{CharTarget, GattService, GattUuid, TagAddress};

/// A device the transport can currently reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectableDevice {
    pub address: TagAddress,
    pub name: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// A connectable path to `address`, if any scanner currently has one.
    fn connectable_device(&self, address: &TagAddress) -> Option<ConnectableDevice>;

    /// Open a link. `on_disconnect` must be fired whenever the link drops,
    /// including after an explicit [`GattLink::disconnect`].
    async fn connect(
        &self,
        device: &ConnectableDevice,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Box<dyn GattLink>, TransportError>;
}

#[async_trait]
pub trait GattLink: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError>;

    async fn read(&self, target: CharTarget) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        target: CharTarget,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, uuid: GattUuid, sink: NotificationSink)
    -> Result<(), TransportError>;

    async fn unsubscribe(&self, uuid: GattUuid) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

// ── Callback plumbing ────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum LinkEvent {
    Disconnected { generation: u64 },
    Notification { payload: Vec<u8> },
}

/// Handed to [`Transport::connect`]; fire it when the link drops.
///
/// Each notifier is bound to one connection generation, so a late
/// callback from an old link cannot tear down its successor.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl DisconnectNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn notify(&self) {
        // The session may already be gone; nothing to tell then.
        let _ = self.tx.send(LinkEvent::Disconnected {
            generation: self.generation,
        });
    }
}

/// Handed to [`GattLink::subscribe`]; deliver each notification payload.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl NotificationSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { tx }
    }

    pub fn deliver(&self, payload: Vec<u8>) {
        let _ = self.tx.send(LinkEvent::Notification { payload });
    }
}
