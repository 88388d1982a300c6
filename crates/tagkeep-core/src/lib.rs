//! Connection core for BLE anti-loss tags.
//!
//! This crate sits between a BLE transport (scanning, raw GATT) and
//! whatever presents tags to users. It keeps one session per tag and
//! shares a scarce pool of simultaneous connections between them:
//!
//! - **[`TagFleet`]**: registry of sessions keyed by [`TagAddress`]. Owns
//!   the shared [`AdmissionController`] and routes presence events from
//!   the transport to the right session.
//!
//! - **[`DeviceSession`]**: per-tag state machine
//!   (`Idle → Connecting → Discovering → Ready`, with `Degraded` and
//!   `Backoff`). Exposes an observable [`DeviceSnapshot`], a button event
//!   stream, and four commands: start alarm, stop alarm, set the
//!   disconnect-alarm policy, read battery.
//!
//! - **[`AdmissionController`]**: counting semaphore over connection
//!   slots with wait and timeout statistics.
//!
//! - **[`OperationQueue`]**: per-tag priority queue with a single worker,
//!   so GATT commands never interleave on one link.
//!
//! - **[`HandleResolver`]**: maps characteristic UUIDs to handles when a
//!   peripheral exposes the same UUID more than once.
//!
//! - **[`Transport`] / [`GattLink`]**: the seam to the BLE stack. The
//!   [`sim`] module provides an in-process implementation.

pub mod admission;
pub mod availability;
pub mod config;
pub mod error;
pub mod fleet;
pub mod model;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod transport;

pub use transport::sim;

// ── Primary re-exports ──────────────────────────────────────────────
pub use admission::{AdmissionController, AdmissionStats, SlotGuard};
pub use availability::AvailabilityTracker;
pub use config::{
    BackoffTuning, DeviceConfig, FleetConfig, PollerTuning, SessionOptions, SessionTuning,
    SlotTuning,
};
pub use error::{
    AdmissionError, ErrorClass, FleetError, ResolveError, SessionError, TransportError,
};
pub use fleet::{FleetDiagnostics, TagFleet};
pub use model::{
    AddressError, ButtonEvent, CharProperties, CharTarget, ConnectionState, DeviceSnapshot,
    GattCharacteristic, GattService, GattUuid, TagAddress,
};
pub use poller::SleepReason;
pub use queue::{OperationKind, OperationOutput, OperationQueue, RetryPolicy};
pub use resolver::HandleResolver;
pub use session::{AdaptiveMode, ConnectPurpose, DeviceSession, SessionDiagnostics};
pub use transport::{
    ConnectableDevice, DisconnectNotifier, GattLink, NotificationSink, Transport,
};
