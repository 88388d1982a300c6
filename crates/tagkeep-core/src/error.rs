// ── Core error types ──
//
// Errors surfaced by tagkeep-core. Transport failures arrive as the
// closed `TransportError` set and are classified exactly once into an
// `ErrorClass`; everything above the transport seam reasons about the
// class, never about message text.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{GattUuid, TagAddress};

// ── Classification ───────────────────────────────────────────────────

/// Coarse failure class recorded as a session's `last_error_class`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    ScannerUnavailable,
    SlotTimeout,
    ConnectError,
    ServiceDiscoveryError,
    NotifyError,
    GattAmbiguousCharacteristic,
    GattOperationError,
    Timeout,
    IoError,
    /// Connect attempt short-circuited by an active cooldown.
    Backoff,
}

impl ErrorClass {
    /// Transient classes are retried by the operation queue.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ScannerUnavailable
                | Self::SlotTimeout
                | Self::ConnectError
                | Self::Timeout
                | Self::IoError
                | Self::Backoff
        )
    }

    /// Failures that mean no link could be established at all.
    pub const fn is_connect_failure(self) -> bool {
        matches!(
            self,
            Self::ScannerUnavailable | Self::SlotTimeout | Self::ConnectError
        )
    }
}

// ── Transport errors ─────────────────────────────────────────────────

/// The closed set of failures a [`Transport`](crate::Transport) may report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device not found by the transport")]
    NotFound,

    #[error("connection attempt aborted")]
    Aborted,

    #[error("adapter has no free connection slots")]
    OutOfSlots,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service discovery failed: {0}")]
    ServiceDiscovery(String),

    #[error("multiple characteristics match UUID {uuid}")]
    AmbiguousCharacteristic { uuid: GattUuid },

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("notification subscription failed: {0}")]
    Notify(String),

    #[error("transport operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("link is not connected")]
    NotConnected,
}

impl TransportError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound | Self::Aborted | Self::OutOfSlots | Self::Connection(_) => {
                ErrorClass::ConnectError
            }
            Self::ServiceDiscovery(_) => ErrorClass::ServiceDiscoveryError,
            Self::AmbiguousCharacteristic { .. } => ErrorClass::GattAmbiguousCharacteristic,
            Self::Gatt(_) => ErrorClass::GattOperationError,
            Self::Notify(_) => ErrorClass::NotifyError,
            Self::Timeout => ErrorClass::Timeout,
            Self::Io(_) => ErrorClass::IoError,
            // A link that vanished mid-operation behaves like a failed connect.
            Self::NotConnected => ErrorClass::ConnectError,
        }
    }
}

// ── Admission ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("no connection slot became free within {waited:?}")]
    TimedOut { waited: Duration },

    #[error("admission controller is closed")]
    Closed,
}

// ── Handle resolution ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no characteristic {uuid} in the discovered services")]
    NotFound { uuid: GattUuid },
}

// ── Session errors ───────────────────────────────────────────────────

/// Error returned by session commands and `ensure_connected`.
#[derive(Debug, Error)]
pub enum SessionError {
    // ── Connection establishment ─────────────────────────────────────
    #[error("{address} is not reachable through any scanner")]
    ScannerUnavailable { address: TagAddress },

    #[error("connection slot for {address} not granted: {source}")]
    SlotUnavailable {
        address: TagAddress,
        #[source]
        source: AdmissionError,
    },

    #[error("connecting to {address} failed: {source}")]
    Connect {
        address: TagAddress,
        #[source]
        source: TransportError,
    },

    #[error("service discovery on {address} failed: {source}")]
    ServiceDiscovery {
        address: TagAddress,
        #[source]
        source: TransportError,
    },

    #[error("connect attempts to {address} cooling down for another {remaining:?}")]
    CoolingDown {
        address: TagAddress,
        remaining: Duration,
    },

    // ── GATT ─────────────────────────────────────────────────────────
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("{op} on {target} failed: {source}")]
    Gatt {
        op: &'static str,
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("characteristic {uuid} returned an empty payload")]
    EmptyPayload { uuid: GattUuid },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Classification recorded for this failure, if it has one.
    pub const fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::ScannerUnavailable { .. } => Some(ErrorClass::ScannerUnavailable),
            Self::SlotUnavailable { .. } => Some(ErrorClass::SlotTimeout),
            Self::Connect { source, .. } => match source.class() {
                ErrorClass::Timeout => Some(ErrorClass::Timeout),
                _ => Some(ErrorClass::ConnectError),
            },
            Self::ServiceDiscovery { .. } => Some(ErrorClass::ServiceDiscoveryError),
            Self::CoolingDown { .. } => Some(ErrorClass::Backoff),
            Self::Resolve(_) | Self::EmptyPayload { .. } => Some(ErrorClass::GattOperationError),
            Self::Gatt { source, .. } => Some(source.class()),
            Self::Cancelled => None,
        }
    }

    pub const fn is_transient(&self) -> bool {
        match self.class() {
            Some(class) => class.is_transient(),
            None => false,
        }
    }
}

// ── Fleet errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    #[error("device {address} is already registered")]
    DuplicateDevice { address: TagAddress },

    #[error("device {address} is not registered")]
    UnknownDevice { address: TagAddress },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_match_retry_policy() {
        for class in [
            ErrorClass::ScannerUnavailable,
            ErrorClass::SlotTimeout,
            ErrorClass::ConnectError,
            ErrorClass::Timeout,
            ErrorClass::IoError,
            ErrorClass::Backoff,
        ] {
            assert!(class.is_transient(), "{class} should be transient");
        }
        for class in [
            ErrorClass::ServiceDiscoveryError,
            ErrorClass::NotifyError,
            ErrorClass::GattAmbiguousCharacteristic,
            ErrorClass::GattOperationError,
        ] {
            assert!(!class.is_transient(), "{class} should not be transient");
        }
    }

    #[test]
    fn transport_timeout_during_connect_keeps_timeout_class() {
        let err = SessionError::Connect {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            source: TransportError::Timeout,
        };
        assert_eq!(err.class(), Some(ErrorClass::Timeout));
        assert!(err.is_transient());
    }

    #[test]
    fn gatt_failures_inherit_transport_class() {
        let err = SessionError::Gatt {
            op: "write",
            target: "handle 0x0020".into(),
            source: TransportError::Gatt("rejected".into()),
        };
        assert_eq!(err.class(), Some(ErrorClass::GattOperationError));
        assert!(!err.is_transient());
        assert_eq!(ErrorClass::GattOperationError.to_string(), "gatt_operation_error");
    }

    #[test]
    fn cancellation_has_no_class() {
        assert_eq!(SessionError::Cancelled.class(), None);
        assert!(!SessionError::Cancelled.is_transient());
    }
}
