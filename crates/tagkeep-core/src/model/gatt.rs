// ── GATT model ──
//
// Services and characteristics as reported by a transport's service
// discovery, plus the two ways of addressing a characteristic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 16-bit UUIDs expand into the Bluetooth base UUID at bits 96..112.
const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// A normalized 128-bit GATT UUID. Comparison is by value, so any
/// textual spelling of the same UUID maps to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GattUuid(Uuid);

impl GattUuid {
    /// Expand an assigned 16-bit UUID (e.g. `0x2A19`).
    pub const fn from_short(short: u16) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96)))
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for GattUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for GattUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for GattUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Which operations a characteristic permits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharProperties {
    pub const fn writable(self) -> bool {
        self.write || self.write_without_response
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: GattUuid,
    pub handle: u16,
    pub properties: CharProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: GattUuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// How a GATT operation names its characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharTarget {
    /// By UUID; the transport rejects this when the UUID is not unique.
    Uuid(GattUuid),
    /// By attribute handle, always unambiguous.
    Handle(u16),
}

impl fmt::Display for CharTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "characteristic {uuid}"),
            Self::Handle(handle) => write!(f, "handle 0x{handle:04x}"),
        }
    }
}
