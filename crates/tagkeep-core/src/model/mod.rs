// ── Domain model ──

pub mod address;
pub mod gatt;
pub mod snapshot;

pub use address::{AddressError, TagAddress};
pub use gatt::{CharProperties, CharTarget, GattCharacteristic, GattService, GattUuid};
pub use snapshot::{ButtonEvent, ConnectionState, DeviceSnapshot};
