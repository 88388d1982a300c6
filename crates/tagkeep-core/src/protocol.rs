// ── Tag protocol ──
//
// Characteristic layout and payload meanings for the anti-loss tags.
// The tags expose a vendor service (FFE0) for button notifications and
// the disconnect-alarm policy, the standard Immediate Alert service for
// ringing, and the standard Battery service.

use crate::model::GattUuid;

/// Advertised vendor service used to recognise tags while scanning.
pub const TAG_SERVICE: GattUuid = GattUuid::from_short(0xFFE0);
/// Button press notifications.
pub const BUTTON_NOTIFY: GattUuid = GattUuid::from_short(0xFFE1);
/// Single byte: 1 = beep when the link drops, 0 = stay silent.
pub const DISCONNECT_POLICY: GattUuid = GattUuid::from_short(0xFFE2);
pub const ALERT_LEVEL: GattUuid = GattUuid::from_short(0x2A06);
pub const BATTERY_LEVEL: GattUuid = GattUuid::from_short(0x2A19);

pub const IMMEDIATE_ALERT_SERVICE: GattUuid = GattUuid::from_short(0x1802);
pub const BATTERY_SERVICE: GattUuid = GattUuid::from_short(0x180F);

pub const ALERT_RING: u8 = 0x01;
pub const ALERT_SILENCE: u8 = 0x00;
const BUTTON_PRESSED: u8 = 0x01;

/// How to pick a characteristic out of a discovered service table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSpec {
    pub uuid: GattUuid,
    /// Tie-breaker when the UUID appears in more than one service.
    pub preferred_service: Option<GattUuid>,
    /// Only consider characteristics that accept writes.
    pub require_write: bool,
}

pub const ALERT_LEVEL_SPEC: CharacteristicSpec = CharacteristicSpec {
    uuid: ALERT_LEVEL,
    preferred_service: Some(IMMEDIATE_ALERT_SERVICE),
    require_write: true,
};

pub const BATTERY_LEVEL_SPEC: CharacteristicSpec = CharacteristicSpec {
    uuid: BATTERY_LEVEL,
    preferred_service: Some(BATTERY_SERVICE),
    require_write: false,
};

pub const DISCONNECT_POLICY_SPEC: CharacteristicSpec = CharacteristicSpec {
    uuid: DISCONNECT_POLICY,
    preferred_service: Some(TAG_SERVICE),
    require_write: true,
};

/// A notification whose first byte is `0x01` is a button press.
pub fn is_button_press(payload: &[u8]) -> bool {
    payload.first() == Some(&BUTTON_PRESSED)
}

/// Battery percentage from the first payload byte, clamped to 0..=100.
pub fn battery_percent(payload: &[u8]) -> Option<u8> {
    payload.first().map(|&raw| raw.min(100))
}

pub const fn policy_byte(alarm_on_disconnect: bool) -> u8 {
    if alarm_on_disconnect { 0x01 } else { 0x00 }
}
