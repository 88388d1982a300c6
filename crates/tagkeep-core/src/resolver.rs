// ── Characteristic handle resolution ──
//
// Some tags expose the same characteristic UUID in more than one
// service, which makes UUID-addressed GATT calls ambiguous. The
// resolver picks one concrete handle per UUID from the discovered
// service table and caches it for the lifetime of the link.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::model::{GattCharacteristic, GattService, GattUuid};
use crate::protocol::CharacteristicSpec;

/// Per-link handle cache over a discovered service table.
#[derive(Debug, Default)]
pub struct HandleResolver {
    services: Vec<GattService>,
    cache: HashMap<GattUuid, u16>,
}

impl HandleResolver {
    pub fn new(services: Vec<GattService>) -> Self {
        Self {
            services,
            cache: HashMap::new(),
        }
    }

    /// Resolve `spec` to a handle, consulting the cache first.
    ///
    /// Every UUID match is collected in discovery order. With several
    /// matches the preferred service narrows the list if it holds any of
    /// them. When writing is required the writable matches narrow it
    /// further, but only if at least one is writable. The first remaining
    /// match wins and a warning lists every candidate.
    pub fn resolve(&mut self, spec: &CharacteristicSpec) -> Result<u16, ResolveError> {
        if let Some(&handle) = self.cache.get(&spec.uuid) {
            return Ok(handle);
        }

        let mut candidates: Vec<(GattUuid, &GattCharacteristic)> = self
            .services
            .iter()
            .flat_map(|svc| {
                svc.characteristics
                    .iter()
                    .filter(|ch| ch.uuid == spec.uuid)
                    .map(move |ch| (svc.uuid, ch))
            })
            .collect();

        if candidates.len() > 1 {
            if let Some(preferred) = spec.preferred_service {
                narrow(&mut candidates, |(svc, _)| *svc == preferred);
            }
        }
        if spec.require_write {
            narrow(&mut candidates, |(_, ch)| ch.properties.writable());
        }

        let Some(&(service, chosen)) = candidates.first() else {
            return Err(ResolveError::NotFound { uuid: spec.uuid });
        };
        let handle = chosen.handle;

        if candidates.len() > 1 {
            let listed: Vec<String> = candidates
                .iter()
                .map(|(svc, ch)| format!("{svc}/{:#06x}", ch.handle))
                .collect();
            warn!(
                uuid = %spec.uuid,
                handle,
                candidates = %listed.join(", "),
                "characteristic UUID is ambiguous, using first match"
            );
        } else {
            debug!(uuid = %spec.uuid, service = %service, handle, "resolved characteristic handle");
        }

        self.cache.insert(spec.uuid, handle);
        Ok(handle)
    }

    pub fn cached(&self, uuid: &GattUuid) -> Option<u16> {
        self.cache.get(uuid).copied()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Forget every cached handle; the service table is kept.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }
}

/// Keep only the items matching `keep`, unless that would leave none.
fn narrow<T>(items: &mut Vec<T>, keep: impl Fn(&T) -> bool) {
    if items.iter().any(&keep) {
        items.retain(&keep);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::CharProperties;
    use crate::protocol::{ALERT_LEVEL, ALERT_LEVEL_SPEC, BATTERY_LEVEL_SPEC};

    const READ: CharProperties = CharProperties {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
    };
    const WRITE: CharProperties = CharProperties {
        read: false,
        write: false,
        write_without_response: true,
        notify: false,
    };

    fn service(short: u16, chars: &[(u16, u16, CharProperties)]) -> GattService {
        GattService {
            uuid: GattUuid::from_short(short),
            characteristics: chars
                .iter()
                .map(|&(uuid, handle, properties)| GattCharacteristic {
                    uuid: GattUuid::from_short(uuid),
                    handle,
                    properties,
                })
                .collect(),
        }
    }

    #[test]
    fn preferred_service_breaks_tie() {
        let mut resolver = HandleResolver::new(vec![
            service(0xFFE0, &[(0x2A06, 0x0011, WRITE)]),
            service(0x1802, &[(0x2A06, 0x0020, WRITE)]),
        ]);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x0020);
        assert_eq!(resolver.cached(&ALERT_LEVEL), Some(0x0020));
    }

    #[test]
    fn preferred_service_applies_before_writability() {
        let mut resolver = HandleResolver::new(vec![
            service(0xFFE0, &[(0x2A06, 0x0031, WRITE)]),
            service(0x1802, &[(0x2A06, 0x0020, READ)]),
        ]);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x0020);
    }

    #[test]
    fn writability_narrows_within_preferred_service() {
        let mut resolver = HandleResolver::new(vec![
            service(0xFFE0, &[(0x2A06, 0x0011, WRITE)]),
            service(0x1802, &[(0x2A06, 0x0020, READ), (0x2A06, 0x0022, WRITE)]),
        ]);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x0022);
    }

    #[test]
    fn writability_narrows_without_preferred_match() {
        let mut resolver = HandleResolver::new(vec![
            service(0xAAAA, &[(0x2A06, 0x0010, READ)]),
            service(0xBBBB, &[(0x2A06, 0x0020, WRITE)]),
        ]);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x0020);
    }

    #[test]
    fn write_requirement_falls_back_when_nothing_is_writable() {
        let mut resolver = HandleResolver::new(vec![service(0xAAAA, &[(0x2A06, 0x0010, READ)])]);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x0010);
    }

    #[test]
    fn remaining_tie_picks_discovery_order() {
        let mut resolver = HandleResolver::new(vec![
            service(0xAAAA, &[(0x2A19, 0x0040, READ)]),
            service(0xBBBB, &[(0x2A19, 0x0050, READ)]),
        ]);
        assert_eq!(resolver.resolve(&BATTERY_LEVEL_SPEC).unwrap(), 0x0040);
    }

    #[test]
    fn missing_characteristic_is_not_found() {
        let mut resolver = HandleResolver::new(vec![service(0x180F, &[(0x2A19, 0x30, READ)])]);
        let err = resolver.resolve(&ALERT_LEVEL_SPEC).unwrap_err();
        assert_eq!(err, ResolveError::NotFound { uuid: ALERT_LEVEL });
        assert_eq!(resolver.cached_len(), 0);
    }

    #[test]
    fn invalidate_clears_cache_only() {
        let mut resolver = HandleResolver::new(vec![service(0x1802, &[(0x2A06, 0x20, WRITE)])]);
        resolver.resolve(&ALERT_LEVEL_SPEC).unwrap();
        assert_eq!(resolver.cached_len(), 1);

        resolver.invalidate();
        assert_eq!(resolver.cached_len(), 0);
        assert_eq!(resolver.resolve(&ALERT_LEVEL_SPEC).unwrap(), 0x20);
    }
}
