// ── Availability tracking ──
//
// Presence comes from advertisements and scanner "gone" events only.
// Connection state never feeds into it: a tag can be advertising while
// unconnected, and a dropped link says nothing about reachability.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::model::DeviceSnapshot;

/// Sole writer of the presence fields of a [`DeviceSnapshot`].
#[derive(Debug, Clone)]
pub struct AvailabilityTracker {
    state: Arc<watch::Sender<DeviceSnapshot>>,
}

impl AvailabilityTracker {
    pub(crate) fn new(state: Arc<watch::Sender<DeviceSnapshot>>) -> Self {
        Self { state }
    }

    /// An advertisement was heard.
    pub fn record_advertisement(&self, rssi: i16, seen_at: DateTime<Utc>) {
        let became_available = self.set(true, |snap| {
            snap.rssi = Some(rssi);
            snap.last_seen = Some(seen_at);
        });
        if became_available {
            debug!(address = %self.state.borrow().address, rssi, "tag became available");
        } else {
            trace!(address = %self.state.borrow().address, rssi, "advertisement");
        }
    }

    /// The scanner reported the tag gone. Signal strength and last-seen
    /// time are kept for display.
    pub fn mark_lost(&self) {
        if self.set(false, |_| {}) {
            debug!(address = %self.state.borrow().address, "tag no longer advertising");
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.borrow().available
    }

    /// Single setter for `available`; returns whether it changed.
    fn set(&self, available: bool, extra: impl FnOnce(&mut DeviceSnapshot)) -> bool {
        let mut changed = false;
        self.state.send_modify(|snap| {
            changed = snap.available != available;
            snap.available = available;
            extra(snap);
        });
        changed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ConnectionState;

    fn tracker() -> (AvailabilityTracker, watch::Receiver<DeviceSnapshot>) {
        let snapshot = DeviceSnapshot::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), "Keys".into());
        let (tx, rx) = watch::channel(snapshot);
        (AvailabilityTracker::new(Arc::new(tx)), rx)
    }

    #[test]
    fn advertisement_marks_available_with_rssi() {
        let (tracker, rx) = tracker();
        let now = Utc::now();
        tracker.record_advertisement(-60, now);

        let snap = rx.borrow();
        assert!(snap.available);
        assert_eq!(snap.rssi, Some(-60));
        assert_eq!(snap.last_seen, Some(now));
    }

    #[test]
    fn lost_keeps_last_reading_and_leaves_connection_alone() {
        let (tracker, rx) = tracker();
        tracker.record_advertisement(-71, Utc::now());
        tracker.mark_lost();

        let snap = rx.borrow();
        assert!(!snap.available);
        assert_eq!(snap.rssi, Some(-71));
        assert_eq!(snap.connection_state, ConnectionState::Idle);
        assert!(!tracker.is_available());
    }
}
