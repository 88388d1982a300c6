// ── Link state machine ──
//
// Everything that opens, tears down, or reacts to the loss of the
// physical link. All of it runs under the session's link lock, which
// doubles as the GATT lock: one connect attempt and one GATT exchange
// at a time per tag.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::SessionInner;
use crate::admission::{AdmissionStats, SlotGuard};
use crate::config::SlotTuning;
use crate::error::{SessionError, TransportError};
use crate::model::{ConnectionState, TagAddress};
use crate::protocol::BUTTON_NOTIFY;
use crate::resolver::HandleResolver;
use crate::transport::{DisconnectNotifier, GattLink};

// ── Purposes and slot timeouts ───────────────────────────────────────

/// Why a connection is being opened; shapes the slot wait.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectPurpose {
    General,
    BackgroundBattery,
    InteractiveAlarm,
    PolicySync,
}

impl ConnectPurpose {
    const fn is_background(self) -> bool {
        matches!(self, Self::BackgroundBattery)
    }

    const fn is_interactive(self) -> bool {
        matches!(self, Self::InteractiveAlarm | Self::PolicySync)
    }
}

/// Whether recent slot timeouts pushed the wait heuristics off baseline.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdaptiveMode {
    #[default]
    Normal,
    TimeoutHigh,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SlotWait {
    pub timeout: Duration,
    pub mode: AdaptiveMode,
    pub timeout_ratio: f64,
}

/// Slot wait for `purpose` under the current admission load.
///
/// Background work gives up quickly so it never starves interactive
/// commands; interactive work waits longer, and longer still when the
/// pool is saturated or timing out often.
pub(crate) fn slot_wait(
    purpose: ConnectPurpose,
    tuning: &SlotTuning,
    stats: &AdmissionStats,
) -> SlotWait {
    let mut timeout = tuning.acquire_timeout;
    if purpose.is_background() {
        timeout = timeout.min(tuning.background_cap);
    } else if purpose.is_interactive() {
        timeout = timeout.max(tuning.interactive_floor);
    }

    if stats.is_saturated() {
        timeout = if purpose.is_background() {
            timeout.min(tuning.background_contended_cap)
        } else {
            tuning.ceiling.min(timeout + tuning.contended_bump)
        };
    }

    let timeout_ratio = stats.timeout_ratio();
    let mode = if stats.acquire_total >= tuning.adaptive_min_samples
        && timeout_ratio >= tuning.adaptive_timeout_ratio
    {
        timeout = if purpose.is_background() {
            timeout.min(tuning.background_timeout_high_cap)
        } else {
            tuning.ceiling.min(timeout + tuning.timeout_high_bump)
        };
        AdaptiveMode::TimeoutHigh
    } else {
        AdaptiveMode::Normal
    };

    SlotWait {
        timeout,
        mode,
        timeout_ratio,
    }
}

// ── Link state ───────────────────────────────────────────────────────

/// An open link with its discovered services.
pub(crate) struct ActiveLink {
    pub link: Box<dyn GattLink>,
    pub generation: u64,
    pub resolver: HandleResolver,
}

/// Connection bookkeeping guarded by the session's link lock.
#[derive(Default)]
pub(crate) struct LinkState {
    pub active: Option<ActiveLink>,
    pub slot: Option<SlotGuard>,
    pub fail_count: u32,
    pub cooldown_until: Option<Instant>,
    pub unavailability_logged: bool,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    pub fn slot_held(&self) -> bool {
        self.slot.as_ref().is_some_and(SlotGuard::is_held)
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Return the slot, if one is held. Safe to call any number of times.
    pub fn release_slot(&mut self, address: &TagAddress) {
        if let Some(mut slot) = self.slot.take() {
            if slot.release() {
                debug!(%address, "connection slot released");
            }
        }
    }

    /// Record one more failure and start a cooldown of
    /// `min(cap, 2^fail_count)` seconds.
    pub fn apply_backoff(&mut self, cap: Duration, max_fail_count: u32) -> Duration {
        self.fail_count = (self.fail_count + 1).min(max_fail_count.max(1));
        let exp = Duration::from_secs(2_u64.saturating_pow(self.fail_count));
        let backoff = exp.min(cap);
        self.cooldown_until = Some(Instant::now() + backoff);
        backoff
    }

    pub fn reset_failures(&mut self) {
        self.fail_count = 0;
        self.cooldown_until = None;
    }
}

fn not_connected(address: &TagAddress) -> SessionError {
    SessionError::Connect {
        address: address.clone(),
        source: TransportError::NotConnected,
    }
}

// ── Session transitions ──────────────────────────────────────────────

impl SessionInner {
    pub(crate) async fn ensure_connected(
        self: &Arc<Self>,
        purpose: ConnectPurpose,
    ) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.ensure_connected_locked(&mut link, purpose).await
    }

    /// Bring the link up, or explain why not. Idempotent while connected.
    /// Connect requested by a spawned task. Does nothing if the request
    /// was superseded by an explicit disconnect or a link loss.
    pub(crate) async fn background_connect(self: &Arc<Self>, epoch: u64) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        if self.connect_epoch.load(Ordering::Acquire) != epoch {
            trace!(address = %self.address, "superseded background connect skipped");
            return Ok(());
        }
        self.ensure_connected_locked(&mut link, ConnectPurpose::General).await
    }

    pub(crate) async fn ensure_connected_locked(
        self: &Arc<Self>,
        link: &mut LinkState,
        purpose: ConnectPurpose,
    ) -> Result<(), SessionError> {
        if link.is_connected() {
            return Ok(());
        }

        if let Some(remaining) = link.cooldown_remaining() {
            let err = SessionError::CoolingDown {
                address: self.address.clone(),
                remaining,
            };
            debug!(address = %self.address, remaining_ms = remaining.as_millis(), "connect suppressed by cooldown");
            self.publish_link(link, ConnectionState::Backoff);
            return Err(err);
        }

        self.publish_link(link, ConnectionState::Connecting);

        let Some(device) = self.transport.connectable_device(&self.address) else {
            link.release_slot(&self.address);
            let err = SessionError::ScannerUnavailable {
                address: self.address.clone(),
            };
            debug!(address = %self.address, "no connectable path to tag");
            self.record_error(&err);
            self.publish_link(link, ConnectionState::Scanning);
            return Err(err);
        };

        if !link.slot_held() {
            let wait = slot_wait(purpose, &self.tuning.slots, &self.admission.stats());
            self.note_slot_wait(wait);
            match self.admission.acquire(Some(wait.timeout)).await {
                Ok(guard) => link.slot = Some(guard),
                Err(source) => {
                    let backoff = link.apply_backoff(
                        self.tuning.backoff.max_backoff / 2,
                        self.tuning.backoff.max_fail_count,
                    );
                    let err = SessionError::SlotUnavailable {
                        address: self.address.clone(),
                        source,
                    };
                    self.connect_failed(link, &err, purpose, backoff);
                    return Err(err);
                }
            }
            self.publish_link(link, ConnectionState::Connecting);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let notifier = DisconnectNotifier::new(generation, self.events_tx.clone());
        let conn = match self.transport.connect(&device, notifier).await {
            Ok(conn) => conn,
            Err(source) => {
                link.release_slot(&self.address);
                let backoff = link.apply_backoff(
                    self.tuning.backoff.max_backoff,
                    self.tuning.backoff.max_fail_count,
                );
                let err = SessionError::Connect {
                    address: self.address.clone(),
                    source,
                };
                self.connect_failed(link, &err, purpose, backoff);
                return Err(err);
            }
        };

        self.publish_link(link, ConnectionState::Discovering);
        let services = match conn.discover_services().await {
            Ok(services) => services,
            Err(source) => {
                if let Err(e) = conn.disconnect().await {
                    debug!(address = %self.address, error = %e, "disconnect after failed discovery");
                }
                link.release_slot(&self.address);
                let backoff = link.apply_backoff(
                    self.tuning.backoff.max_backoff,
                    self.tuning.backoff.max_fail_count,
                );
                let err = SessionError::ServiceDiscovery {
                    address: self.address.clone(),
                    source,
                };
                self.connect_failed(link, &err, purpose, backoff);
                return Err(err);
            }
        };

        link.active = Some(ActiveLink {
            link: conn,
            generation,
            resolver: HandleResolver::new(services),
        });
        link.reset_failures();
        self.clear_error();
        if std::mem::take(&mut link.unavailability_logged) {
            info!(address = %self.address, "tag link recovered");
            self.with_counters(|c| c.recoveries += 1);
        }

        let notifications_ok = self.post_connect_setup(link).await;
        let state = if notifications_ok {
            ConnectionState::Ready
        } else {
            ConnectionState::Degraded
        };
        self.publish_link(link, state);
        debug!(address = %self.address, %purpose, generation, state = %state, "tag connected");
        Ok(())
    }

    fn connect_failed(
        self: &Arc<Self>,
        link: &LinkState,
        err: &SessionError,
        purpose: ConnectPurpose,
        backoff: Duration,
    ) {
        debug!(
            address = %self.address,
            %purpose,
            fail_count = link.fail_count,
            backoff_ms = backoff.as_millis(),
            error = %err,
            "connect attempt failed"
        );
        self.record_error(err);
        self.publish_link(link, ConnectionState::Backoff);
        self.schedule_cooldown_expiry(backoff);
    }

    /// Move `Backoff` back to `Idle` once the cooldown has run out.
    fn schedule_cooldown_expiry(self: &Arc<Self>, after: Duration) {
        let inner = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    let link = inner.link.lock().await;
                    let in_backoff =
                        inner.state.borrow().connection_state == ConnectionState::Backoff;
                    if in_backoff && !link.is_connected() && link.cooldown_remaining().is_none() {
                        inner.publish_link(&link, ConnectionState::Idle);
                    }
                }
            }
        });
        if let Some(previous) = self.tasks().cooldown_timer.replace(handle) {
            previous.abort();
        }
    }

    /// Close the link on request. Calling it with no link open only
    /// normalizes the published state.
    pub(crate) async fn disconnect_locked(&self, link: &mut LinkState) {
        if let Some(active) = link.active.take() {
            if let Err(e) = active.link.unsubscribe(BUTTON_NOTIFY).await {
                debug!(address = %self.address, error = %e, "unsubscribe before disconnect");
            }
            if let Err(e) = active.link.disconnect().await {
                debug!(address = %self.address, error = %e, "transport disconnect");
            }
            debug!(address = %self.address, generation = active.generation, "tag disconnected");
        }
        link.release_slot(&self.address);
        let state = if link.cooldown_remaining().is_some() {
            ConnectionState::Backoff
        } else {
            ConnectionState::Idle
        };
        self.publish_link(link, state);
    }

    /// Transport reported the link of `generation` gone.
    pub(crate) async fn handle_link_lost(self: &Arc<Self>, generation: u64) {
        let mut link = self.link.lock().await;
        let current = link.active.as_ref().map(|active| active.generation);
        if current != Some(generation) {
            debug!(address = %self.address, generation, ?current, "stale disconnect callback ignored");
            return;
        }

        link.active = None;
        link.release_slot(&self.address);
        self.cancel_pending_connect();
        if !link.unavailability_logged {
            link.unavailability_logged = true;
            info!(address = %self.address, "tag link lost");
            self.with_counters(|c| c.unavailable_episodes += 1);
        }
        self.publish_link(&link, ConnectionState::Degraded);
        drop(link);

        let options = self.options.borrow().clone();
        if options.auto_reconnect && options.maintain_connection {
            self.spawn_connect();
        }
    }

    /// Active link or a not-connected error.
    pub(crate) fn active_link<'a>(&self, link: &'a mut LinkState) -> Result<&'a mut ActiveLink, SessionError> {
        link.active.as_mut().ok_or_else(|| not_connected(&self.address))
    }

    /// Mirror link bookkeeping into the observable snapshot.
    pub(crate) fn publish_link(&self, link: &LinkState, state: ConnectionState) {
        self.state.send_modify(|snap| {
            snap.connection_state = state;
            snap.connected = link.is_connected();
            snap.conn_slot_held = link.slot_held();
            snap.connect_fail_count = link.fail_count;
            snap.cooldown_until = link.cooldown_remaining().and(link.cooldown_until);
            snap.cached_handles = link
                .active
                .as_ref()
                .map_or(0, |active| active.resolver.cached_len());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionStats;

    fn stats(in_use: usize, total: u64, timeouts: u64) -> AdmissionStats {
        AdmissionStats {
            max_slots: 3,
            in_use,
            acquire_total: total,
            acquire_timeout: timeouts,
            acquire_error: 0,
            average_wait: Duration::ZERO,
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn purpose_shapes_base_timeout() {
        let tuning = SlotTuning::default();
        let idle = stats(0, 0, 0);
        assert_eq!(slot_wait(ConnectPurpose::General, &tuning, &idle).timeout, secs(20));
        assert_eq!(
            slot_wait(ConnectPurpose::BackgroundBattery, &tuning, &idle).timeout,
            secs(6)
        );
        assert_eq!(
            slot_wait(ConnectPurpose::InteractiveAlarm, &tuning, &idle).timeout,
            secs(25)
        );
    }

    #[test]
    fn saturation_shortens_background_and_extends_interactive() {
        let tuning = SlotTuning::default();
        let full = stats(3, 4, 0);
        assert_eq!(
            slot_wait(ConnectPurpose::BackgroundBattery, &tuning, &full).timeout,
            secs(4)
        );
        assert_eq!(slot_wait(ConnectPurpose::General, &tuning, &full).timeout, secs(25));
        assert_eq!(
            slot_wait(ConnectPurpose::PolicySync, &tuning, &full).timeout,
            secs(30)
        );
    }

    #[test]
    fn high_timeout_ratio_switches_mode() {
        let tuning = SlotTuning::default();
        let flaky = stats(0, 10, 4);
        let wait = slot_wait(ConnectPurpose::BackgroundBattery, &tuning, &flaky);
        assert_eq!(wait.mode, AdaptiveMode::TimeoutHigh);
        assert_eq!(wait.timeout, secs(3));
        assert_eq!(
            slot_wait(ConnectPurpose::General, &tuning, &flaky).timeout,
            secs(24)
        );

        // Too few samples to trust the ratio.
        let early = stats(0, 5, 5);
        assert_eq!(
            slot_wait(ConnectPurpose::General, &tuning, &early).mode,
            AdaptiveMode::Normal
        );
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let mut link = LinkState::default();
        let observed: Vec<u64> = (0..7)
            .map(|_| link.apply_backoff(secs(60), 6).as_secs())
            .collect();
        assert_eq!(observed, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(link.fail_count, 6);
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));

        link.reset_failures();
        assert_eq!(link.fail_count, 0);
        assert!(link.cooldown_remaining().is_none());
        assert_eq!(link.apply_backoff(secs(60), 6), secs(2));
    }

    #[test]
    fn slot_failures_use_half_cap() {
        let mut link = LinkState::default();
        for _ in 0..6 {
            link.apply_backoff(secs(30), 6);
        }
        assert_eq!(link.apply_backoff(secs(30), 6), secs(30));
    }
}
