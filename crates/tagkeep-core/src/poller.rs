// ── Background battery poller ──
//
// One loop per session. Battery reads are the least important use of a
// connection slot, so the loop yields to foreground work and backs off
// when the queue or the admission controller look busy. The decision
// functions are pure; the loop only gathers signals and sleeps.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::admission::AdmissionStats;
use crate::config::PollerTuning;
use crate::error::ErrorClass;
use crate::session::SessionInner;

/// Why the poller chose its current sleep.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SleepReason {
    Startup,
    DeferForForeground,
    QueueBusy,
    Congested,
    BootstrapBattery,
    RecoveryAfterConnectFailure,
    NormalPoll,
}

/// Everything the poller looks at before deciding.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSignals {
    pub connected: bool,
    pub slot_held: bool,
    pub queue_depth: usize,
    /// Time since the last alarm operation started executing.
    pub since_last_alarm: Option<Duration>,
    pub admission: AdmissionStats,
    pub has_battery: bool,
    pub last_error_class: Option<ErrorClass>,
}

/// Whether to skip this cycle in favor of foreground work.
///
/// An open link never defers: reading over it costs no slot.
pub fn should_defer(signals: &PollSignals, tuning: &PollerTuning) -> bool {
    if signals.connected || signals.slot_held {
        return false;
    }
    if signals.queue_depth > 0 {
        return true;
    }
    if signals
        .since_last_alarm
        .is_some_and(|elapsed| elapsed < tuning.alarm_cooloff)
    {
        return true;
    }
    signals.admission.is_saturated()
}

/// Sleep after a poll. `jitter` is added only to the regular interval.
pub fn next_delay(
    signals: &PollSignals,
    forced: bool,
    poll_interval: Duration,
    tuning: &PollerTuning,
    jitter: Duration,
) -> (Duration, SleepReason) {
    if signals.queue_depth >= tuning.queue_busy_depth {
        return (tuning.queue_busy_sleep, SleepReason::QueueBusy);
    }
    if signals.admission.average_wait >= tuning.congestion_wait {
        return (tuning.congested_sleep, SleepReason::Congested);
    }
    if !signals.has_battery {
        return (tuning.bootstrap_sleep, SleepReason::BootstrapBattery);
    }
    if forced
        && signals
            .last_error_class
            .is_some_and(ErrorClass::is_connect_failure)
    {
        return (tuning.recovery_sleep, SleepReason::RecoveryAfterConnectFailure);
    }
    (poll_interval + jitter, SleepReason::NormalPoll)
}

fn random_between(range: &std::ops::RangeInclusive<Duration>) -> Duration {
    if range.start() >= range.end() {
        return *range.start();
    }
    rand::thread_rng().gen_range(range.clone())
}

/// Sleep unless cancelled first; returns `false` on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

pub(crate) async fn run(session: Arc<SessionInner>, cancel: CancellationToken) {
    let tuning = session.tuning.poller.clone();
    let startup = random_between(&tuning.startup_jitter);
    session.note_poll_sleep(startup, SleepReason::Startup);
    if !pause(startup, &cancel).await {
        return;
    }

    loop {
        let options = session.options.borrow().clone();
        let signals = session.poll_signals();
        // First reading is worth a connection; without a standing link
        // every reading is.
        let forced = !signals.has_battery || !options.maintain_connection;

        let (delay, reason) = if should_defer(&signals, &tuning) {
            session.with_counters(|c| c.battery_defer_count += 1);
            (tuning.defer_sleep, SleepReason::DeferForForeground)
        } else {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                read = session.read_battery(forced) => read,
            };
            match read {
                Ok(level) => trace!(address = %session.address, ?level, forced, "battery poll"),
                Err(e) if forced => warn!(address = %session.address, error = %e, "forced battery poll failed"),
                Err(e) => debug!(address = %session.address, error = %e, "battery poll failed"),
            }
            let jitter = random_between(&(Duration::ZERO..=tuning.poll_jitter));
            next_delay(
                &session.poll_signals(),
                forced,
                options.battery_poll_interval,
                &tuning,
                jitter,
            )
        };

        session.note_poll_sleep(delay, reason);
        trace!(address = %session.address, delay_s = delay.as_secs(), %reason, "battery poller sleeping");
        if !pause(delay, &cancel).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_stats() -> AdmissionStats {
        AdmissionStats {
            max_slots: 3,
            in_use: 0,
            acquire_total: 0,
            acquire_timeout: 0,
            acquire_error: 0,
            average_wait: Duration::ZERO,
        }
    }

    fn signals() -> PollSignals {
        PollSignals {
            connected: false,
            slot_held: false,
            queue_depth: 0,
            since_last_alarm: None,
            admission: idle_stats(),
            has_battery: true,
            last_error_class: None,
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn quiet_session_polls() {
        assert!(!should_defer(&signals(), &PollerTuning::default()));
    }

    #[test]
    fn defers_to_queued_work_and_recent_alarms() {
        let tuning = PollerTuning::default();

        let queued = PollSignals {
            queue_depth: 1,
            ..signals()
        };
        assert!(should_defer(&queued, &tuning));

        let recent_alarm = PollSignals {
            since_last_alarm: Some(Duration::from_secs(2)),
            ..signals()
        };
        assert!(should_defer(&recent_alarm, &tuning));

        let old_alarm = PollSignals {
            since_last_alarm: Some(Duration::from_secs(9)),
            ..signals()
        };
        assert!(!should_defer(&old_alarm, &tuning));
    }

    #[test]
    fn defers_when_pool_full_unless_holding_a_slot() {
        let tuning = PollerTuning::default();
        let full = PollSignals {
            admission: AdmissionStats {
                in_use: 3,
                ..idle_stats()
            },
            ..signals()
        };
        assert!(should_defer(&full, &tuning));

        let holder = PollSignals {
            connected: true,
            slot_held: true,
            queue_depth: 2,
            ..full
        };
        assert!(!should_defer(&holder, &tuning));
    }

    #[test]
    fn delay_precedence() {
        let tuning = PollerTuning::default();
        let jitter = Duration::from_secs(7);

        let busy = PollSignals {
            queue_depth: 3,
            has_battery: false,
            ..signals()
        };
        assert_eq!(
            next_delay(&busy, true, HOUR, &tuning, jitter),
            (Duration::from_secs(120), SleepReason::QueueBusy)
        );

        let congested = PollSignals {
            admission: AdmissionStats {
                average_wait: Duration::from_millis(1500),
                ..idle_stats()
            },
            has_battery: false,
            ..signals()
        };
        assert_eq!(
            next_delay(&congested, true, HOUR, &tuning, jitter).1,
            SleepReason::Congested
        );

        let fresh = PollSignals {
            has_battery: false,
            ..signals()
        };
        assert_eq!(
            next_delay(&fresh, false, HOUR, &tuning, jitter),
            (Duration::from_secs(90), SleepReason::BootstrapBattery)
        );

        assert_eq!(
            next_delay(&signals(), false, HOUR, &tuning, jitter),
            (HOUR + jitter, SleepReason::NormalPoll)
        );
    }

    #[test]
    fn recovery_only_after_forced_connect_failure() {
        let tuning = PollerTuning::default();
        let failed = PollSignals {
            last_error_class: Some(ErrorClass::SlotTimeout),
            ..signals()
        };
        assert_eq!(
            next_delay(&failed, true, HOUR, &tuning, Duration::ZERO),
            (Duration::from_secs(180), SleepReason::RecoveryAfterConnectFailure)
        );
        assert_eq!(
            next_delay(&failed, false, HOUR, &tuning, Duration::ZERO).1,
            SleepReason::NormalPoll
        );

        let gatt = PollSignals {
            last_error_class: Some(ErrorClass::GattOperationError),
            ..signals()
        };
        assert_eq!(
            next_delay(&gatt, true, HOUR, &tuning, Duration::ZERO).1,
            SleepReason::NormalPoll
        );
    }

    #[test]
    fn degenerate_jitter_range_is_fixed() {
        let fixed = Duration::from_secs(1)..=Duration::from_secs(1);
        assert_eq!(random_between(&fixed), Duration::from_secs(1));
    }
}
