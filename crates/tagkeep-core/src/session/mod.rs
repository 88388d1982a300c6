// ── Device session ──
//
// One `DeviceSession` per tag. It owns the link state machine, the
// operation queue, the battery poller and the observable snapshot, and
// borrows the fleet-wide admission controller. Transport callbacks are
// posted to the session's event loop; nothing outside that loop and the
// link lock mutates connection state.

mod gatt;
mod link;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub use link::{AdaptiveMode, ConnectPurpose};
use link::{LinkState, SlotWait};

use crate::admission::AdmissionController;
use crate::availability::AvailabilityTracker;
use crate::config::{DeviceConfig, SessionOptions, SessionTuning};
use crate::error::SessionError;
use crate::model::{ButtonEvent, ConnectionState, DeviceSnapshot, TagAddress};
use crate::poller::{self, PollSignals, SleepReason};
use crate::protocol::{ALERT_RING, ALERT_SILENCE};
use crate::queue::{OperationAction, OperationKind, OperationOutput, OperationQueue};
use crate::transport::{LinkEvent, Transport};

const BUTTON_CHANNEL_CAPACITY: usize = 32;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Diagnostics ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub battery_defer_count: u64,
    pub last_poll_sleep: Option<(Duration, SleepReason)>,
    pub adaptive_mode: AdaptiveMode,
    pub adaptive_timeout_ratio: f64,
    pub unavailable_episodes: u64,
    pub recoveries: u64,
}

/// Point-in-time internals of one session, safe to show to users.
#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct SessionDiagnostics {
    /// Address with the last octets masked.
    pub address: String,
    pub name: String,
    pub options: SessionOptions,
    pub connection_state: ConnectionState,
    pub connect_fail_count: u32,
    pub cooldown_active: bool,
    pub slot_held: bool,
    pub cached_handles: usize,
    pub queue_depth: usize,
    pub worker_running: bool,
    pub poller_running: bool,
    pub connect_task_running: bool,
    pub battery_read_busy: bool,
    pub battery_defer_count: u64,
    pub last_poll_sleep_secs: Option<f64>,
    pub last_poll_reason: Option<SleepReason>,
    pub adaptive_mode: AdaptiveMode,
    pub adaptive_timeout_ratio: f64,
    pub last_operation_error: Option<String>,
    pub unavailable_episodes: u64,
    pub recoveries: u64,
}

#[derive(Default)]
pub(crate) struct SessionTasks {
    pub event_loop: Option<JoinHandle<()>>,
    pub connect: Option<JoinHandle<()>>,
    pub poller: Option<(JoinHandle<()>, CancellationToken)>,
    pub cooldown_timer: Option<JoinHandle<()>>,
}

fn is_running(handle: Option<&JoinHandle<()>>) -> bool {
    handle.is_some_and(|h| !h.is_finished())
}

// ── Session internals ────────────────────────────────────────────────

pub(crate) struct SessionInner {
    pub address: TagAddress,
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub admission: Arc<AdmissionController>,
    pub tuning: SessionTuning,
    pub options: watch::Sender<SessionOptions>,
    pub state: Arc<watch::Sender<DeviceSnapshot>>,
    pub presence: AvailabilityTracker,
    pub buttons: broadcast::Sender<ButtonEvent>,
    /// Connect lock and GATT lock in one.
    pub link: Mutex<LinkState>,
    pub queue: OperationQueue,
    pub events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    pub generation: AtomicU64,
    /// Bumped whenever pending background connects become stale.
    pub connect_epoch: AtomicU64,
    pub cancel: CancellationToken,
    tasks: StdMutex<SessionTasks>,
    /// Held while a battery read is queued or running.
    battery_gate: Mutex<()>,
    counters: StdMutex<SessionCounters>,
}

impl SessionInner {
    pub(crate) fn tasks(&self) -> MutexGuard<'_, SessionTasks> {
        lock(&self.tasks)
    }

    pub(crate) fn with_counters<R>(&self, f: impl FnOnce(&mut SessionCounters) -> R) -> R {
        f(&mut lock(&self.counters))
    }

    pub(crate) fn record_error(&self, err: &SessionError) {
        if matches!(err, SessionError::Cancelled) {
            return;
        }
        let message = err.to_string();
        let class = err.class();
        self.state.send_modify(|snap| {
            snap.last_error = Some(message);
            snap.last_error_class = class;
        });
    }

    pub(crate) fn clear_error(&self) {
        self.state.send_if_modified(|snap| {
            let had_error = snap.last_error.is_some() || snap.last_error_class.is_some();
            snap.last_error = None;
            snap.last_error_class = None;
            had_error
        });
    }

    pub(crate) fn note_slot_wait(&self, wait: SlotWait) {
        self.with_counters(|c| {
            if c.adaptive_mode != wait.mode {
                debug!(address = %self.address, mode = %wait.mode, ratio = wait.timeout_ratio, "slot wait mode changed");
            }
            c.adaptive_mode = wait.mode;
            c.adaptive_timeout_ratio = wait.timeout_ratio;
        });
    }

    pub(crate) fn note_poll_sleep(&self, delay: Duration, reason: SleepReason) {
        self.with_counters(|c| c.last_poll_sleep = Some((delay, reason)));
    }

    pub(crate) fn poll_signals(&self) -> PollSignals {
        let (connected, slot_held, has_battery, last_error_class) = {
            let snap = self.state.borrow();
            (
                snap.connected,
                snap.conn_slot_held,
                snap.battery_percent.is_some(),
                snap.last_error_class,
            )
        };
        PollSignals {
            connected,
            slot_held,
            queue_depth: self.queue.depth(),
            since_last_alarm: self.queue.last_alarm_started().map(|at| at.elapsed()),
            admission: self.admission.stats(),
            has_battery,
            last_error_class,
        }
    }

    /// Start a background connect unless one is already running.
    pub(crate) fn spawn_connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut tasks = self.tasks();
        if is_running(tasks.connect.as_ref()) {
            trace!(address = %self.address, "connect already in progress");
            return;
        }
        let inner = Arc::clone(self);
        let cancel = self.cancel.clone();
        let epoch = self.connect_epoch.load(Ordering::Acquire);
        tasks.connect = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                result = inner.background_connect(epoch) => {
                    if let Err(e) = result {
                        debug!(address = %inner.address, error = %e, "background connect failed");
                    }
                }
            }
        }));
    }

    /// Drop any pending background connect. Callers hold the link lock,
    /// so the aborted task cannot be mid-connect.
    pub(crate) fn cancel_pending_connect(&self) {
        self.connect_epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.tasks().connect.take() {
            handle.abort();
        }
    }

    /// (Re)start the battery poller with the current options.
    fn restart_poller(self: &Arc<Self>) {
        let mut tasks = self.tasks();
        if let Some((handle, token)) = tasks.poller.take() {
            token.cancel();
            handle.abort();
        }
        if !self.tuning.poller.enabled || self.cancel.is_cancelled() {
            return;
        }
        let token = self.cancel.child_token();
        let handle = tokio::spawn(poller::run(Arc::clone(self), token.clone()));
        tasks.poller = Some((handle, token));
    }

    /// Battery read through the queue. A background read is dropped
    /// while another is outstanding; a forced one waits its turn.
    pub(crate) async fn read_battery(
        self: &Arc<Self>,
        force_connect: bool,
    ) -> Result<Option<u8>, SessionError> {
        let _gate = match self.battery_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) if !force_connect => {
                trace!(address = %self.address, "battery read already outstanding");
                return Ok(None);
            }
            Err(_) => self.battery_gate.lock().await,
        };

        let inner = Arc::clone(self);
        let action: OperationAction = Box::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner
                    .read_battery_op(force_connect)
                    .await
                    .map(OperationOutput::Battery)
            })
        });
        match self.queue.run(OperationKind::ReadBattery, action).await? {
            OperationOutput::Battery(level) => Ok(level),
            OperationOutput::Done => Ok(None),
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                LinkEvent::Disconnected { generation } => self.handle_link_lost(generation).await,
                LinkEvent::Notification { payload } => self.handle_notification(payload),
            }
        }
        trace!(address = %self.address, "session event loop stopped");
    }
}

// ── Public handle ────────────────────────────────────────────────────

/// Handle to one managed tag. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.inner.address)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Build a session. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: DeviceConfig,
        transport: Arc<dyn Transport>,
        admission: Arc<AdmissionController>,
        tuning: SessionTuning,
    ) -> Self {
        let name = config.display_name();
        let state = Arc::new(watch::Sender::new(DeviceSnapshot::new(
            config.address.clone(),
            name.clone(),
        )));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (buttons, _) = broadcast::channel(BUTTON_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        Self {
            inner: Arc::new(SessionInner {
                queue: OperationQueue::new(config.address.clone(), cancel.child_token()),
                address: config.address,
                name,
                transport,
                admission,
                tuning,
                options: watch::Sender::new(config.options),
                presence: AvailabilityTracker::new(Arc::clone(&state)),
                state,
                buttons,
                link: Mutex::new(LinkState::default()),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                generation: AtomicU64::new(0),
                connect_epoch: AtomicU64::new(0),
                cancel,
                tasks: StdMutex::new(SessionTasks::default()),
                battery_gate: Mutex::new(()),
                counters: StdMutex::new(SessionCounters::default()),
            }),
        }
    }

    pub fn address(&self) -> &TagAddress {
        &self.inner.address
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ── Lifecycle ──

    /// Spawn the event loop and battery poller, and connect right away
    /// if the tag is already reachable and should be kept connected.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        let inner = &self.inner;
        let Some(events) = lock(&inner.events_rx).take() else {
            debug!(address = %inner.address, "session already started");
            return;
        };
        let event_loop = tokio::spawn(Arc::clone(inner).run_events(events));
        inner.tasks().event_loop = Some(event_loop);
        inner.restart_poller();

        let maintain = inner.options.borrow().maintain_connection;
        if maintain && inner.transport.connectable_device(&inner.address).is_some() {
            inner.spawn_connect();
        }
        info!(address = %inner.address, name = %inner.name, "tag session started");
    }

    /// Stop every task, cancel queued and running operations, close the
    /// link and hand back the connection slot.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.queue.close();
        inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = inner.tasks();
            [
                tasks.event_loop.take(),
                tasks.connect.take(),
                tasks.poller.take().map(|(handle, _)| handle),
                tasks.cooldown_timer.take(),
            ]
            .into_iter()
            .flatten()
            .collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    debug!(address = %inner.address, error = %e, "session task ended abnormally");
                }
            }
        }

        let mut link = inner.link.lock().await;
        inner.disconnect_locked(&mut link).await;
        info!(address = %inner.address, "tag session stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // ── Observation ──

    pub fn snapshot(&self) -> DeviceSnapshot {
        let mut snap = self.inner.state.borrow().clone();
        snap.queue_depth = self.inner.queue.depth();
        snap
    }

    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.inner.state.subscribe()
    }

    /// Current snapshot followed by every change.
    pub fn snapshot_stream(&self) -> impl Stream<Item = DeviceSnapshot> + Send + 'static {
        WatchStream::new(self.watch())
    }

    pub fn button_events(&self) -> broadcast::Receiver<ButtonEvent> {
        self.inner.buttons.subscribe()
    }

    /// Button presses; events missed by a slow consumer are skipped.
    pub fn button_stream(&self) -> impl Stream<Item = ButtonEvent> + Send + 'static {
        BroadcastStream::new(self.button_events()).filter_map(Result::ok)
    }

    // ── Options and presence ──

    pub fn options(&self) -> SessionOptions {
        self.inner.options.borrow().clone()
    }

    /// Apply new user policy.
    pub async fn update_options(&self, options: SessionOptions) {
        let inner = &self.inner;
        let previous = inner.options.send_replace(options.clone());
        debug!(address = %inner.address, ?options, "session options updated");

        if options.maintain_connection {
            if previous.alarm_on_disconnect != options.alarm_on_disconnect {
                if let Err(e) = self
                    .set_disconnect_alarm_policy(options.alarm_on_disconnect, false)
                    .await
                {
                    debug!(address = %inner.address, error = %e, "policy resync failed");
                }
            }
            inner.spawn_connect();
        } else {
            self.disconnect().await;
            if let Err(e) = self
                .set_disconnect_alarm_policy(options.alarm_on_disconnect, true)
                .await
            {
                debug!(address = %inner.address, error = %e, "policy sync over short connect failed");
            }
        }

        inner.restart_poller();
    }

    /// The transport heard an advertisement from this tag.
    pub fn on_advertisement(&self, rssi: i16, seen_at: DateTime<Utc>) {
        let inner = &self.inner;
        inner.presence.record_advertisement(rssi, seen_at);
        let maintain = inner.options.borrow().maintain_connection;
        let connected = inner.state.borrow().connected;
        if maintain && !connected {
            inner.spawn_connect();
        }
    }

    /// The transport stopped hearing this tag.
    pub fn on_presence_lost(&self) {
        let inner = &self.inner;
        inner.presence.mark_lost();
        let auto_reconnect = inner.options.borrow().auto_reconnect;
        let connected = inner.state.borrow().connected;
        if connected && auto_reconnect {
            inner.spawn_connect();
        }
    }

    // ── Connection ──

    pub async fn ensure_connected(&self, purpose: ConnectPurpose) -> Result<(), SessionError> {
        self.inner.ensure_connected(purpose).await
    }

    /// Close the link and drop any background connect still waiting
    /// to run. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let mut link = self.inner.link.lock().await;
        self.inner.cancel_pending_connect();
        self.inner.disconnect_locked(&mut link).await;
    }

    // ── Commands ──

    pub async fn start_alarm(&self) -> Result<(), SessionError> {
        self.alert(OperationKind::StartAlarm, ALERT_RING).await
    }

    pub async fn stop_alarm(&self) -> Result<(), SessionError> {
        self.alert(OperationKind::StopAlarm, ALERT_SILENCE).await
    }

    async fn alert(&self, kind: OperationKind, level: u8) -> Result<(), SessionError> {
        let inner = Arc::clone(&self.inner);
        let action: OperationAction = Box::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner
                    .write_alert(level)
                    .await
                    .map(|()| OperationOutput::Done)
            })
        });
        self.inner.queue.run(kind, action).await.map(|_| ())
    }

    /// Store the disconnect-alarm policy and push it to the tag.
    ///
    /// With no open link the value is written on the next connect,
    /// unless `force_connect` asks for a connection now.
    pub async fn set_disconnect_alarm_policy(
        &self,
        enabled: bool,
        force_connect: bool,
    ) -> Result<(), SessionError> {
        self.inner.options.send_if_modified(|options| {
            let changed = options.alarm_on_disconnect != enabled;
            options.alarm_on_disconnect = enabled;
            changed
        });

        let inner = Arc::clone(&self.inner);
        let action: OperationAction = Box::new(move || {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner
                    .sync_policy(enabled, force_connect)
                    .await
                    .map(|()| OperationOutput::Done)
            })
        });
        self.inner
            .queue
            .run(OperationKind::SyncPolicy, action)
            .await
            .map(|_| ())
    }

    /// Read the battery level.
    ///
    /// Returns `Ok(None)` when no fresh reading was taken: not connected
    /// and not forced, or another background read already outstanding.
    pub async fn read_battery(&self, force_connect: bool) -> Result<Option<u8>, SessionError> {
        self.inner.read_battery(force_connect).await
    }

    // ── Inspection ──

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let inner = &self.inner;
        let snap = self.snapshot();
        let (poller_running, connect_task_running) = {
            let tasks = inner.tasks();
            (
                is_running(tasks.poller.as_ref().map(|(handle, _)| handle)),
                is_running(tasks.connect.as_ref()),
            )
        };
        let counters = lock(&inner.counters);

        SessionDiagnostics {
            address: inner.address.redacted(),
            name: inner.name.clone(),
            options: self.options(),
            connection_state: snap.connection_state,
            connect_fail_count: snap.connect_fail_count,
            cooldown_active: snap.cooldown_remaining().is_some(),
            slot_held: snap.conn_slot_held,
            cached_handles: snap.cached_handles,
            queue_depth: snap.queue_depth,
            worker_running: inner.queue.is_worker_running(),
            poller_running,
            connect_task_running,
            battery_read_busy: inner.battery_gate.try_lock().is_err(),
            battery_defer_count: counters.battery_defer_count,
            last_poll_sleep_secs: counters
                .last_poll_sleep
                .map(|(delay, _)| delay.as_secs_f64()),
            last_poll_reason: counters.last_poll_sleep.map(|(_, reason)| reason),
            adaptive_mode: counters.adaptive_mode,
            adaptive_timeout_ratio: counters.adaptive_timeout_ratio,
            last_operation_error: inner.queue.last_error(),
            unavailable_episodes: counters.unavailable_episodes,
            recoveries: counters.recoveries,
        }
    }
}
