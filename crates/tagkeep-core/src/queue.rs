// ── Operation queue ──
//
// Every GATT command for one tag goes through a priority queue drained
// by a single worker task, so at most one command touches the link at
// a time. Lower priority values run first; equal priorities run in
// submission order. Transient failures are retried with exponential
// delay. Closing the queue resolves everything pending as cancelled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::model::TagAddress;

// ── Operation kinds ──────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    StartAlarm,
    StopAlarm,
    SyncPolicy,
    ReadBattery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl OperationKind {
    pub const fn priority(self) -> u8 {
        match self {
            Self::StartAlarm | Self::StopAlarm => 10,
            Self::SyncPolicy => 20,
            Self::ReadBattery => 50,
        }
    }

    pub const fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::StartAlarm | Self::StopAlarm => RetryPolicy {
                retries: 1,
                base_delay: Duration::from_millis(600),
            },
            Self::SyncPolicy => RetryPolicy {
                retries: 1,
                base_delay: Duration::from_millis(800),
            },
            Self::ReadBattery => RetryPolicy {
                retries: 1,
                base_delay: Duration::from_millis(1200),
            },
        }
    }

    pub const fn is_alarm(self) -> bool {
        matches!(self, Self::StartAlarm | Self::StopAlarm)
    }
}

// ── Queue entries ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutput {
    Done,
    Battery(Option<u8>),
}

/// Re-invocable body of an operation; each call is one attempt.
pub type OperationAction =
    Box<dyn FnMut() -> BoxFuture<'static, Result<OperationOutput, SessionError>> + Send>;

type Reply = oneshot::Sender<Result<OperationOutput, SessionError>>;

struct PendingOperation {
    kind: OperationKind,
    priority: u8,
    sequence: u64,
    retry: RetryPolicy,
    action: OperationAction,
    reply: Reply,
}

impl PendingOperation {
    fn cancel(self) {
        let _ = self.reply.send(Err(SessionError::Cancelled));
    }
}

// BinaryHeap is a max-heap: the entry that should run first compares greatest.
impl Ord for PendingOperation {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PendingOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingOperation {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PendingOperation {}

/// Awaitable result of a submitted operation.
pub struct OperationTicket {
    rx: oneshot::Receiver<Result<OperationOutput, SessionError>>,
}

impl OperationTicket {
    pub async fn wait(self) -> Result<OperationOutput, SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::Cancelled))
    }
}

// ── Queue ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    address: TagAddress,
    pending: Mutex<Pending>,
    wake: Notify,
    sequence: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_alarm_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<PendingOperation>,
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OperationQueue {
    pub fn new(address: TagAddress, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                address,
                pending: Mutex::new(Pending::default()),
                wake: Notify::new(),
                sequence: AtomicU64::new(0),
                cancel,
                worker: Mutex::new(None),
                last_alarm_at: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Queue `action` with the kind's default priority and retry policy.
    ///
    /// The worker task is started on first use, so this must be called
    /// from within a Tokio runtime.
    pub fn submit(&self, kind: OperationKind, action: OperationAction) -> OperationTicket {
        self.submit_with(kind, kind.priority(), kind.retry_policy(), action)
    }

    pub fn submit_with(
        &self,
        kind: OperationKind,
        priority: u8,
        retry: RetryPolicy,
        action: OperationAction,
    ) -> OperationTicket {
        let (reply, rx) = oneshot::channel();
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let op = PendingOperation {
            kind,
            priority,
            sequence,
            retry,
            action,
            reply,
        };

        {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                drop(pending);
                op.cancel();
                return OperationTicket { rx };
            }
            pending.heap.push(op);
        }

        self.ensure_worker();
        self.inner.wake.notify_one();
        OperationTicket { rx }
    }

    /// Submit and wait for the result.
    pub async fn run(
        &self,
        kind: OperationKind,
        action: OperationAction,
    ) -> Result<OperationOutput, SessionError> {
        self.submit(kind, action).wait().await
    }

    pub fn depth(&self) -> usize {
        lock(&self.inner.pending).heap.len()
    }

    pub fn is_worker_running(&self) -> bool {
        lock(&self.inner.worker)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// When the most recent alarm operation started executing.
    pub fn last_alarm_started(&self) -> Option<Instant> {
        *lock(&self.inner.last_alarm_at)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Stop accepting work, cancel the worker, and resolve every queued
    /// operation as cancelled.
    pub fn close(&self) {
        let drained: Vec<PendingOperation> = {
            let mut pending = lock(&self.inner.pending);
            pending.closed = true;
            pending.heap.drain().collect()
        };
        self.inner.cancel.cancel();
        if !drained.is_empty() {
            debug!(
                address = %self.inner.address,
                cancelled = drained.len(),
                "operation queue closed"
            );
        }
        for op in drained {
            op.cancel();
        }
    }

    fn ensure_worker(&self) {
        let mut worker = lock(&self.inner.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(worker_task(inner)));
    }
}

// ── Worker ───────────────────────────────────────────────────────────

async fn worker_task(inner: Arc<QueueInner>) {
    loop {
        let next = lock(&inner.pending).heap.pop();
        let Some(op) = next else {
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = inner.wake.notified() => {}
            }
            continue;
        };

        let kind = op.kind;
        let reply = op.reply;
        let mut action = op.action;
        let attempt = run_with_retries(&inner, kind, op.retry, &mut action);

        let result = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => {
                let _ = reply.send(Err(SessionError::Cancelled));
                break;
            }
            result = attempt => result,
        };
        let _ = reply.send(result);
    }
    debug!(address = %inner.address, "operation worker stopped");
}

async fn run_with_retries(
    inner: &QueueInner,
    kind: OperationKind,
    retry: RetryPolicy,
    action: &mut OperationAction,
) -> Result<OperationOutput, SessionError> {
    let mut attempt = 0;
    loop {
        if kind.is_alarm() {
            *lock(&inner.last_alarm_at) = Some(Instant::now());
        }
        match (*action)().await {
            Ok(output) => return Ok(output),
            Err(err) => {
                attempt += 1;
                *lock(&inner.last_error) = Some(format!("{kind}: {err}"));
                if attempt > retry.retries || !err.is_transient() {
                    if attempt > 1 {
                        warn!(address = %inner.address, %kind, error = %err, "operation failed after retry");
                    }
                    return Err(err);
                }
                let delay = retry.delay(attempt);
                debug!(
                    address = %inner.address,
                    %kind,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying operation"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::TransportError;

    fn queue() -> OperationQueue {
        OperationQueue::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), CancellationToken::new())
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> OperationAction {
        let log = Arc::clone(log);
        Box::new(move || {
            let log = Arc::clone(&log);
            Box::pin(async move {
                lock(&log).push(label);
                Ok(OperationOutput::Done)
            })
        })
    }

    fn gated(gate: &Arc<Notify>) -> OperationAction {
        let gate = Arc::clone(gate);
        Box::new(move || {
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                Ok(OperationOutput::Done)
            })
        })
    }

    #[tokio::test]
    async fn alarm_overtakes_earlier_battery_read() {
        let q = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let blocker = q.submit(OperationKind::SyncPolicy, gated(&gate));
        tokio::task::yield_now().await;

        let battery = q.submit(OperationKind::ReadBattery, recording(&log, "battery"));
        let alarm = q.submit(OperationKind::StartAlarm, recording(&log, "alarm"));
        assert_eq!(q.depth(), 2);

        gate.notify_one();
        blocker.wait().await.unwrap();
        alarm.wait().await.unwrap();
        battery.wait().await.unwrap();

        assert_eq!(*lock(&log), vec!["alarm", "battery"]);
    }

    #[tokio::test]
    async fn equal_priority_runs_fifo() {
        let q = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());

        let blocker = q.submit(OperationKind::StartAlarm, gated(&gate));
        tokio::task::yield_now().await;
        let first = q.submit(OperationKind::ReadBattery, recording(&log, "first"));
        let second = q.submit(OperationKind::ReadBattery, recording(&log, "second"));

        gate.notify_one();
        blocker.wait().await.unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(*lock(&log), vec!["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn operations_never_overlap() {
        let q = queue();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (0..16)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let kind = if i % 2 == 0 {
                    OperationKind::ReadBattery
                } else {
                    OperationKind::StopAlarm
                };
                q.submit(
                    kind,
                    Box::new(move || {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        Box::pin(async move {
                            let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                            peak.fetch_max(now, AtomicOrdering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            active.fetch_sub(1, AtomicOrdering::SeqCst);
                            Ok(OperationOutput::Done)
                        })
                    }),
                )
            })
            .collect();

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let result = q
            .run(
                OperationKind::ReadBattery,
                Box::new(move || {
                    let counter = Arc::clone(&counter);
                    Box::pin(async move {
                        if counter.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                            Err(SessionError::Gatt {
                                op: "read",
                                target: "handle 0x0030".into(),
                                source: TransportError::Timeout,
                            })
                        } else {
                            Ok(OperationOutput::Battery(Some(55)))
                        }
                    })
                }),
            )
            .await
            .unwrap();

        assert_eq!(result, OperationOutput::Battery(Some(55)));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(1200));
        assert!(q.last_error().unwrap().starts_with("read_battery:"));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let q = queue();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let err = q
            .run(
                OperationKind::StartAlarm,
                Box::new(move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    Box::pin(async {
                        Err(SessionError::Gatt {
                            op: "write",
                            target: "handle 0x0020".into(),
                            source: TransportError::Gatt("rejected".into()),
                        })
                    })
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Gatt { .. }), "got: {err:?}");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(q.last_alarm_started().is_some());
    }

    #[tokio::test]
    async fn close_cancels_in_flight_and_queued() {
        let q = queue();
        let never = Arc::new(Notify::new());

        let in_flight = q.submit(OperationKind::StartAlarm, gated(&never));
        tokio::task::yield_now().await;
        let queued_a = q.submit(OperationKind::ReadBattery, gated(&never));
        let queued_b = q.submit(OperationKind::SyncPolicy, gated(&never));

        q.close();

        for ticket in [in_flight, queued_a, queued_b] {
            assert!(matches!(ticket.wait().await, Err(SessionError::Cancelled)));
        }
        assert_eq!(q.depth(), 0);

        let late = q.submit(OperationKind::StopAlarm, gated(&never));
        assert!(matches!(late.wait().await, Err(SessionError::Cancelled)));
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = OperationKind::StartAlarm.retry_policy();
        assert_eq!(policy.delay(1), Duration::from_millis(600));
        assert_eq!(policy.delay(2), Duration::from_millis(1200));
        assert_eq!(policy.delay(3), Duration::from_millis(2400));
    }
}
