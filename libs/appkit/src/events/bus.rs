use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use appkit_bootstrap::EventBusConfig;

use super::{Event, EventBusError, EventHandler, HandlerError, HandlerFailure};

type SubscriptionTable = HashMap<String, Vec<Arc<dyn EventHandler>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl BusState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Result of one synchronous delivery.
#[derive(Debug)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub event_type: String,
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    pub failed: Vec<HandlerError>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStopOutcome {
    /// Queue drained and every in-flight delivery finished in time.
    Drained,
    /// Deadline hit; `abandoned` deliveries were cancelled or left behind.
    TimedOut { abandoned: usize },
    /// The bus was never started; buffered events were discarded.
    NeverStarted { discarded: usize },
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct BusInner {
    config: EventBusConfig,
    subscriptions: ArcSwap<SubscriptionTable>,
    write_lock: Mutex<()>,
    queue_tx: mpsc::Sender<Event>,
    queue_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    state: AtomicU8,
    /// Stop accepting and drain what is buffered.
    closing: CancellationToken,
    /// Give up on everything still running; handlers see this token.
    abandon: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Accepted by `publish_async` but not yet fully delivered.
    pending: AtomicUsize,
    counters: Counters,
}

/// Process-wide publish/subscribe keyed by event type.
///
/// Subscriptions are read lock-free from an `ArcSwap` snapshot; writers are
/// serialized. Asynchronous deliveries go through a bounded queue drained by
/// at most `workers` concurrent tasks once [`start`](Self::start) is called.
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &self.state())
            .field("event_types", &self.event_types())
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: ArcSwap::from_pointee(SubscriptionTable::new()),
                write_lock: Mutex::new(()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                state: AtomicU8::new(BusState::Created.as_u8()),
                closing: CancellationToken::new(),
                abandon: CancellationToken::new(),
                tracker: TaskTracker::new(),
                dispatcher: Mutex::new(None),
                pending: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn state(&self) -> BusState {
        BusState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            pending: self.inner.pending.load(Ordering::SeqCst),
        }
    }

    /// Subscribe `handler` to one of the types it declares.
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError> {
        if !handler.handles(event_type) {
            return Err(EventBusError::UndeclaredType {
                handler: handler.name().to_string(),
                event_type: event_type.to_string(),
            });
        }

        let _guard = self.inner.write_lock.lock();
        let mut next = SubscriptionTable::clone(&self.inner.subscriptions.load());
        let list = next.entry(event_type.to_string()).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            debug!(handler = handler.name(), event_type, "Handler already subscribed");
            return Ok(());
        }
        list.push(handler.clone());
        self.inner.subscriptions.store(Arc::new(next));

        debug!(handler = handler.name(), event_type, "Handler subscribed");
        Ok(())
    }

    /// Subscribe `handler` to every type it declares; returns how many.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Result<usize, EventBusError> {
        let types = handler.event_types().to_vec();
        if types.is_empty() {
            warn!(handler = handler.name(), "Handler declares no event types");
        }
        for event_type in &types {
            self.subscribe(event_type, handler.clone())?;
        }
        Ok(types.len())
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscriptions
            .load()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Event types with at least one subscriber, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.subscriptions.load().keys().cloned().collect();
        types.sort();
        types
    }

    /// Deliver inline to every subscriber of the event's type and wait for all.
    ///
    /// Handler errors and panics are isolated and reported, never propagated.
    pub async fn publish(&self, event: Event) -> Result<PublishReport, EventBusError> {
        if matches!(self.state(), BusState::Stopping | BusState::Stopped) {
            warn!(event_type = event.event_type(), "Publish rejected, event bus is stopped");
            return Err(EventBusError::Stopped);
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.deliver(&event).await)
    }

    /// Enqueue for background delivery and return immediately.
    ///
    /// Before `start` events are buffered; a full queue drops the event.
    pub fn publish_async(&self, event: Event) -> Result<(), EventBusError> {
        if matches!(self.state(), BusState::Stopping | BusState::Stopped) {
            warn!(event_type = event.event_type(), "Async publish rejected, event bus is stopped");
            return Err(EventBusError::Stopped);
        }

        let event_type = event.event_type().to_string();
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        match self.inner.queue_tx.try_send(event) {
            Ok(()) => {
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let capacity = self.inner.config.queue_capacity.max(1);
                warn!(event_type = %event_type, capacity, "Event queue full, dropping event");
                Err(EventBusError::QueueFull {
                    event_type,
                    capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                warn!(event_type = %event_type, "Async publish rejected, event queue closed");
                Err(EventBusError::Stopped)
            }
        }
    }

    /// Spawns the dispatcher. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), EventBusError> {
        match self.inner.state.compare_exchange(
            BusState::Created.as_u8(),
            BusState::Running.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) if BusState::from_u8(current) == BusState::Running => {
                debug!("Event bus already running");
                return Ok(());
            }
            Err(_) => return Err(EventBusError::Stopped),
        }

        let Some(rx) = self.inner.queue_rx.lock().take() else {
            return Err(EventBusError::Stopped);
        };
        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), rx));
        *self.inner.dispatcher.lock() = Some(handle);

        info!(
            workers = self.inner.config.workers.max(1),
            queue_capacity = self.inner.config.queue_capacity.max(1),
            "Event bus started"
        );
        Ok(())
    }

    /// Stop accepting events, drain the queue and wait for in-flight
    /// deliveries up to `timeout`, then cancel whatever is left.
    pub async fn stop(&self, timeout: Duration) -> BusStopOutcome {
        let previous = loop {
            let current = self.inner.state.load(Ordering::SeqCst);
            if matches!(
                BusState::from_u8(current),
                BusState::Stopping | BusState::Stopped
            ) {
                debug!("Event bus already stopped");
                return BusStopOutcome::AlreadyStopped;
            }
            if self
                .inner
                .state
                .compare_exchange(
                    current,
                    BusState::Stopping.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break BusState::from_u8(current);
            }
        };

        self.inner.closing.cancel();

        if previous == BusState::Created {
            let discarded = match self.inner.queue_rx.lock().take() {
                Some(mut rx) => {
                    rx.close();
                    let mut n = 0;
                    while rx.try_recv().is_ok() {
                        n += 1;
                    }
                    n
                }
                None => 0,
            };
            self.inner.pending.store(0, Ordering::SeqCst);
            self.inner.tracker.close();
            self.set_state(BusState::Stopped);
            if discarded > 0 {
                warn!(discarded, "Event bus stopped before start, buffered events discarded");
            }
            return BusStopOutcome::NeverStarted { discarded };
        }

        let dispatcher = self.inner.dispatcher.lock().take();
        let tracker = self.inner.tracker.clone();
        let drained = tokio::time::timeout(timeout, async move {
            if let Some(handle) = dispatcher {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Event dispatcher task failed");
                }
            }
            tracker.close();
            tracker.wait().await;
        })
        .await;

        let outcome = match drained {
            Ok(()) => {
                info!("Event bus stopped, queue drained");
                BusStopOutcome::Drained
            }
            Err(_) => {
                let abandoned = self.inner.pending.load(Ordering::SeqCst);
                self.inner.abandon.cancel();
                self.inner.tracker.close();
                warn!(
                    abandoned,
                    timeout = ?timeout,
                    "Event bus stop timed out, abandoning deliveries"
                );
                BusStopOutcome::TimedOut { abandoned }
            }
        };
        self.set_state(BusState::Stopped);
        outcome
    }

    fn set_state(&self, state: BusState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, mut rx: mpsc::Receiver<Event>) {
    let workers = Arc::new(Semaphore::new(inner.config.workers.max(1)));
    let mut closed = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = inner.abandon.cancelled() => break,
            _ = inner.closing.cancelled(), if !closed => {
                // buffered events are still handed out by recv()
                rx.close();
                closed = true;
                continue;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = inner.abandon.cancelled() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task_inner = inner.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            task_inner.deliver(&event).await;
            task_inner.pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
    debug!("Event dispatcher exited");
}

impl BusInner {
    async fn deliver(&self, event: &Event) -> PublishReport {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscriptions
            .load()
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport {
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            delivered: 0,
            failed: Vec::new(),
        };
        if handlers.is_empty() {
            debug!(event_type = event.event_type(), event_id = %event.id(), "No subscribers for event");
            return report;
        }

        let outcomes = join_all(handlers.iter().map(|h| self.invoke(h.as_ref(), event))).await;

        for (handler, outcome) in handlers.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(
                        handler = handler.name(),
                        event_type = event.event_type(),
                        event_id = %event.id(),
                        error = %failure,
                        "Event handler failed"
                    );
                    report.failed.push(HandlerError {
                        handler: handler.name().to_string(),
                        event_type: event.event_type().to_string(),
                        failure,
                    });
                }
            }
        }

        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        report
    }

    async fn invoke(&self, handler: &dyn EventHandler, event: &Event) -> Result<(), HandlerFailure> {
        let call = AssertUnwindSafe(handler.handle(&self.abandon, event)).catch_unwind();
        let outcome = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerFailure::TimedOut(limit)),
            },
            None => call.await,
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HandlerFailure::Error(e)),
            Err(panic) => Err(HandlerFailure::Panicked(panic_message(&*panic))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
