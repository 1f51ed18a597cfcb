use crate::config::KernelConfig;
use crate::core::module::ModuleHandle;
use crate::core::payload::Payload;
use crate::error::{KernelError, KernelResult};
use crate::events::WILDCARD;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const LOG_TARGET: &str = "kestrel::event_bus";

type SubscriptionMap = HashMap<String, Vec<ModuleHandle>>;

enum BusMessage {
    Event {
        name: String,
        payload: Option<Payload>,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Lock-free counters for bus monitoring
#[derive(Debug, Default)]
struct AtomicBusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_panics: AtomicU64,
}

impl AtomicBusMetrics {
    fn snapshot(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetrics {
    /// Messages accepted onto the queue
    pub published: u64,
    /// Handler invocations
    pub delivered: u64,
    /// Publishes rejected because the queue was full
    pub dropped: u64,
    pub handler_panics: u64,
}

/// Asynchronous publish/subscribe bus for named events
///
/// Publishing never blocks: the message goes onto a bounded queue drained by
/// a single dispatch thread, so events are delivered in publish order. For
/// each message the dispatcher snapshots the exact-name subscribers and the
/// wildcard subscribers, drops the registry lock, then calls the handlers:
/// exact-name subscribers first in subscription order, then wildcard
/// subscribers that were not already notified.
pub struct EventBus {
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    sender: Sender<BusMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    metrics: Arc<AtomicBusMetrics>,
    max_subscribers: usize,
    lock_timeout: Duration,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl EventBus {
    /// Create the bus and spawn its dispatch thread
    pub fn start(config: &KernelConfig) -> KernelResult<Self> {
        let (sender, receiver) = channel::bounded(config.event_queue_capacity);
        let subscriptions = Arc::new(Mutex::new(SubscriptionMap::new()));
        let metrics = Arc::new(AtomicBusMetrics::default());

        let worker = {
            let subscriptions = subscriptions.clone();
            let metrics = metrics.clone();
            thread::Builder::new()
                .name("kestrel-event-bus".to_string())
                .spawn(move || dispatch_loop(receiver, subscriptions, metrics))
                .map_err(|e| {
                    KernelError::failed(format!("failed to spawn event bus thread: {}", e))
                })?
        };
        let worker_id = worker.thread().id();

        log::debug!(
            target: LOG_TARGET,
            "event bus started (queue {}, {} subscribers per event)",
            config.event_queue_capacity,
            config.max_subscribers_per_event
        );

        Ok(Self {
            subscriptions,
            sender,
            worker: Mutex::new(Some(worker)),
            worker_id,
            metrics,
            max_subscribers: config.max_subscribers_per_event,
            lock_timeout: config.lock_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            stopped: AtomicBool::new(false),
        })
    }

    fn lock_subscriptions(&self) -> KernelResult<parking_lot::MutexGuard<'_, SubscriptionMap>> {
        self.subscriptions
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout("event bus subscription lock"))
    }

    /// Subscribe `module` to `event`; subscribing twice is a no-op
    pub fn subscribe(&self, event: &str, module: &ModuleHandle) -> KernelResult<()> {
        if event.is_empty() {
            return Err(KernelError::invalid_argument("empty event name"));
        }

        let mut subscriptions = self.lock_subscriptions()?;
        let subscribers = subscriptions.entry(event.to_string()).or_default();
        if subscribers.iter().any(|s| s.ptr_eq(module)) {
            return Ok(());
        }
        if subscribers.len() >= self.max_subscribers {
            return Err(KernelError::NoMemory(format!(
                "event '{}' already has {} subscribers",
                event, self.max_subscribers
            )));
        }
        subscribers.push(module.clone());

        log::debug!(target: LOG_TARGET, "'{}' subscribed to '{}'", module.name(), event);
        Ok(())
    }

    pub fn unsubscribe(&self, event: &str, module: &ModuleHandle) -> KernelResult<()> {
        let mut subscriptions = self.lock_subscriptions()?;
        let subscribers = subscriptions.get_mut(event).ok_or_else(|| {
            KernelError::not_found(format!("no subscribers for event '{}'", event))
        })?;
        let index = subscribers
            .iter()
            .position(|s| s.ptr_eq(module))
            .ok_or_else(|| {
                KernelError::not_found(format!(
                    "'{}' is not subscribed to '{}'",
                    module.name(),
                    event
                ))
            })?;

        subscribers.remove(index);
        if subscribers.is_empty() {
            subscriptions.remove(event);
        }
        Ok(())
    }

    /// Drop every subscription held by `module`, returning how many there were
    pub fn unsubscribe_all(&self, module: &ModuleHandle) -> KernelResult<usize> {
        let mut subscriptions = self.lock_subscriptions()?;
        let mut removed = 0;
        subscriptions.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| !s.ptr_eq(module));
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        Ok(removed)
    }

    /// Remove every subscription
    pub fn clear(&self) -> KernelResult<()> {
        self.lock_subscriptions()?.clear();
        Ok(())
    }

    /// Queue `event` for delivery
    ///
    /// The bus takes its own reference on `payload`; the caller keeps and
    /// later releases theirs. On a full queue the bus reference is given back
    /// and the caller gets an error.
    pub fn publish(&self, event: &str, payload: Option<&Payload>) -> KernelResult<()> {
        if event.is_empty() {
            return Err(KernelError::invalid_argument("empty event name"));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(KernelError::invalid_state("event bus stopped"));
        }

        let payload = payload.map(Payload::acquire).transpose()?;
        let message = BusMessage::Event {
            name: event.to_string(),
            payload,
        };

        match self.sender.try_send(message) {
            Ok(()) => {
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(message)) => {
                drop(message);
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: LOG_TARGET, "event queue full, '{}' not published", event);
                Err(KernelError::failed(format!("event queue full, '{}' not published", event)))
            }
            Err(TrySendError::Disconnected(message)) => {
                drop(message);
                Err(KernelError::invalid_state("event bus dispatcher is gone"))
            }
        }
    }

    pub fn subscriber_count(&self, event: &str) -> KernelResult<usize> {
        Ok(self
            .lock_subscriptions()?
            .get(event)
            .map(Vec::len)
            .unwrap_or(0))
    }

    pub fn is_subscribed(&self, event: &str, module: &ModuleHandle) -> KernelResult<bool> {
        Ok(self
            .lock_subscriptions()?
            .get(event)
            .is_some_and(|subs| subs.iter().any(|s| s.ptr_eq(module))))
    }

    /// Messages waiting for the dispatcher
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    pub fn metrics(&self) -> BusMetrics {
        self.metrics.snapshot()
    }

    /// Wait until every event published before this call has been delivered
    ///
    /// Fails `InvalidState` when called from a handler, since the dispatcher
    /// would be waiting on itself.
    pub fn flush(&self, timeout: Duration) -> KernelResult<()> {
        if thread::current().id() == self.worker_id {
            return Err(KernelError::invalid_state("flush from the dispatch thread"));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(KernelError::invalid_state("event bus stopped"));
        }

        let (done_tx, done_rx) = channel::bounded(1);
        self.sender
            .send_timeout(BusMessage::Flush(done_tx), timeout)
            .map_err(|_| KernelError::timeout("event queue flush"))?;
        done_rx
            .recv_timeout(timeout)
            .map_err(|_| KernelError::timeout("event queue flush"))
    }

    /// Stop accepting events, deliver what is already queued, join the
    /// dispatcher
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.sender.send_timeout(BusMessage::Shutdown, self.shutdown_timeout) {
            drop(e.into_inner());
            log::warn!(target: LOG_TARGET, "event bus did not accept shutdown, detaching dispatcher");
            return;
        }

        // A handler may trigger shutdown from the dispatch thread itself.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!(target: LOG_TARGET, "event bus dispatcher panicked");
            }
        }
        log::debug!(target: LOG_TARGET, "event bus stopped");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(
    receiver: Receiver<BusMessage>,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    metrics: Arc<AtomicBusMetrics>,
) {
    while let Ok(message) = receiver.recv() {
        match message {
            BusMessage::Event { name, payload } => {
                dispatch(&name, payload, &subscriptions, &metrics);
            }
            BusMessage::Flush(done) => {
                let _ = done.send(());
            }
            BusMessage::Shutdown => break,
        }
    }
}

fn dispatch(
    name: &str,
    payload: Option<Payload>,
    subscriptions: &Mutex<SubscriptionMap>,
    metrics: &AtomicBusMetrics,
) {
    let (exact, wildcard) = {
        let subscriptions = subscriptions.lock();
        let exact = subscriptions.get(name).cloned().unwrap_or_default();
        let wildcard = subscriptions.get(WILDCARD).cloned().unwrap_or_default();
        (exact, wildcard)
    };

    for module in &exact {
        deliver(module, name, payload.as_ref(), metrics);
    }
    for module in wildcard.iter().filter(|w| !exact.iter().any(|e| e.ptr_eq(w))) {
        deliver(module, name, payload.as_ref(), metrics);
    }

    // Dispatcher's own reference.
    drop(payload);
}

fn deliver(module: &ModuleHandle, name: &str, payload: Option<&Payload>, metrics: &AtomicBusMetrics) {
    let reference = match payload.map(Payload::acquire).transpose() {
        Ok(reference) => reference,
        Err(e) => {
            log::error!(target: LOG_TARGET, "cannot deliver '{}' to '{}': {}", name, module.name(), e);
            return;
        }
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        module.module().handle_event(name, reference);
    }));
    metrics.delivered.fetch_add(1, Ordering::Relaxed);

    if result.is_err() {
        metrics.handler_panics.fetch_add(1, Ordering::Relaxed);
        log::error!(target: LOG_TARGET, "handler of '{}' panicked on '{}'", module.name(), name);
    }
}
