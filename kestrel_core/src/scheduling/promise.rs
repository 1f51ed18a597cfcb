use crate::config::KernelConfig;
use crate::core::payload::Payload;
use crate::error::{KernelError, KernelResult};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const LOG_TARGET: &str = "kestrel::promise";

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

pub type PromiseId = u64;

/// Callback receiving the result or error payload
pub type PromiseCallback = Box<dyn FnOnce(Payload) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

impl PromiseState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PromiseState::Resolved,
            2 => PromiseState::Rejected,
            _ => PromiseState::Pending,
        }
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Pending => write!(f, "PENDING"),
            PromiseState::Resolved => write!(f, "RESOLVED"),
            PromiseState::Rejected => write!(f, "REJECTED"),
        }
    }
}

struct PromiseSlot {
    on_ok: Option<PromiseCallback>,
    on_err: Option<PromiseCallback>,
    outcome: Option<Payload>,
}

impl PromiseSlot {
    fn clear(&mut self) {
        self.on_ok = None;
        self.on_err = None;
        self.outcome = None;
    }
}

/// State lives outside the slot lock so it can be read from inside a callback
struct PromiseCell {
    id: PromiseId,
    state: AtomicU8,
    slot: Mutex<PromiseSlot>,
}

impl PromiseCell {
    fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Handle to a promise created by a [`PromiseManager`]
///
/// Cloning the handle does not clone the promise. Once the callback has run
/// the handle only reports the terminal state; resolving it again fails.
#[derive(Clone)]
pub struct Promise {
    cell: Arc<PromiseCell>,
    manager: u64,
}

impl Promise {
    pub fn id(&self) -> PromiseId {
        self.cell.id
    }

    pub fn state(&self) -> PromiseState {
        self.cell.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}

enum ExecMessage {
    Settled(Arc<PromiseCell>),
    Shutdown,
}

type Registry = Mutex<HashMap<PromiseId, Arc<PromiseCell>>>;

/// Delivers one asynchronous result per promise off the producer's stack
///
/// `resolve`/`reject` only record the outcome and queue the promise. A single
/// dedicated thread then takes the callback and outcome out under the
/// promise's lock, runs the callback with no lock held, and retires the
/// promise. Each promise gets at most one callback invocation.
pub struct PromiseManager {
    id: u64,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    sender: Sender<ExecMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    lock_timeout: Duration,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl PromiseManager {
    /// Spawn the callback thread
    pub fn start(config: &KernelConfig) -> KernelResult<Self> {
        let (sender, receiver) = channel::bounded(config.promise_queue_capacity);
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));

        let worker = {
            let registry = registry.clone();
            thread::Builder::new()
                .name("kestrel-promise".to_string())
                .spawn(move || exec_loop(receiver, registry))
                .map_err(|e| {
                    KernelError::failed(format!("failed to spawn promise thread: {}", e))
                })?
        };
        let worker_id = worker.thread().id();

        Ok(Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            next_id: AtomicU64::new(1),
            sender,
            worker: Mutex::new(Some(worker)),
            worker_id,
            lock_timeout: config.lock_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            stopped: AtomicBool::new(false),
        })
    }

    fn lock_registry(&self) -> KernelResult<MutexGuard<'_, HashMap<PromiseId, Arc<PromiseCell>>>> {
        self.registry
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout("promise registry lock"))
    }

    /// New pending promise without callbacks; attach them with [`then`](Self::then)
    pub fn create(&self) -> KernelResult<Promise> {
        self.register(None, None)
    }

    /// New pending promise with success and error callbacks
    pub fn create_with<F, E>(&self, on_ok: F, on_err: E) -> KernelResult<Promise>
    where
        F: FnOnce(Payload) + Send + 'static,
        E: FnOnce(Payload) + Send + 'static,
    {
        self.register(Some(Box::new(on_ok)), Some(Box::new(on_err)))
    }

    fn register(
        &self,
        on_ok: Option<PromiseCallback>,
        on_err: Option<PromiseCallback>,
    ) -> KernelResult<Promise> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(KernelError::invalid_state("promise manager stopped"));
        }

        let cell = Arc::new(PromiseCell {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(PromiseState::Pending as u8),
            slot: Mutex::new(PromiseSlot {
                on_ok,
                on_err,
                outcome: None,
            }),
        });
        self.lock_registry()?.insert(cell.id, cell.clone());

        log::trace!(target: LOG_TARGET, "promise {} created", cell.id);
        Ok(Promise {
            cell,
            manager: self.id,
        })
    }

    /// Attach callbacks to a promise that is still pending
    pub fn then<F, E>(&self, promise: &Promise, on_ok: F, on_err: E) -> KernelResult<()>
    where
        F: FnOnce(Payload) + Send + 'static,
        E: FnOnce(Payload) + Send + 'static,
    {
        self.check_owner(promise)?;
        let mut slot = self.lock_slot(promise)?;
        let state = promise.cell.state();
        if state != PromiseState::Pending {
            return Err(KernelError::invalid_state(format!(
                "promise {} is already {}",
                promise.id(),
                state
            )));
        }
        slot.on_ok = Some(Box::new(on_ok));
        slot.on_err = Some(Box::new(on_err));
        Ok(())
    }

    /// Settle `promise` successfully with `data`
    ///
    /// On any error `data` is released before returning. `Failed` means the
    /// execution queue was full: the promise has been torn down and its
    /// callback will never run.
    pub fn resolve(&self, promise: &Promise, data: Payload) -> KernelResult<()> {
        self.settle(promise, data, PromiseState::Resolved)
    }

    /// Settle `promise` with an error payload; same contract as [`resolve`](Self::resolve)
    pub fn reject(&self, promise: &Promise, data: Payload) -> KernelResult<()> {
        self.settle(promise, data, PromiseState::Rejected)
    }

    fn settle(&self, promise: &Promise, data: Payload, state: PromiseState) -> KernelResult<()> {
        self.check_owner(promise)?;

        {
            let mut slot = self.lock_slot(promise)?;
            let current = promise.cell.state();
            if current != PromiseState::Pending {
                return Err(KernelError::invalid_state(format!(
                    "promise {} is already {}",
                    promise.id(),
                    current
                )));
            }
            if !self.lock_registry()?.contains_key(&promise.id()) {
                return Err(KernelError::invalid_argument(format!(
                    "unknown promise {}",
                    promise.id()
                )));
            }
            promise.cell.state.store(state as u8, Ordering::Release);
            slot.outcome = Some(data);
        }

        match self.sender.try_send(ExecMessage::Settled(promise.cell.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.teardown(promise);
                log::warn!(
                    target: LOG_TARGET,
                    "execution queue full, promise {} torn down without callback",
                    promise.id()
                );
                Err(KernelError::failed(format!(
                    "promise execution queue full, promise {} discarded",
                    promise.id()
                )))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.teardown(promise);
                Err(KernelError::invalid_state("promise thread is gone"))
            }
        }
    }

    fn teardown(&self, promise: &Promise) {
        match self.lock_registry() {
            Ok(mut registry) => {
                registry.remove(&promise.id());
            }
            Err(e) => log::warn!(target: LOG_TARGET, "promise {} not unregistered: {}", promise.id(), e),
        }
        // The outcome is dropped, and its releaser run, once the slot is cleared.
        match self.lock_slot(promise) {
            Ok(mut slot) => slot.clear(),
            Err(e) => log::warn!(target: LOG_TARGET, "promise {} not cleared: {}", promise.id(), e),
        }
    }

    fn check_owner(&self, promise: &Promise) -> KernelResult<()> {
        if promise.manager != self.id {
            return Err(KernelError::invalid_argument(format!(
                "promise {} belongs to another manager",
                promise.id()
            )));
        }
        Ok(())
    }

    fn lock_slot<'a>(&self, promise: &'a Promise) -> KernelResult<MutexGuard<'a, PromiseSlot>> {
        promise
            .cell
            .slot
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout(format!("promise {} lock", promise.id())))
    }

    /// Promises created but not yet retired
    pub fn pending(&self) -> KernelResult<usize> {
        Ok(self.lock_registry()?.len())
    }

    /// Run the callbacks already queued, then tear down every live promise
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.sender.send_timeout(ExecMessage::Shutdown, self.shutdown_timeout) {
            Ok(()) => {
                if thread::current().id() != self.worker_id {
                    if let Some(worker) = self.worker.lock().take() {
                        if worker.join().is_err() {
                            log::error!(target: LOG_TARGET, "promise thread panicked");
                        }
                    }
                }
            }
            Err(e) => {
                drop(e.into_inner());
                log::warn!(target: LOG_TARGET, "promise thread did not accept shutdown, detaching");
            }
        }

        let live: Vec<Arc<PromiseCell>> = match self.lock_registry() {
            Ok(mut registry) => registry.drain().map(|(_, c)| c).collect(),
            Err(e) => {
                log::warn!(target: LOG_TARGET, "unsettled promises not discarded: {}", e);
                return;
            }
        };
        if !live.is_empty() {
            log::debug!(target: LOG_TARGET, "discarding {} unsettled promises", live.len());
        }
        for cell in live {
            match cell.slot.try_lock_for(self.lock_timeout) {
                Some(mut slot) => slot.clear(),
                None => log::warn!(target: LOG_TARGET, "promise {} lock timed out", cell.id),
            }
        }
    }
}

impl Drop for PromiseManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn exec_loop(receiver: Receiver<ExecMessage>, registry: Arc<Registry>) {
    while let Ok(message) = receiver.recv() {
        match message {
            ExecMessage::Settled(cell) => execute(&cell, &registry),
            ExecMessage::Shutdown => break,
        }
    }
}

fn execute(cell: &PromiseCell, registry: &Registry) {
    // Taken as one snapshot; the slot lock is not held while the callback runs.
    let (callback, outcome) = {
        let mut slot = cell.slot.lock();
        let callback = match cell.state() {
            PromiseState::Resolved => slot.on_ok.take(),
            PromiseState::Rejected => slot.on_err.take(),
            PromiseState::Pending => None,
        };
        let outcome = slot.outcome.take();
        slot.clear();
        (callback, outcome)
    };

    match (callback, outcome) {
        (Some(callback), Some(outcome)) => {
            let result = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome)));
            if result.is_err() {
                log::error!(target: LOG_TARGET, "callback of promise {} panicked", cell.id);
            }
        }
        (None, Some(_)) => {
            log::debug!(target: LOG_TARGET, "promise {} settled without a callback", cell.id);
        }
        _ => {}
    }

    registry.lock().remove(&cell.id);
    log::trace!(target: LOG_TARGET, "promise {} retired", cell.id);
}
