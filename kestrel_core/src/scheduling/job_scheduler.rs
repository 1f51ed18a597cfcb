use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const LOG_TARGET: &str = "kestrel::jobs";

pub type JobId = u64;

type JobFn = Box<dyn FnMut() + Send>;

/// Flags shared between a job and every handle to it
#[derive(Debug, Default)]
struct JobControl {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Handle returned by [`JobScheduler::schedule`]
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    control: Arc<JobControl>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.cancelled.load(Ordering::Acquire)
    }

    /// A one-shot job that ran, or any job that was cancelled or dropped
    pub fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct Job {
    id: JobId,
    callback: JobFn,
    interval: Duration,
    periodic: bool,
    due: Instant,
    control: Arc<JobControl>,
}

impl Job {
    fn finish(self) {
        self.control.finished.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct AtomicJobMetrics {
    executed: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    panics: AtomicU64,
}

impl AtomicJobMetrics {
    fn snapshot(&self) -> JobMetrics {
        JobMetrics {
            executed: self.executed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobMetrics {
    /// Callback invocations
    pub executed: u64,
    /// One-shot jobs thrown away because the ready queue was full
    pub dropped: u64,
    /// Jobs pulled from the ready queue after being cancelled
    pub skipped: u64,
    pub panics: u64,
}

struct Shared {
    scheduled: Mutex<HashMap<JobId, Job>>,
    stopped: AtomicBool,
    metrics: AtomicJobMetrics,
    lock_timeout: Duration,
}

impl Shared {
    fn lock_scheduled(&self) -> KernelResult<MutexGuard<'_, HashMap<JobId, Job>>> {
        self.scheduled
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout("scheduled job set lock"))
    }
}

/// Shared pool for periodic and one-shot background work
///
/// Jobs wait in a scheduled set until due. A ticker thread scans the set once
/// per tick and moves due jobs onto a bounded ready queue, where a fixed pool
/// of workers picks them up. A job is owned by exactly one of the scheduled
/// set, the ready queue or a worker at any time.
///
/// Every job carries a cancellation flag that workers check before running
/// it, so cancelling a job that already reached the ready queue still
/// prevents the call. A callback that is already executing is not
/// interrupted, but a cancelled periodic job is not rescheduled.
pub struct JobScheduler {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    ticker_stop: Sender<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Spawn the ticker and worker threads
    pub fn start(config: &KernelConfig) -> KernelResult<Self> {
        let shared = Arc::new(Shared {
            scheduled: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            metrics: AtomicJobMetrics::default(),
            lock_timeout: config.lock_timeout(),
        });
        let (ready_tx, ready_rx) = channel::bounded::<Job>(config.job_queue_capacity);

        // Workers exit once the ticker drops the only sender.
        let mut workers = Vec::with_capacity(config.job_workers);
        for index in 0..config.job_workers.max(1) {
            let receiver = ready_rx.clone();
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(format!("kestrel-job-worker-{}", index))
                .spawn(move || worker_loop(receiver, shared))
                .map_err(|e| KernelError::failed(format!("failed to spawn job worker: {}", e)))?;
            workers.push(worker);
        }
        drop(ready_rx);

        let (ticker_stop, stop_rx) = channel::bounded(1);
        let tick = config.scheduler_tick();
        let ticker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("kestrel-job-ticker".to_string())
                .spawn(move || ticker_loop(stop_rx, ready_tx, shared, tick))
                .map_err(|e| KernelError::failed(format!("failed to spawn job ticker: {}", e)))?
        };

        log::debug!(
            target: LOG_TARGET,
            "job scheduler started ({} workers, ready queue {}, tick {:?})",
            workers.len(),
            config.job_queue_capacity,
            tick
        );

        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            ticker_stop,
            ticker: Mutex::new(Some(ticker)),
            workers: Mutex::new(workers),
        })
    }

    /// Schedule `callback`
    ///
    /// One-shot jobs are due immediately and run once. Periodic jobs are
    /// first due one `interval` from now and every `interval` after each run.
    pub fn schedule<F>(&self, interval: Duration, periodic: bool, callback: F) -> KernelResult<JobHandle>
    where
        F: FnMut() + Send + 'static,
    {
        if periodic && interval.is_zero() {
            return Err(KernelError::invalid_argument("periodic job needs a non-zero interval"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let control = Arc::new(JobControl::default());
        let now = Instant::now();
        let job = Job {
            id,
            callback: Box::new(callback),
            interval,
            periodic,
            due: if periodic { now + interval } else { now },
            control: control.clone(),
        };

        // `stop` drains the set only after raising the flag.
        let mut scheduled = self.shared.lock_scheduled()?;
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(KernelError::invalid_state("job scheduler stopped"));
        }
        scheduled.insert(id, job);
        drop(scheduled);

        log::trace!(target: LOG_TARGET, "job {} scheduled (periodic: {}, {:?})", id, periodic, interval);
        Ok(JobHandle { id, control })
    }

    /// Cancel a job
    ///
    /// Waiting jobs are removed from the scheduled set. Jobs already in the
    /// ready queue are skipped by the worker that picks them up.
    /// `NotFound` if the job already finished or was cancelled before.
    pub fn cancel(&self, handle: &JobHandle) -> KernelResult<()> {
        if handle.is_finished() || handle.control.cancelled.swap(true, Ordering::AcqRel) {
            return Err(KernelError::not_found(format!("job {} is not pending", handle.id)));
        }

        let removed = self.shared.lock_scheduled()?.remove(&handle.id);
        if let Some(job) = removed {
            job.finish();
        }

        log::trace!(target: LOG_TARGET, "job {} cancelled", handle.id);
        Ok(())
    }

    /// Jobs waiting in the scheduled set
    pub fn pending(&self) -> KernelResult<usize> {
        Ok(self.shared.lock_scheduled()?.len())
    }

    pub fn metrics(&self) -> JobMetrics {
        self.shared.metrics.snapshot()
    }

    /// Stop the ticker and workers; queued and waiting jobs are discarded
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.ticker_stop.try_send(());
        let current = thread::current().id();
        if let Some(ticker) = self.ticker.lock().take() {
            if ticker.thread().id() != current && ticker.join().is_err() {
                log::error!(target: LOG_TARGET, "job ticker panicked");
            }
        }
        for worker in self.workers.lock().drain(..) {
            // A job may stop the scheduler from one of the workers.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!(target: LOG_TARGET, "job worker panicked");
            }
        }

        let discarded: Vec<Job> = match self.shared.lock_scheduled() {
            Ok(mut scheduled) => scheduled.drain().map(|(_, job)| job).collect(),
            Err(e) => {
                log::warn!(target: LOG_TARGET, "scheduled jobs not discarded: {}", e);
                Vec::new()
            }
        };
        if !discarded.is_empty() {
            log::debug!(target: LOG_TARGET, "discarding {} scheduled jobs", discarded.len());
        }
        discarded.into_iter().for_each(Job::finish);
        log::debug!(target: LOG_TARGET, "job scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker_loop(stop: Receiver<()>, ready: Sender<Job>, shared: Arc<Shared>, tick: Duration) {
    loop {
        match stop.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => scan(&ready, &shared),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Move every due job onto the ready queue
fn scan(ready: &Sender<Job>, shared: &Shared) {
    let now = Instant::now();
    let mut scheduled = match shared.lock_scheduled() {
        Ok(scheduled) => scheduled,
        Err(e) => {
            log::warn!(target: LOG_TARGET, "tick skipped: {}", e);
            return;
        }
    };

    let mut due: Vec<(Instant, JobId)> = scheduled
        .values()
        .filter(|job| job.due <= now)
        .map(|job| (job.due, job.id))
        .collect();
    due.sort_unstable();

    for (_, id) in due {
        let Some(job) = scheduled.remove(&id) else {
            continue;
        };
        match ready.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(mut job)) | Err(TrySendError::Disconnected(mut job)) => {
                if job.periodic {
                    log::warn!(target: LOG_TARGET, "ready queue full, job {} skips a period", job.id);
                    job.due = now + job.interval;
                    scheduled.insert(job.id, job);
                } else {
                    log::warn!(target: LOG_TARGET, "ready queue full, one-shot job {} dropped", job.id);
                    shared.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    job.finish();
                }
            }
        }
    }
}

fn worker_loop(ready: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = ready.recv() {
        run(job, &shared);
    }
}

fn run(mut job: Job, shared: &Shared) {
    if job.control.cancelled.load(Ordering::Acquire) || shared.stopped.load(Ordering::Acquire) {
        shared.metrics.skipped.fetch_add(1, Ordering::Relaxed);
        job.finish();
        return;
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| (job.callback)()));
    shared.metrics.executed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        shared.metrics.panics.fetch_add(1, Ordering::Relaxed);
        log::error!(target: LOG_TARGET, "job {} panicked", job.id);
    }

    if !job.periodic || job.control.cancelled.load(Ordering::Acquire) {
        job.finish();
        return;
    }
    match shared.lock_scheduled() {
        Ok(mut scheduled) if !shared.stopped.load(Ordering::Acquire) => {
            job.due = Instant::now() + job.interval;
            scheduled.insert(job.id, job);
        }
        Ok(_) => job.finish(),
        Err(e) => {
            log::error!(target: LOG_TARGET, "periodic job {} lost: {}", job.id, e);
            job.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn slow_tick() -> KernelConfig {
        KernelConfig {
            scheduler_tick_ms: 200,
            ..KernelConfig::default()
        }
    }

    #[test]
    fn test_one_shot_runs_once() {
        let jobs = JobScheduler::start(&KernelConfig::default()).unwrap();
        let (tx, rx) = channel::unbounded();

        let handle = jobs
            .schedule(Duration::ZERO, false, move || {
                let _ = tx.send(());
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(handle.is_finished());
        assert_eq!(jobs.cancel(&handle).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cancel_before_tick() {
        let jobs = JobScheduler::start(&slow_tick()).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let handle = jobs
            .schedule(Duration::ZERO, false, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        assert_eq!(jobs.pending().unwrap(), 1);
        jobs.cancel(&handle).unwrap();
        assert_eq!(jobs.pending().unwrap(), 0);

        thread::sleep(Duration::from_millis(400));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(jobs.cancel(&handle).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_periodic_until_cancelled() {
        let jobs = JobScheduler::start(&KernelConfig::default()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let handle = jobs
            .schedule(Duration::from_millis(20), true, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        jobs.cancel(&handle).unwrap();
        thread::sleep(Duration::from_millis(50));
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "periodic job ran {} times", seen);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert_eq!(jobs.pending().unwrap(), 0);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let jobs = JobScheduler::start(&KernelConfig::constrained()).unwrap();
        let (tx, rx) = channel::unbounded();

        jobs.schedule(Duration::ZERO, false, || panic!("boom")).unwrap();
        jobs.schedule(Duration::ZERO, false, move || {
            let _ = tx.send(());
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(jobs.metrics().panics, 1);
    }

    #[test]
    fn test_rejects_zero_period_and_stopped() {
        let jobs = JobScheduler::start(&KernelConfig::default()).unwrap();
        let err = jobs.schedule(Duration::ZERO, true, || {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        jobs.stop();
        let err = jobs.schedule(Duration::ZERO, false, || {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    /// Occupy the only worker until the returned sender fires
    fn block_worker(jobs: &JobScheduler) -> Sender<()> {
        let (started_tx, started_rx) = channel::bounded(1);
        let (gate_tx, gate_rx) = channel::bounded::<()>(1);
        jobs.schedule(Duration::ZERO, false, move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        gate_tx
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_cancel_after_job_is_ready() {
        let jobs = JobScheduler::start(&KernelConfig::constrained()).unwrap();
        let gate = block_worker(&jobs);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = jobs
            .schedule(Duration::ZERO, false, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        // Moved onto the ready queue by the ticker.
        wait_until(|| jobs.pending().unwrap() == 0);
        jobs.cancel(&handle).unwrap();

        gate.send(()).unwrap();
        wait_until(|| handle.is_finished());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(jobs.metrics().skipped, 1);
    }

    #[test]
    fn test_full_ready_queue() {
        let config = KernelConfig {
            job_queue_capacity: 1,
            job_workers: 1,
            ..KernelConfig::default()
        };
        let jobs = JobScheduler::start(&config).unwrap();
        let gate = block_worker(&jobs);
        let (tx, rx) = channel::unbounded();

        let filler_tx = tx.clone();
        jobs.schedule(Duration::ZERO, false, move || {
            let _ = filler_tx.send("filler");
        })
        .unwrap();
        wait_until(|| jobs.pending().unwrap() == 0);

        let dropped_tx = tx.clone();
        let dropped = jobs
            .schedule(Duration::ZERO, false, move || {
                let _ = dropped_tx.send("dropped");
            })
            .unwrap();
        wait_until(|| dropped.is_finished());
        assert_eq!(jobs.metrics().dropped, 1);

        let periodic = jobs
            .schedule(Duration::from_millis(20), true, move || {
                let _ = tx.send("periodic");
            })
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(jobs.pending().unwrap(), 1);
        assert!(!periodic.is_finished());

        gate.send(()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "filler");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "periodic");
        jobs.cancel(&periodic).unwrap();
        assert_eq!(jobs.metrics().dropped, 1);
        assert!(rx.try_iter().all(|seen| seen == "periodic"));
    }

    #[test]
    fn test_schedule_after_stop_leaves_nothing_behind() {
        let jobs = JobScheduler::start(&KernelConfig::default()).unwrap();
        jobs.schedule(Duration::from_secs(60), true, || {}).unwrap();
        jobs.stop();
        assert_eq!(jobs.pending().unwrap(), 0);
        assert!(jobs.schedule(Duration::from_secs(60), true, || {}).is_err());
        assert_eq!(jobs.pending().unwrap(), 0);
    }
}
