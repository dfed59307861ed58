//! Elastic worker pool.
//!
//! A small set of reusable worker threads ("runners") that everything else
//! schedules background work on: listener callbacks, RPC dispatch and
//! reconnection retries. The pool grows on demand (a spawn never queues) and
//! a keeper thread sweeps once per second, retiring idle runners beyond the
//! configured minimum once their inactivity deadline passes.
//!
//! The pool is an explicit dependency: construct one, wrap it in an `Arc`
//! and hand it to [`crate::Connector`], [`crate::RpcPeer`] and
//! [`crate::MethodBinder`]. There is no process-wide singleton.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use wirepeer::WorkerPool;
//!
//! let pool = Arc::new(WorkerPool::new(2, std::time::Duration::from_secs(10)));
//! pool.spawn(|| println!("runs on a pool thread"));
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Default minimum number of idle runners kept alive.
pub const DEFAULT_MIN_IDLE: usize = 5;

/// Default inactivity timeout before an excess idle runner is retired.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeper sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for each runner to finish.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One reusable worker unit inside the pool.
struct Runner {
    state: Mutex<RunnerState>,
    wake: Condvar,
    busy: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct RunnerState {
    job: Option<Job>,
    terminated: bool,
    /// Stamped when the runner goes back to idle.
    idle_deadline: Instant,
}

impl Runner {
    fn new(reserved: bool, inactivity: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RunnerState {
                job: None,
                terminated: false,
                idle_deadline: Instant::now() + inactivity,
            }),
            wake: Condvar::new(),
            busy: AtomicBool::new(reserved),
            thread: Mutex::new(None),
        })
    }

    fn start(self: &Arc<Self>, pool: Arc<PoolShared>) {
        let runner = self.clone();
        let handle = std::thread::Builder::new()
            .name("wirepeer-runner".into())
            .spawn(move || runner.body(pool));

        match handle {
            Ok(h) => *self.thread.lock() = Some(h),
            Err(e) => tracing::error!("cannot start runner thread: {}", e),
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hand a job to an idle runner. The busy flag is raised before the
    /// signal so the keeper never retires a runner that was just claimed.
    fn wakeup(&self, job: Job) {
        self.busy.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.job = Some(job);
        self.wake.notify_one();
    }

    fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        self.wake.notify_one();
    }

    fn idle_expired(&self, now: Instant) -> bool {
        !self.is_busy() && self.state.lock().idle_deadline <= now
    }

    fn join(&self, timeout: Duration) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            // JoinHandle has no timed join; the runner checks its
            // terminated flag on every wake so this returns promptly.
            let _ = timeout;
            let _ = handle.join();
        }
    }

    fn body(self: Arc<Self>, pool: Arc<PoolShared>) {
        loop {
            let job = {
                let mut state = self.state.lock();

                loop {
                    if state.terminated {
                        return;
                    }
                    if let Some(job) = state.job.take() {
                        break job;
                    }
                    self.wake.wait(&mut state);
                }
            };

            pool.runner_start();

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("runner job panicked");
            }

            pool.runner_stop();

            let mut state = self.state.lock();
            state.idle_deadline = Instant::now() + pool.inactivity;
            drop(state);
            self.busy.store(false, Ordering::Release);
        }
    }
}

struct PoolShared {
    runners: Mutex<Vec<Arc<Runner>>>,
    min_idle: usize,
    inactivity: Duration,
    stopped: AtomicBool,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl PoolShared {
    fn runner_start(&self) {
        let current = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(current, Ordering::AcqRel);
    }

    fn runner_stop(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Elastic pool of reusable worker threads.
///
/// `spawn` never blocks and never queues: if no runner is idle a new one is
/// created on the spot. The keeper sweep brings the population back down to
/// the configured minimum once the load subsides.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with the given minimum idle-runner count and
    /// inactivity timeout, and start its keeper thread.
    pub fn new(min_idle: usize, inactivity: Duration) -> Self {
        let shared = Arc::new(PoolShared {
            runners: Mutex::new(Vec::new()),
            min_idle,
            inactivity,
            stopped: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let keeper_shared = shared.clone();
        let keeper = std::thread::Builder::new()
            .name("wirepeer-pool-keeper".into())
            .spawn(move || Self::keep(keeper_shared))
            .ok();

        if keeper.is_none() {
            tracing::error!("cannot start pool keeper thread");
        }

        Self {
            shared,
            keeper: Mutex::new(keeper),
        }
    }

    /// Create a pool with the default policy.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MIN_IDLE, DEFAULT_INACTIVITY_TIMEOUT)
    }

    /// Execute `job` on a pooled thread.
    ///
    /// Returns `false` only when the pool is already shut down.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            tracing::error!("spawn on a stopped pool");
            return false;
        }

        let job: Job = Box::new(job);
        let mut runners = self.shared.runners.lock();

        if let Some(runner) = runners.iter().find(|r| !r.is_busy()) {
            runner.wakeup(job);
            return true;
        }

        let runner = Runner::new(true, self.shared.inactivity);
        runners.push(runner.clone());
        drop(runners);

        runner.start(self.shared.clone());
        runner.wakeup(job);
        true
    }

    /// Number of runners currently executing a job.
    pub fn running_count(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Highest observed concurrent runner usage.
    pub fn running_peak(&self) -> usize {
        self.shared.peak.load(Ordering::Acquire)
    }

    /// Total number of runners currently alive (idle and busy).
    pub fn runner_count(&self) -> usize {
        self.shared.runners.lock().len()
    }

    /// Number of idle runners.
    pub fn idle_count(&self) -> usize {
        self.shared.runners.lock().iter().filter(|r| !r.is_busy()).count()
    }

    /// Terminate and join every runner, then stop the keeper.
    ///
    /// Idempotent. Jobs already running are allowed to finish.
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(keeper) = self.keeper.lock().take() {
            let _ = keeper.join();
        }

        let runners = std::mem::take(&mut *self.shared.runners.lock());

        for runner in &runners {
            runner.terminate();
        }
        for runner in &runners {
            runner.join(JOIN_TIMEOUT);
        }
    }

    fn keep(shared: Arc<PoolShared>) {
        let mut last_peak = 0;

        while !shared.stopped.load(Ordering::Acquire) {
            std::thread::sleep(SWEEP_INTERVAL);

            let peak = shared.peak.load(Ordering::Acquire);
            if peak != last_peak {
                last_peak = peak;
                tracing::debug!(
                    min = shared.min_idle,
                    peak,
                    runners = shared.runners.lock().len(),
                    "pool peak changed"
                );
            }

            let mut pending = Vec::new();
            {
                let mut runners = shared.runners.lock();
                let now = Instant::now();

                if runners.len() > shared.min_idle {
                    let mut excess = runners.len() - shared.min_idle;
                    runners.retain(|r| {
                        if excess > 0 && r.idle_expired(now) {
                            r.terminate();
                            excess -= 1;
                            false
                        } else {
                            true
                        }
                    });
                } else {
                    while runners.len() < shared.min_idle {
                        let runner = Runner::new(false, shared.inactivity);
                        runners.push(runner.clone());
                        pending.push(runner);
                    }
                }
            }

            for runner in pending {
                runner.start(shared.clone());
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
