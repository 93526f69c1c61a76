use crate::errors::PoolError;
use crate::metrics::PoolMetrics;
use crate::task::Task;
use crate::worker::{Worker, WorkerState};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::deque::{self, Injector, Steal, Stealer};
use tracing::debug;

/// Callback invoked with the panic payload when a task panics.
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Thread pool configuration.
#[derive(Clone)]
pub struct Config {
    /// Lower bound on live workers. The pool spawns this many threads up
    /// front and never shrinks below it.
    pub min_threads: usize,
    /// Upper bound on live workers. The pool never grows past it.
    pub max_threads: usize,
    /// How long an idle worker waits for new work before it retires, if the
    /// pool is above `min_threads`.
    pub keep_alive: Duration,
    /// Minimum interval between automatic grow decisions. Together with the
    /// distinct grow (backlog) and shrink (idle timeout) thresholds this
    /// keeps the pool from thrashing between sizes.
    pub grow_cooldown: Duration,
    /// Worker threads are named `{prefix}{n}` when set.
    pub name_prefix: Option<String>,
    /// Stack size for worker threads.
    pub stack_size: Option<usize>,
    /// Invoked on the worker thread with the payload of a panicking task.
    pub panic_handler: Option<PanicHandler>,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            min_threads: num_cpus,
            max_threads: num_cpus * 2,
            keep_alive: Duration::from_secs(30),
            grow_cooldown: Duration::from_millis(10),
            name_prefix: Some("stealpool-".to_string()),
            stack_size: None,
            panic_handler: None,
        }
    }
}

impl Config {
    /// Configuration with explicit worker bounds and default tuning.
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self {
            min_threads,
            max_threads,
            ..Default::default()
        }
    }

    /// Fixed-size pool pinned at the core count.
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self::new(num_cpus, num_cpus)
    }

    /// Elastic pool sized for workloads that block: core count up to twice
    /// the core count.
    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self::new(num_cpus, num_cpus * 2)
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.min_threads > self.max_threads || self.max_threads == 0 {
            return Err(PoolError::InvalidConfiguration {
                min_threads: self.min_threads,
                max_threads: self.max_threads,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SOME: &&str = &"Some(_)";
        const NONE: &&str = &"None";

        fmt.debug_struct("Config")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("keep_alive", &self.keep_alive)
            .field("grow_cooldown", &self.grow_cooldown)
            .field("name_prefix", &self.name_prefix)
            .field("stack_size", &self.stack_size)
            .field(
                "panic_handler",
                if self.panic_handler.is_some() { SOME } else { NONE },
            )
            .finish()
    }
}

/// Pool-wide lifecycle. The value only ever increases.
///
/// - `Running`: accept and execute tasks
/// - `Draining`: reject new tasks, execute everything already queued
/// - `Stopping`: reject new tasks, finish in-flight tasks only, discard the
///   rest
/// - `Terminated`: all workers exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Running = 0,
    Draining = 1,
    Stopping = 2,
    Terminated = 3,
}

impl Lifecycle {
    fn from_u8(val: u8) -> Lifecycle {
        match val {
            0 => Lifecycle::Running,
            1 => Lifecycle::Draining,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Terminated,
        }
    }
}

#[inline(always)]
fn unlikely(b: bool) -> bool {
    #[cold]
    fn cold() {}
    if !b {
        cold()
    }
    b
}

/// Why a voluntary retirement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SurplusRefusal {
    /// Shutdown is already driving the exit.
    ShuttingDown,
    /// The pool is at `min_threads`.
    AtMinimum,
    /// This is the last worker and there is still queued work.
    LastWithBacklog,
}

/// Registry entry for one live worker. The slot index is the worker's stable
/// identity; peers scan occupied slots when stealing.
pub(crate) struct Slot {
    pub(crate) stealer: Stealer<Task>,
    pub(crate) state: Arc<AtomicU8>,
}

/// State shared between the pool handle and every worker thread.
pub(crate) struct Shared {
    pub(crate) config: Config,

    /// Shared submission/overflow queue. Workers refill their local deques
    /// from here in batches.
    pub(crate) injector: Injector<Task>,

    /// Worker registry with stable indices. Thieves hold the read side while
    /// scanning for victims; register/deregister take the write side, so a
    /// steal scan is never invalidated mid-iteration.
    pub(crate) slots: RwLock<Vec<Option<Slot>>>,

    /// Live worker count. The mutex serializes grow/shrink decisions (min
    /// and max enforcement) and guards `termination_signal`.
    ///
    /// Lock order: `live` before `slots`.
    live: Mutex<usize>,
    termination_signal: Condvar,

    /// Mirror of `live` for lock-free reads on the submit path and in
    /// metrics.
    live_count: AtomicUsize,

    /// Idle workers park on this pair; `submit` notifies one, shutdown and
    /// `destroy_thread` notify all.
    sleep_mutex: Mutex<()>,
    sleep_signal: Condvar,

    /// Every `submit` holds the read side for its enqueue critical section.
    /// Shutdown takes the write side before switching the lifecycle, so once
    /// the drain decision is made no task can slip into the queue unseen.
    gate: RwLock<()>,

    lifecycle: AtomicU8,

    /// Tasks queued anywhere (injector or local deques). Excludes in-flight
    /// tasks. Workers drain until this hits zero on graceful shutdown.
    pub(crate) pending_tasks: AtomicUsize,
    pub(crate) idle_workers: AtomicUsize,

    /// Outstanding `destroy_thread` requests; each is claimed by exactly one
    /// worker at a between-tasks boundary.
    retire_requests: AtomicUsize,

    pub(crate) total_submitted: AtomicUsize,
    pub(crate) completed_tasks: AtomicUsize,
    pub(crate) failed_tasks: AtomicUsize,
    pub(crate) discarded_tasks: AtomicUsize,

    next_thread_id: AtomicUsize,
    last_grow: Mutex<Instant>,
}

impl Shared {
    fn new(config: Config) -> Shared {
        Shared {
            config,
            injector: Injector::new(),
            slots: RwLock::new(Vec::new()),
            live: Mutex::new(0),
            termination_signal: Condvar::new(),
            live_count: AtomicUsize::new(0),
            sleep_mutex: Mutex::new(()),
            sleep_signal: Condvar::new(),
            gate: RwLock::new(()),
            lifecycle: AtomicU8::new(Lifecycle::Running as u8),
            pending_tasks: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            retire_requests: AtomicUsize::new(0),
            total_submitted: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
            discarded_tasks: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(1),
            last_grow: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn store_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.live_count.load(Ordering::SeqCst)
    }

    #[inline(always)]
    fn push_task(&self, task: Task) {
        self.pending_tasks.fetch_add(1, Ordering::SeqCst);
        self.injector.push(task);

        if unlikely(self.idle_workers.load(Ordering::SeqCst) > 0) {
            self.wake_one();
        }
    }

    fn wake_one(&self) {
        let _guard = self.sleep_mutex.lock().unwrap();
        self.sleep_signal.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        let _guard = self.sleep_mutex.lock().unwrap();
        self.sleep_signal.notify_all();
    }

    /// Block until woken or until `timeout` elapses. Returns whether the
    /// wait timed out. Never sleeps while there is queued work, an
    /// outstanding retirement request, or a lifecycle change to react to;
    /// those producers notify under `sleep_mutex`, so the re-check here
    /// cannot miss a wakeup.
    pub(crate) fn park(&self, timeout: Duration) -> bool {
        let guard = self.sleep_mutex.lock().unwrap();
        if self.pending_tasks.load(Ordering::SeqCst) > 0
            || self.lifecycle() != Lifecycle::Running
            || self.retire_requests.load(Ordering::SeqCst) > 0
        {
            return false;
        }
        let (_guard, wait) = self.sleep_signal.wait_timeout(guard, timeout).unwrap();
        wait.timed_out()
    }

    /// Claim one outstanding retirement request. At most one worker wins
    /// each request.
    pub(crate) fn try_claim_retirement(&self) -> bool {
        let mut current = self.retire_requests.load(Ordering::SeqCst);
        while current > 0 {
            match self.retire_requests.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Deregister the worker occupying `index` and drop the live count,
    /// waking anyone waiting for termination.
    pub(crate) fn deregister(&self, index: usize) {
        {
            let mut live = self.live.lock().unwrap();
            self.slots.write().unwrap()[index] = None;
            *live -= 1;
            self.live_count.store(*live, Ordering::SeqCst);
        }
        self.termination_signal.notify_all();
    }

    /// Like `deregister`, but only if the pool is still running and above
    /// `min_threads`. Used by voluntary shrink paths; the min bound is
    /// re-validated under the count lock so concurrent retirements cannot
    /// undershoot it.
    pub(crate) fn deregister_surplus(&self, index: usize) -> Result<(), SurplusRefusal> {
        {
            let mut live = self.live.lock().unwrap();
            if self.lifecycle() != Lifecycle::Running {
                return Err(SurplusRefusal::ShuttingDown);
            }
            if *live <= self.config.min_threads {
                return Err(SurplusRefusal::AtMinimum);
            }
            // The last worker stays while there is backlog; with min_threads
            // of zero nothing else would ever run it.
            if *live == 1 && self.pending_tasks.load(Ordering::SeqCst) > 0 {
                return Err(SurplusRefusal::LastWithBacklog);
            }
            self.slots.write().unwrap()[index] = None;
            *live -= 1;
            self.live_count.store(*live, Ordering::SeqCst);
        }
        self.termination_signal.notify_all();
        Ok(())
    }

    /// Put a claimed retirement request back so another boundary can honor
    /// it. Used when the claiming worker turned out to be the only one able
    /// to run the remaining backlog.
    pub(crate) fn repost_retirement(&self) {
        self.retire_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Spawn one worker thread, registering it under a stable slot index.
    fn spawn_worker(self: &Arc<Self>) -> Result<usize, PoolError> {
        let mut live = self.live.lock().unwrap();

        if self.lifecycle() >= Lifecycle::Draining {
            return Err(PoolError::Shutdown);
        }
        if *live >= self.config.max_threads {
            return Err(PoolError::AtCapacity {
                max_threads: self.config.max_threads,
            });
        }

        let local = deque::Worker::new_fifo();
        let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));
        let index = {
            let mut slots = self.slots.write().unwrap();
            let slot = Slot {
                stealer: local.stealer(),
                state: state.clone(),
            };
            match slots.iter().position(Option::is_none) {
                Some(free) => {
                    slots[free] = Some(slot);
                    free
                }
                None => {
                    slots.push(Some(slot));
                    slots.len() - 1
                }
            }
        };
        *live += 1;
        self.live_count.store(*live, Ordering::SeqCst);

        let mut builder = thread::Builder::new();
        if let Some(prefix) = &self.config.name_prefix {
            let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
            builder = builder.name(format!("{}{}", prefix, id));
        }
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker = Worker::new(index, local, state, self.clone());
        if let Err(err) = builder.spawn(move || worker.run()) {
            // Roll back the registration, and release the count lock before
            // panicking so it is not poisoned.
            self.slots.write().unwrap()[index] = None;
            *live -= 1;
            self.live_count.store(*live, Ordering::SeqCst);
            drop(live);
            panic!("failed to spawn worker thread: {err}");
        }

        debug!(worker = index, live = *live, "spawned worker");
        Ok(index)
    }

    /// Event-driven grow policy, run after each successful submit. Grows
    /// only under backlog with nobody idle, and no more often than the
    /// configured cooldown. A pool with zero live workers grows
    /// unconditionally so a queued task can always make progress.
    fn maybe_grow(self: &Arc<Self>) {
        if self.pending_tasks.load(Ordering::SeqCst) == 0 {
            return;
        }

        let live = self.live_workers();
        if live >= self.config.max_threads {
            return;
        }

        if live > 0 {
            if self.idle_workers.load(Ordering::SeqCst) > 0 {
                return;
            }
            if self.pending_tasks.load(Ordering::SeqCst) <= live {
                return;
            }
            let mut last_grow = self.last_grow.lock().unwrap();
            if last_grow.elapsed() < self.config.grow_cooldown {
                return;
            }
            *last_grow = Instant::now();
        }

        // Races with shutdown or a concurrent grow re-check under the count
        // lock inside spawn_worker.
        let _ = self.spawn_worker();
    }
}

/// Execute tasks on an elastic set of pooled worker threads.
///
/// Tasks are fire-and-forget: the pool observes no result. Work is placed on
/// a shared queue; workers move it into per-worker deques in batches and
/// steal from each other's deques when their own run dry. The worker count
/// floats between the configured bounds: sustained backlog grows the pool,
/// sustained idleness shrinks it back.
///
/// Dropping the pool performs a graceful shutdown, draining every task that
/// was accepted before the drop.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a pool with the default configuration.
    pub fn new() -> ThreadPool {
        Self::with_config(Config::default()).expect("default configuration is valid")
    }

    /// Create a pool bounded by `[min_threads, max_threads]`.
    pub fn with_bounds(min_threads: usize, max_threads: usize) -> Result<ThreadPool, PoolError> {
        Self::with_config(Config::new(min_threads, max_threads))
    }

    /// Create a pool from an explicit configuration.
    ///
    /// Fails with [`PoolError::InvalidConfiguration`] without creating any
    /// threads if `min_threads > max_threads` or `max_threads == 0`. On
    /// success, `min_threads` workers are running before this returns.
    pub fn with_config(config: Config) -> Result<ThreadPool, PoolError> {
        config.validate()?;

        let shared = Arc::new(Shared::new(config));
        for _ in 0..shared.config.min_threads {
            shared.spawn_worker()?;
        }

        Ok(ThreadPool { shared })
    }

    /// Submit a task for execution on some worker thread.
    ///
    /// Blocks only for the enqueue critical section, never for execution.
    /// Wakes an idle worker if there is one, and may grow the pool when the
    /// queue is backed up. Fails with [`PoolError::Shutdown`] once shutdown
    /// has begun; a rejected task is never enqueued.
    ///
    /// Submission is fire-and-forget: a panic inside the task is isolated at
    /// the worker and reported through the panic handler, not to this caller.
    pub fn submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let _gate = self.shared.gate.read().unwrap();
            if self.shared.lifecycle() >= Lifecycle::Draining {
                return Err(PoolError::Shutdown);
            }
            self.shared.total_submitted.fetch_add(1, Ordering::Relaxed);
            self.shared.push_task(Task::new(f));
        }

        self.shared.maybe_grow();
        Ok(())
    }

    /// Manually add one worker, up to `max_threads`.
    ///
    /// Returns the new worker's slot index.
    pub fn create_thread(&self) -> Result<usize, PoolError> {
        self.shared.spawn_worker()
    }

    /// Manually retire one worker, down to `min_threads`.
    ///
    /// The request is claimed by exactly one worker at an idle or
    /// between-tasks boundary; a worker mid-task is never interrupted. The
    /// retiring worker migrates any tasks left in its local deque back to
    /// the shared queue before its thread exits, so no task is lost.
    pub fn destroy_thread(&self) -> Result<(), PoolError> {
        {
            let live = self.shared.live.lock().unwrap();
            if self.shared.lifecycle() >= Lifecycle::Draining {
                return Err(PoolError::Shutdown);
            }
            if *live <= self.shared.config.min_threads {
                return Err(PoolError::AtMinimum {
                    min_threads: self.shared.config.min_threads,
                });
            }
        }
        self.shared.retire_requests.fetch_add(1, Ordering::SeqCst);
        self.shared.wake_all();
        Ok(())
    }

    /// Initiate a graceful shutdown and wait for it to complete.
    ///
    /// New submissions fail immediately. Every task that was accepted before
    /// this call executes before the workers exit. Idempotent.
    pub fn shutdown(&self) {
        self.begin_shutdown(Lifecycle::Draining);
        self.shared.wake_all();
        self.await_workers();

        // A pool that was allowed to shrink to zero workers can still be
        // holding tasks accepted just before the drain decision. Run them
        // here so the graceful guarantee holds with no worker left.
        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => {
                    self.shared.pending_tasks.fetch_sub(1, Ordering::SeqCst);
                    self.run_leftover(task);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        self.shared.store_lifecycle(Lifecycle::Terminated);
        debug!("pool shut down");
    }

    fn run_leftover(&self, task: Task) {
        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(()) => {
                self.shared.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.shared.failed_tasks.fetch_add(1, Ordering::Relaxed);
                if let Some(handler) = &self.shared.config.panic_handler {
                    handler(payload);
                }
            }
        }
    }

    /// Shut down as fast as possible, discarding queued tasks.
    ///
    /// Workers finish only the task they are currently executing; a running
    /// task is never interrupted. Returns the total number of tasks
    /// discarded without execution, which is also recorded in
    /// [`PoolMetrics::discarded_tasks`].
    pub fn shutdown_now(&self) -> usize {
        self.begin_shutdown(Lifecycle::Stopping);
        self.shared.wake_all();
        self.await_workers();

        // Workers discarded their local deques on exit; what is left in the
        // shared queue is discarded here.
        let mut dropped = 0;
        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => {
                    drop(task);
                    dropped += 1;
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        if dropped > 0 {
            self.shared.pending_tasks.fetch_sub(dropped, Ordering::SeqCst);
            self.shared.discarded_tasks.fetch_add(dropped, Ordering::SeqCst);
        }

        self.shared.store_lifecycle(Lifecycle::Terminated);
        let discarded = self.shared.discarded_tasks.load(Ordering::SeqCst);
        debug!(discarded, "pool force-stopped");
        discarded
    }

    /// Whether shutdown has begun (or completed).
    pub fn is_shutdown(&self) -> bool {
        self.shared.lifecycle() >= Lifecycle::Draining
    }

    /// Number of workers currently registered.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers()
    }

    /// Number of tasks queued but not yet picked up for execution.
    pub fn queued_tasks(&self) -> usize {
        self.shared.pending_tasks.load(Ordering::SeqCst)
    }

    /// Snapshot of the lifecycle states of all registered workers.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .map(|slot| WorkerState::from_u8(slot.state.load(Ordering::SeqCst)))
            .collect()
    }

    /// Sample the pool's activity counters.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            live_workers: self.shared.live_workers(),
            idle_workers: self.shared.idle_workers.load(Ordering::Relaxed),
            queued_tasks: self.shared.pending_tasks.load(Ordering::Relaxed),
            total_submitted: self.shared.total_submitted.load(Ordering::Relaxed),
            completed_tasks: self.shared.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.shared.failed_tasks.load(Ordering::Relaxed),
            discarded_tasks: self.shared.discarded_tasks.load(Ordering::Relaxed),
        }
    }

    /// Switch the lifecycle under the submission gate's write lock. Taking
    /// the write side waits out in-flight submits, so every task accepted
    /// before the switch is already counted in `pending_tasks` when workers
    /// observe the new lifecycle.
    fn begin_shutdown(&self, target: Lifecycle) {
        let _gate = self.shared.gate.write().unwrap();
        if self.shared.lifecycle() < target {
            self.shared.store_lifecycle(target);
        }
    }

    fn await_workers(&self) {
        let mut live = self.shared.live.lock().unwrap();
        while *live > 0 {
            live = self.shared.termination_signal.wait(live).unwrap();
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.shared.lifecycle() < Lifecycle::Terminated {
            self.shutdown();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ThreadPool")
            .field("live_workers", &self.live_workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}
