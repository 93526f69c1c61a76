use crate::pool::{Lifecycle, Shared, SurplusRefusal};
use crate::task::Task;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::deque::{self, Steal};
use tracing::{debug, error, trace};

/// Lifecycle of a single worker thread.
///
/// `Starting → Running`, then `Running ⇄ Idle ⇄ Stealing` during normal
/// operation. A graceful shutdown or voluntary retirement passes through
/// `Draining`; a forced shutdown may jump straight to `Terminated` after the
/// in-flight task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Idle = 2,
    Stealing = 3,
    Draining = 4,
    Terminated = 5,
}

impl WorkerState {
    pub(crate) fn from_u8(val: u8) -> WorkerState {
        match val {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Idle,
            3 => WorkerState::Stealing,
            4 => WorkerState::Draining,
            _ => WorkerState::Terminated,
        }
    }
}

/// One worker thread: owns its local deque, steals from peers, and executes
/// tasks until told to stop.
pub(crate) struct Worker {
    index: usize,
    local: deque::Worker<Task>,
    state: Arc<AtomicU8>,
    shared: Arc<Shared>,
    rng_state: u64,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        local: deque::Worker<Task>,
        state: Arc<AtomicU8>,
        shared: Arc<Shared>,
    ) -> Worker {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
            ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);

        Worker {
            index,
            local,
            state,
            shared,
            rng_state: seed | 1,
        }
    }

    pub(crate) fn run(mut self) {
        self.set_state(WorkerState::Running);
        debug!(worker = self.index, "worker started");

        loop {
            match self.shared.lifecycle() {
                Lifecycle::Running => {}
                Lifecycle::Draining => {
                    self.drain();
                    return;
                }
                Lifecycle::Stopping | Lifecycle::Terminated => {
                    self.discard_and_exit();
                    return;
                }
            }

            // A destroy_thread request is honored only between tasks, never
            // mid-invocation.
            if self.shared.try_claim_retirement() {
                match self.retire() {
                    Ok(()) => return,
                    // The shrink is still owed: the last worker cannot
                    // leave while only it can run the backlog, so the
                    // request goes back up for a later boundary.
                    Err(SurplusRefusal::LastWithBacklog) => self.shared.repost_retirement(),
                    Err(_) => {}
                }
            }

            if let Some(task) = self.next_task() {
                self.execute(task);
                continue;
            }

            if self.idle_wait() {
                return;
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Pop from the local deque, refill from the shared queue, or steal from
    /// a peer. Non-blocking; `None` means no work was reachable right now.
    fn next_task(&mut self) -> Option<Task> {
        if let Some(task) = self.local.pop() {
            self.shared.pending_tasks.fetch_sub(1, Ordering::SeqCst);
            return Some(task);
        }

        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(task) => {
                    self.shared.pending_tasks.fetch_sub(1, Ordering::SeqCst);
                    return Some(task);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        self.steal_from_peers()
    }

    /// Scan peer deques for work, starting at a rotated index so no victim
    /// is systematically favored. The registry read lock keeps the scan
    /// valid while workers come and go.
    fn steal_from_peers(&mut self) -> Option<Task> {
        let slots = self.shared.slots.read().unwrap();
        let len = slots.len();
        if len == 0 {
            return None;
        }

        self.set_state(WorkerState::Stealing);

        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        let start = (self.rng_state as usize) % len;

        for offset in 0..len {
            let victim = (start + offset) % len;
            if victim == self.index {
                continue;
            }
            let slot = match &slots[victim] {
                Some(slot) => slot,
                None => continue,
            };
            if let Some(task) = slot.stealer.steal().success() {
                self.shared.pending_tasks.fetch_sub(1, Ordering::SeqCst);
                self.set_state(WorkerState::Running);
                trace!(worker = self.index, victim, "stole task");
                return Some(task);
            }
        }

        self.set_state(WorkerState::Running);
        None
    }

    fn execute(&mut self, task: Task) {
        self.set_state(WorkerState::Running);
        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(()) => {
                self.shared.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.shared.failed_tasks.fetch_add(1, Ordering::Relaxed);
                error!(worker = self.index, "task panicked; worker continues");
                if let Some(handler) = &self.shared.config.panic_handler {
                    handler(payload);
                }
            }
        }
    }

    /// Park until new work, a retirement request, or shutdown. Returns true
    /// if the worker retired and the thread should exit.
    fn idle_wait(&mut self) -> bool {
        self.set_state(WorkerState::Idle);
        self.shared.idle_workers.fetch_add(1, Ordering::SeqCst);
        let timed_out = self.shared.park(self.shared.config.keep_alive);
        self.shared.idle_workers.fetch_sub(1, Ordering::SeqCst);
        self.set_state(WorkerState::Running);

        // Idle past keep-alive with nothing queued: this worker is surplus.
        if timed_out
            && self.shared.pending_tasks.load(Ordering::SeqCst) == 0
            && self.retire().is_ok()
        {
            return true;
        }
        false
    }

    /// Voluntarily leave the pool, unless that would undershoot
    /// `min_threads`, strand queued work behind no worker, or a shutdown is
    /// already driving the exit.
    fn retire(&mut self) -> Result<(), SurplusRefusal> {
        self.shared.deregister_surplus(self.index)?;
        self.set_state(WorkerState::Draining);
        self.migrate_local();
        self.set_state(WorkerState::Terminated);
        debug!(worker = self.index, "worker retired");
        Ok(())
    }

    /// Graceful shutdown: keep executing until no task is queued anywhere.
    fn drain(&mut self) {
        self.set_state(WorkerState::Draining);

        loop {
            if self.shared.lifecycle() >= Lifecycle::Stopping {
                self.discard_and_exit();
                return;
            }
            if let Some(task) = self.next_task() {
                self.execute(task);
                self.set_state(WorkerState::Draining);
                continue;
            }
            if self.shared.pending_tasks.load(Ordering::SeqCst) == 0 {
                break;
            }
            // Remaining work is transiently unreachable (a contended steal
            // or a peer mid-migration); stay hot instead of parking.
            thread::yield_now();
        }

        self.exit();
    }

    /// Forced shutdown: drop everything still queued locally and leave.
    fn discard_and_exit(&mut self) {
        let mut dropped = 0;
        while let Some(task) = self.local.pop() {
            drop(task);
            dropped += 1;
        }
        if dropped > 0 {
            self.shared.pending_tasks.fetch_sub(dropped, Ordering::SeqCst);
            self.shared
                .discarded_tasks
                .fetch_add(dropped, Ordering::SeqCst);
            debug!(worker = self.index, dropped, "discarded local queue");
        }
        self.exit();
    }

    /// Move everything left in the local deque back to the shared queue so
    /// surviving workers pick it up. Keeps `pending_tasks` untouched: the
    /// tasks are still queued, just elsewhere.
    fn migrate_local(&mut self) {
        let mut moved = 0;
        while let Some(task) = self.local.pop() {
            self.shared.injector.push(task);
            moved += 1;
        }
        if moved > 0 {
            self.shared.wake_all();
            trace!(worker = self.index, moved, "migrated local queue");
        }
    }

    fn exit(&mut self) {
        self.set_state(WorkerState::Terminated);
        self.shared.deregister(self.index);
        debug!(worker = self.index, "worker exited");
    }
}
