//! Cooperative shutdown: a broadcast-once done signal and a supervisor that
//! owns every loop it starts.
//!
//! The done signal is a channel nobody sends on. Asserting it drops the only
//! sender, after which every receiver observes a disconnect, forever. This
//! makes the signal idempotent to assert and to observe, and lets loops wait
//! on it with `recv_timeout` or inside `crossbeam::select!`.

use crate::error::{ReservoirError, Result};
use crate::monitor::MonitorControl;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Read-only view of the done signal, handed to every stage and monitor
#[derive(Debug, Clone)]
pub struct DoneSignal {
    rx: Receiver<()>,
}

impl DoneSignal {
    /// Non-blocking check
    pub fn is_done(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for at most `timeout`, waking early if the signal is asserted.
    /// Returns whether the signal is asserted.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Underlying receiver, for use in `crossbeam::select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// The asserting side of the done signal
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl ShutdownTrigger {
    /// Create a new, unasserted trigger
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Assert the done signal. Asserting again is a no-op.
    pub fn assert(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!("done signal asserted");
        }
    }

    /// Whether the signal has been asserted
    pub fn is_asserted(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// A read-only view for loops
    pub fn signal(&self) -> DoneSignal {
        DoneSignal {
            rx: self.rx.clone(),
        }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a supervised loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoopState {
    /// Registered with the barrier, not yet looping
    Starting = 0,
    /// Steady-state loop
    Running = 1,
    /// First non-blocking check saw the done signal (or end of input)
    ObservedDone = 2,
    /// Finishing in-flight work and closing owned outputs
    Draining = 3,
    /// Exited; the barrier has been decremented
    Stopped = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Starting,
            1 => LoopState::Running,
            2 => LoopState::ObservedDone,
            3 => LoopState::Draining,
            _ => LoopState::Stopped,
        }
    }
}

/// Shared, observable state of one supervised loop
#[derive(Debug, Clone)]
pub struct TaskTracker {
    state: Arc<AtomicU8>,
}

impl TaskTracker {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LoopState::Starting as u8)),
        }
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`. Transitions only go forward.
    pub fn advance(&self, state: LoopState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// True between loop entry and loop exit
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), LoopState::Starting | LoopState::Stopped)
    }
}

/// Counting join barrier owned by the supervisor
#[derive(Debug, Default)]
struct Barrier {
    outstanding: Mutex<usize>,
    zero: Condvar,
}

impl Barrier {
    fn register(&self) {
        *self.outstanding.lock() += 1;
    }

    fn complete(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            match deadline {
                Some(deadline) => {
                    if self.zero.wait_until(&mut outstanding, deadline).timed_out() {
                        return *outstanding == 0;
                    }
                }
                None => self.zero.wait(&mut outstanding),
            }
        }
        true
    }
}

/// Decrements the barrier exactly once when the loop's thread exits,
/// including by unwinding.
struct CompletionGuard {
    barrier: Arc<Barrier>,
    tracker: TaskTracker,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.tracker.advance(LoopState::Stopped);
        self.barrier.complete();
    }
}

struct Task {
    name: String,
    tracker: TaskTracker,
    handle: Option<JoinHandle<()>>,
}

/// Owns the done signal and the counted set of loops started under it
pub struct Supervisor {
    trigger: ShutdownTrigger,
    barrier: Arc<Barrier>,
    tasks: Vec<Task>,
}

impl Supervisor {
    /// Create a supervisor with a fresh done signal
    pub fn new() -> Self {
        Self {
            trigger: ShutdownTrigger::new(),
            barrier: Arc::new(Barrier::default()),
            tasks: Vec::new(),
        }
    }

    /// Read-only view of the done signal
    pub fn done_signal(&self) -> DoneSignal {
        self.trigger.signal()
    }

    /// A cloneable trigger, e.g. for a signal handler
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Start a loop on its own thread. The barrier is incremented before
    /// the thread starts and decremented once when it exits.
    pub fn spawn<F>(&mut self, name: impl Into<String>, mut control: MonitorControl, f: F) -> Result<()>
    where
        F: FnOnce(MonitorControl) + Send + 'static,
    {
        let name = name.into();
        let tracker = TaskTracker::new();
        control.attach(tracker.clone());

        self.barrier.register();
        let guard = CompletionGuard {
            barrier: Arc::clone(&self.barrier),
            tracker: tracker.clone(),
        };

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            f(control);
        });

        match spawned {
            Ok(handle) => {
                self.tasks.push(Task {
                    name,
                    tracker,
                    handle: Some(handle),
                });
                Ok(())
            }
            // The closure, and with it the guard, was dropped; the barrier is already balanced.
            Err(err) => Err(ReservoirError::stage(name, format!("failed to spawn thread: {err}"))),
        }
    }

    /// Number of loops that have not exited yet
    pub fn outstanding(&self) -> usize {
        *self.barrier.outstanding.lock()
    }

    /// State of every loop, in start order
    pub fn task_states(&self) -> Vec<(String, LoopState)> {
        self.tasks
            .iter()
            .map(|task| (task.name.clone(), task.tracker.state()))
            .collect()
    }

    /// Tracker of the named loop
    pub fn tracker(&self, name: &str) -> Option<TaskTracker> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .map(|task| task.tracker.clone())
    }

    /// Names of loops that have not stopped
    pub fn stuck(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|task| task.tracker.state() != LoopState::Stopped)
            .map(|task| task.name.clone())
            .collect()
    }

    /// Block until the barrier reaches zero or `timeout` expires.
    /// Returns whether it reached zero. Does not assert the done signal.
    pub fn await_barrier(&self, timeout: Option<Duration>) -> bool {
        self.barrier.wait_until(timeout.map(|t| Instant::now() + t))
    }

    /// Assert the done signal, then wait for every loop to exit
    pub fn shutdown(&mut self) -> Result<()> {
        self.trigger.assert();
        self.wait()
    }

    /// Assert the done signal, then wait at most `timeout` for every loop to exit
    pub fn shutdown_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.trigger.assert();
        self.wait_timeout(timeout)
    }

    /// Wait for every loop to exit without asserting the done signal
    pub fn wait(&mut self) -> Result<()> {
        self.barrier.wait_until(None);
        self.join()
    }

    /// Wait at most `timeout` for every loop to exit. On expiry the loops
    /// still running are reported as a liveness fault.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<()> {
        if !self.await_barrier(Some(timeout)) {
            let stuck = self.stuck();
            tracing::error!(?stuck, "shutdown deadline expired");
            return Err(ReservoirError::ShutdownTimeout { stuck });
        }
        self.join()
    }

    /// Join every exited thread. Call only once the barrier is zero.
    pub fn join(&mut self) -> Result<()> {
        let mut first_panic = None;
        for task in &mut self.tasks {
            if let Some(handle) = task.handle.take() {
                if handle.join().is_err() {
                    tracing::error!(task = %task.name, "loop panicked");
                    first_panic.get_or_insert_with(|| task.name.clone());
                }
            }
        }
        match first_panic {
            Some(name) => Err(ReservoirError::TaskPanicked(name)),
            None => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Unjoined loops are detached but still told to stop.
        self.trigger.assert();
    }
}
