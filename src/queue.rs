//! Thread-safe FIFO queue with close/drain semantics.
//!
//! Contents, the closed flag and the statistics counters sit behind one
//! lock, so every operation (including `clear`, `peek` and the stats reads)
//! is atomic with respect to every other. Two condition variables wake
//! blocked getters and putters.
//!
//! A queue is shared by exactly one producer and any number of consumers.
//! Outside this crate, putting and closing go through the single
//! [`Producer`] handle; a [`Queue`] or [`Consumer`] can only read, clear
//! and observe.
//!
//! ```compile_fail
//! use reservoir::Queue;
//!
//! let queue: Queue<u8> = Queue::unbounded("q");
//! queue.close();
//! ```
//!
//! ```compile_fail
//! use reservoir::Queue;
//!
//! let queue: Queue<u8> = Queue::unbounded("q");
//! queue.put(1).unwrap();
//! ```
//!
//! ```
//! use reservoir::Queue;
//!
//! let queue: Queue<u8> = Queue::unbounded("q");
//! let producer = queue.producer().unwrap();
//! producer.put(1).unwrap();
//! drop(producer);
//! assert!(queue.is_closed());
//! assert_eq!(queue.get().unwrap(), 1);
//! ```

use crate::config::QueueConfig;
use crate::error::{QueueError, ReservoirError, Result};
use crate::monitor::MonitorControl;
use crossbeam::channel::{self, Receiver};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Determines how a bounded queue handles a put when full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until space frees up
    Block,
    /// Fail with a capacity error
    Reject,
    /// Evict the oldest item to make space
    DropOldest,
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    /// -1 when unbounded
    pub capacity: isize,
    /// Current number of queued items
    pub depth: usize,
    pub closed: bool,
    /// Items accepted by put since the last stats reset
    pub put: u64,
    /// Items removed by get since the last stats reset
    pub got: u64,
    /// Items evicted by the drop-oldest policy
    pub dropped: u64,
    /// Puts refused by the reject policy
    pub rejected: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    put: u64,
    got: u64,
    dropped: u64,
    rejected: u64,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    counters: Counters,
}

#[derive(Debug)]
struct Shared<T> {
    name: String,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    producer_taken: AtomicBool,
    consumer_taken: AtomicBool,
}

#[derive(Clone, Copy)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

/// A named, optionally bounded FIFO queue. Cloning yields another handle
/// to the same queue.
#[derive(Debug)]
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Queue<T> {
    /// Create a queue. A bounded capacity of zero is treated as one.
    pub fn new(name: impl Into<String>, capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                capacity,
                policy,
                state: Mutex::new(State {
                    items: capacity.map_or_else(VecDeque::new, VecDeque::with_capacity),
                    closed: false,
                    counters: Counters::default(),
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                producer_taken: AtomicBool::new(false),
                consumer_taken: AtomicBool::new(false),
            }),
        }
    }

    pub fn bounded(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self::new(name, Some(capacity), policy)
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None, OverflowPolicy::Block)
    }

    pub fn with_config(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self::new(name, config.capacity, config.overflow)
    }

    /// Queue factory: build from an opaque JSON configuration payload
    pub fn from_config(name: impl Into<String>, payload: &str) -> Result<Self> {
        let config = QueueConfig::from_json(payload)?;
        Ok(Self::with_config(name, &config))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Put an item, blocking under the block policy while full
    pub(crate) fn put(&self, item: T) -> std::result::Result<(), QueueError> {
        self.put_inner(item, Wait::Forever).map(|_| ())
    }

    /// Put an item, waiting at most `timeout` for space.
    /// Returns the item back if the wait expired.
    pub(crate) fn put_timeout(&self, item: T, timeout: Duration) -> std::result::Result<Option<T>, QueueError> {
        self.put_inner(item, Wait::Until(Instant::now() + timeout))
    }

    /// Put without waiting. Returns the item back if the queue is full
    /// under the block policy.
    pub(crate) fn try_put(&self, item: T) -> std::result::Result<Option<T>, QueueError> {
        self.put_inner(item, Wait::Never)
    }

    fn put_inner(&self, item: T, wait: Wait) -> std::result::Result<Option<T>, QueueError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.closed {
                return Err(QueueError::Closed(shared.name.clone()));
            }
            let full = shared
                .capacity
                .is_some_and(|capacity| state.items.len() >= capacity);
            if !full {
                break;
            }
            match shared.policy {
                OverflowPolicy::Reject => {
                    state.counters.rejected = state.counters.rejected.saturating_add(1);
                    return Err(QueueError::Full {
                        name: shared.name.clone(),
                        capacity: shared.capacity.unwrap_or_default(),
                    });
                }
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    state.counters.dropped = state.counters.dropped.saturating_add(1);
                }
                OverflowPolicy::Block => match wait {
                    Wait::Never => return Ok(Some(item)),
                    Wait::Forever => shared.not_full.wait(&mut state),
                    Wait::Until(deadline) => {
                        if shared.not_full.wait_until(&mut state, deadline).timed_out()
                            && !state.closed
                            && shared.capacity.is_some_and(|c| state.items.len() >= c)
                        {
                            return Ok(Some(item));
                        }
                    }
                },
            }
        }

        state.items.push_back(item);
        state.counters.put = state.counters.put.saturating_add(1);
        drop(state);
        shared.not_empty.notify_one();
        Ok(None)
    }

    /// Get the next item, blocking while the queue is empty and open.
    /// Fails with [`QueueError::Drained`] once closed and empty.
    pub fn get(&self) -> std::result::Result<T, QueueError> {
        match self.get_inner(Wait::Forever)? {
            Some(item) => Ok(item),
            // Forever only returns once an item arrives or the queue drains.
            None => Err(QueueError::Drained(self.shared.name.clone())),
        }
    }

    /// Non-blocking get: `Ok(None)` means empty but still open
    pub fn try_get(&self) -> std::result::Result<Option<T>, QueueError> {
        self.get_inner(Wait::Never)
    }

    /// Get, waiting at most `timeout`: `Ok(None)` means the wait expired
    pub fn get_timeout(&self, timeout: Duration) -> std::result::Result<Option<T>, QueueError> {
        self.get_inner(Wait::Until(Instant::now() + timeout))
    }

    fn get_inner(&self, wait: Wait) -> std::result::Result<Option<T>, QueueError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                state.counters.got = state.counters.got.saturating_add(1);
                drop(state);
                shared.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Err(QueueError::Drained(shared.name.clone()));
            }
            match wait {
                Wait::Never => return Ok(None),
                Wait::Forever => shared.not_empty.wait(&mut state),
                Wait::Until(deadline) => {
                    if shared.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                        && !state.closed
                    {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Number of queued items. Advisory: may be stale on return.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity, or -1 when unbounded
    pub fn cap(&self) -> isize {
        self.shared.capacity.map_or(-1, |c| c as isize)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Fill level as a percentage (0-100); `None` when unbounded
    pub fn utilization(&self) -> Option<u32> {
        let capacity = self.shared.capacity?;
        Some(((self.len() * 100) / capacity).min(100) as u32)
    }

    /// Discard every queued item. Closed state and capacity are untouched.
    /// Blocked getters stay blocked until the next put. Returns the number
    /// of items discarded.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.shared.state.lock();
            let cleared = state.items.len();
            state.items.clear();
            cleared
        };
        self.shared.not_full.notify_all();
        cleared
    }

    /// Close the queue. Closing twice is a no-op. Wakes every blocked
    /// getter and putter.
    pub(crate) fn close(&self) {
        let newly_closed = {
            let mut state = self.shared.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            tracing::debug!(queue = %self.shared.name, "queue closed");
            self.shared.not_empty.notify_all();
            self.shared.not_full.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Closed and empty: no item will ever be returned again
    pub fn is_drained(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed && state.items.is_empty()
    }

    /// Consistent snapshot of counters and state
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            name: self.shared.name.clone(),
            capacity: self.cap(),
            depth: state.items.len(),
            closed: state.closed,
            put: state.counters.put,
            got: state.counters.got,
            dropped: state.counters.dropped,
            rejected: state.counters.rejected,
        }
    }

    /// Reset counters to zero without touching queued items
    pub fn clear_stats(&self) {
        self.shared.state.lock().counters = Counters::default();
    }

    /// Hand out the single producer handle
    pub fn producer(&self) -> Result<Producer<T>> {
        if self.shared.producer_taken.swap(true, Ordering::AcqRel) {
            return Err(ReservoirError::ProducerTaken(self.shared.name.clone()));
        }
        Ok(Producer {
            queue: self.clone(),
        })
    }

    pub fn has_producer(&self) -> bool {
        self.shared.producer_taken.load(Ordering::Acquire)
    }

    /// Hand out a consumer handle; any number may exist
    pub fn consumer(&self) -> Consumer<T> {
        self.shared.consumer_taken.store(true, Ordering::Release);
        Consumer {
            queue: self.clone(),
        }
    }

    /// Whether a consumer handle was ever handed out
    pub fn has_consumer(&self) -> bool {
        self.shared.consumer_taken.load(Ordering::Acquire)
    }

    /// Closed with nobody to drain it
    fn is_orphaned(&self) -> bool {
        self.is_closed() && !self.has_consumer()
    }

    /// Monitor loop for this queue. Pushes a stats snapshot every stats
    /// interval, resets stats on a clear request, and returns once the
    /// done signal is asserted or the queue is closed and either drained
    /// or without any consumer. Sends a terminal snapshot before returning.
    pub fn monitor(&self, control: &MonitorControl) {
        let interval = control.stats_interval().max(Duration::from_millis(1));
        let never = channel::never();
        let mut clear_open = control.has_clear();

        control.enter_running();
        tracing::debug!(queue = %self.shared.name, "queue monitor started");

        loop {
            let clear_rx: &Receiver<()> = match control.clear_receiver() {
                Some(rx) if clear_open => rx,
                _ => &never,
            };
            crossbeam::select! {
                recv(control.done().receiver()) -> _ => {
                    control.observe_done();
                    break;
                }
                recv(clear_rx) -> request => match request {
                    Ok(()) => {
                        self.clear_stats();
                        tracing::debug!(queue = %self.shared.name, "queue stats cleared");
                    }
                    // Orchestrator went away; stop listening for clears.
                    Err(_) => clear_open = false,
                },
                default(interval) => {
                    control.emit(&self.stats());
                    if self.is_drained() {
                        control.observe_done();
                        break;
                    }
                    if self.is_orphaned() {
                        tracing::warn!(
                            queue = %self.shared.name,
                            depth = self.len(),
                            "closed queue has no consumer, monitor stopping"
                        );
                        control.observe_done();
                        break;
                    }
                }
            }
        }

        control.begin_draining();
        control.emit_final(&self.stats());
        tracing::debug!(queue = %self.shared.name, "queue monitor stopped");
    }
}

impl<T: Clone> Queue<T> {
    /// Copy of the next item without removing it.
    /// `Ok(None)` means empty but still open.
    pub fn peek(&self) -> std::result::Result<Option<T>, QueueError> {
        let state = self.shared.state.lock();
        match state.items.front() {
            Some(item) => Ok(Some(item.clone())),
            None if state.closed => Err(QueueError::Drained(self.shared.name.clone())),
            None => Ok(None),
        }
    }
}

/// The single writing end of a queue. Dropping it closes the queue.
#[derive(Debug)]
pub struct Producer<T> {
    queue: Queue<T>,
}

impl<T> Producer<T> {
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn put(&self, item: T) -> std::result::Result<(), QueueError> {
        self.queue.put(item)
    }

    pub fn put_timeout(&self, item: T, timeout: Duration) -> std::result::Result<Option<T>, QueueError> {
        self.queue.put_timeout(item, timeout)
    }

    pub fn try_put(&self, item: T) -> std::result::Result<Option<T>, QueueError> {
        self.queue.try_put(item)
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn cap(&self) -> isize {
        self.queue.cap()
    }

    pub fn utilization(&self) -> Option<u32> {
        self.queue.utilization()
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// A reading end of a queue. Cannot close it.
#[derive(Debug)]
pub struct Consumer<T> {
    queue: Queue<T>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> Consumer<T> {
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn get(&self) -> std::result::Result<T, QueueError> {
        self.queue.get()
    }

    pub fn try_get(&self) -> std::result::Result<Option<T>, QueueError> {
        self.queue.try_get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> std::result::Result<Option<T>, QueueError> {
        self.queue.get_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn cap(&self) -> isize {
        self.queue.cap()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_drained()
    }
}

impl<T: Clone> Consumer<T> {
    pub fn peek(&self) -> std::result::Result<Option<T>, QueueError> {
        self.queue.peek()
    }
}
