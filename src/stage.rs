use crate::backpressure::BackpressureController;
use crate::config::RuntimeConfig;
use crate::error::{QueueError, ReservoirError, Result};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::monitor::MonitorControl;
use crate::queue::{Consumer, Producer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Position of a stage in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// No input, one output
    Source,
    /// One input, one output
    Transform,
    /// One or more inputs, no output
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Transform => f.write_str("transform"),
            Role::Sink => f.write_str("sink"),
        }
    }
}

/// Outcome of one unit of source work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced<T> {
    /// A new item for the pipeline
    Item(T),
    /// Nothing available right now; the runner waits one poll interval
    Idle,
    /// The external source has ended; the runner drains and closes its output
    Exhausted,
}

/// A pipeline entry point. `produce` must return within a bounded time so
/// the runner can keep checking the done signal.
pub trait Source: Send + 'static {
    type Item: Send + 'static;

    /// Perform one unit of work
    fn produce(&mut self) -> Result<Produced<Self::Item>>;

    /// Called before the stage starts processing
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "source"
    }
}

/// Consumes one queue and produces to another. Returning `None` filters
/// the item out.
pub trait Transform: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn transform(&mut self, input: Self::Input) -> Result<Option<Self::Output>>;

    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "transform"
    }
}

/// A pipeline exit point
pub trait Sink: Send + 'static {
    type Item: Send + 'static;

    fn consume(&mut self, item: Self::Item) -> Result<()>;

    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sink"
    }
}

/// Observable descriptor of a stage, shared between its loop and the
/// orchestrator
#[derive(Debug, Clone)]
pub struct StageHandle {
    name: String,
    role: Role,
    running: Arc<AtomicBool>,
    metrics: StageMetrics,
}

impl StageHandle {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            running: Arc::new(AtomicBool::new(false)),
            metrics: StageMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True from loop entry until loop exit
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Pull the current snapshot
    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn clear_stats(&self) {
        self.metrics.clear();
    }
}

/// Drives one stage: pulls from its inputs, calls the stage logic, pushes
/// to its output, and services the monitor bundle between units of work.
///
/// Every blocking queue operation is bounded by the poll interval, so the
/// done signal is checked at least once per interval. When the signal is
/// observed while an item is waiting for space in the output queue, that
/// item gets at most one more interval before it is abandoned and counted
/// as dropped.
pub struct StageRunner {
    handle: StageHandle,
    control: MonitorControl,
    poll_interval: Duration,
    last_emit: Instant,
    backpressure: Option<BackpressureController>,
}

impl StageRunner {
    pub fn new(handle: &StageHandle, control: MonitorControl, config: &RuntimeConfig) -> Self {
        Self {
            handle: handle.clone(),
            control,
            poll_interval: config.poll_interval(),
            last_emit: Instant::now(),
            backpressure: None,
        }
    }

    /// Hold a source back while its output queue is above the high watermark
    pub fn with_backpressure(mut self, controller: BackpressureController) -> Self {
        self.backpressure = Some(controller);
        self
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.handle.metrics
    }

    /// Run a source until the done signal or the source is exhausted
    pub fn run_source<T: Send + 'static>(
        mut self,
        mut source: Box<dyn Source<Item = T>>,
        output: Producer<T>,
    ) {
        let _running = self.enter();
        if self.start_hook(source.on_start()) {
            loop {
                if self.should_stop() {
                    break;
                }
                self.service_monitor();

                let held = self
                    .backpressure
                    .as_ref()
                    .is_some_and(|bp| bp.check_and_update(output.utilization()));
                if held {
                    self.control.done().wait_timeout(self.poll_interval);
                    continue;
                }

                match source.produce() {
                    Ok(Produced::Item(item)) => {
                        if !self.forward(&output, item) {
                            break;
                        }
                    }
                    Ok(Produced::Idle) => {
                        self.control.done().wait_timeout(self.poll_interval);
                    }
                    Ok(Produced::Exhausted) => {
                        tracing::debug!(stage = %self.handle.name, "source exhausted");
                        self.control.observe_done();
                        break;
                    }
                    Err(err) => {
                        self.fail(err);
                        self.control.done().wait_timeout(self.poll_interval);
                    }
                }
            }
        }

        self.control.begin_draining();
        self.shutdown_hook(source.on_shutdown());
        output.close();
        self.exit();
    }

    /// Run a transform until the done signal or its input is closed and drained
    pub fn run_transform<I: Send + 'static, O: Send + 'static>(
        mut self,
        mut stage: Box<dyn Transform<Input = I, Output = O>>,
        input: Consumer<I>,
        output: Producer<O>,
    ) {
        let _running = self.enter();
        if self.start_hook(stage.on_start()) {
            loop {
                if self.should_stop() {
                    break;
                }
                self.service_monitor();

                match input.get_timeout(self.poll_interval) {
                    Ok(Some(item)) => {
                        self.handle.metrics.record_received();
                        let start = Instant::now();
                        match stage.transform(item) {
                            Ok(Some(out)) => {
                                self.record_latency(start);
                                if !self.forward(&output, out) {
                                    break;
                                }
                            }
                            Ok(None) => {
                                self.record_latency(start);
                                self.handle.metrics.record_filtered();
                            }
                            Err(err) => self.fail(err),
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        tracing::debug!(stage = %self.handle.name, input = %input.name(), "input drained");
                        self.control.observe_done();
                        break;
                    }
                }
            }
        }

        self.control.begin_draining();
        self.shutdown_hook(stage.on_shutdown());
        output.close();
        self.exit();
    }

    /// Run a sink until the done signal or every input is closed and drained.
    /// Inputs are swept round-robin; there is no ordering across them.
    pub fn run_sink<T: Send + 'static>(
        mut self,
        mut sink: Box<dyn Sink<Item = T>>,
        inputs: Vec<Consumer<T>>,
    ) {
        let _running = self.enter();
        let mut live = inputs;
        let mut next = 0usize;

        if self.start_hook(sink.on_start()) {
            loop {
                if self.should_stop() {
                    break;
                }
                self.service_monitor();

                if live.is_empty() {
                    tracing::debug!(stage = %self.handle.name, "all inputs drained");
                    self.control.observe_done();
                    break;
                }

                let mut consumed = false;
                let mut idx = 0;
                while idx < live.len() {
                    match live[idx].try_get() {
                        Ok(Some(item)) => {
                            consumed = true;
                            self.consume(sink.as_mut(), item);
                            idx += 1;
                        }
                        Ok(None) => idx += 1,
                        Err(_) => {
                            live.swap_remove(idx);
                        }
                    }
                }

                if !consumed && !live.is_empty() {
                    next %= live.len();
                    match live[next].get_timeout(self.poll_interval) {
                        Ok(Some(item)) => self.consume(sink.as_mut(), item),
                        Ok(None) => {}
                        Err(_) => {
                            live.swap_remove(next);
                        }
                    }
                    next = next.wrapping_add(1);
                }
            }
        }

        self.control.begin_draining();
        self.shutdown_hook(sink.on_shutdown());
        self.exit();
    }

    fn enter(&self) -> RunningFlag {
        self.handle.running.store(true, Ordering::Release);
        self.control.enter_running();
        tracing::info!(stage = %self.handle.name, role = %self.handle.role, "stage started");
        RunningFlag(Arc::clone(&self.handle.running))
    }

    fn should_stop(&self) -> bool {
        if self.control.is_done() {
            self.control.observe_done();
            tracing::debug!(stage = %self.handle.name, "done signal observed");
            return true;
        }
        false
    }

    fn service_monitor(&mut self) {
        if self.control.take_clear_request() {
            self.handle.metrics.clear();
            tracing::debug!(stage = %self.handle.name, "stats cleared");
        }
        if self.last_emit.elapsed() >= self.control.stats_interval() {
            self.control.emit(&self.handle.metrics.snapshot());
            self.last_emit = Instant::now();
        }
    }

    /// Put one item, re-checking the done signal after every bounded wait.
    /// Returns false once the output can no longer accept items.
    fn forward<T>(&self, output: &Producer<T>, mut item: T) -> bool {
        loop {
            match output.put_timeout(item, self.poll_interval) {
                Ok(None) => {
                    self.handle.metrics.record_emitted();
                    return true;
                }
                Ok(Some(back)) => {
                    if self.control.is_done() {
                        self.handle.metrics.record_dropped();
                        tracing::debug!(stage = %self.handle.name, "in-flight item abandoned");
                        return true;
                    }
                    item = back;
                }
                Err(QueueError::Full { .. }) => {
                    self.handle.metrics.record_dropped();
                    return true;
                }
                Err(err) => {
                    self.handle.metrics.record_dropped();
                    self.control.report_error(err.to_string());
                    return false;
                }
            }
        }
    }

    fn consume<T: Send + 'static>(&self, sink: &mut dyn Sink<Item = T>, item: T) {
        self.handle.metrics.record_received();
        let start = Instant::now();
        match sink.consume(item) {
            Ok(()) => {
                self.record_latency(start);
                self.handle.metrics.record_emitted();
            }
            Err(err) => self.fail(err),
        }
    }

    fn record_latency(&self, start: Instant) {
        self.handle
            .metrics
            .record_latency(start.elapsed().as_nanos() as u64);
    }

    fn fail(&self, err: ReservoirError) {
        self.handle.metrics.record_error();
        self.control.report_error(err.to_string());
    }

    fn start_hook(&self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(stage = %self.handle.name, error = %err, "stage failed to start");
                self.fail(err);
                false
            }
        }
    }

    fn shutdown_hook(&self, result: Result<()>) {
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn exit(self) {
        self.control.emit_final(&self.handle.metrics.snapshot());
        tracing::info!(stage = %self.handle.name, "stage stopped");
    }
}

/// Lowers the running flag when the loop returns or unwinds
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Emits the items of an iterator, then reports exhaustion
pub struct IterSource<I> {
    name: String,
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(name: impl Into<String>, iter: I) -> Self {
        Self {
            name: name.into(),
            iter,
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn produce(&mut self) -> Result<Produced<I::Item>> {
        Ok(self.iter.next().map_or(Produced::Exhausted, Produced::Item))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A simple pass-through stage
pub struct PassthroughStage<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> PassthroughStage<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for PassthroughStage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Transform for PassthroughStage<T> {
    type Input = T;
    type Output = T;

    fn transform(&mut self, input: T) -> Result<Option<T>> {
        Ok(Some(input))
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A filtering stage that passes through items matching a predicate
pub struct FilterStage<T, F> {
    name: String,
    predicate: F,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> FilterStage<T, F>
where
    F: FnMut(&T) -> bool + Send + 'static,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
            _item: PhantomData,
        }
    }
}

impl<T, F> Transform for FilterStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    type Input = T;
    type Output = T;

    fn transform(&mut self, input: T) -> Result<Option<T>> {
        Ok((self.predicate)(&input).then_some(input))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A mapping stage that transforms each item
pub struct MapStage<I, O, F> {
    name: String,
    mapper: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> MapStage<I, O, F>
where
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
            _types: PhantomData,
        }
    }
}

impl<I, O, F> Transform for MapStage<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Result<O> + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn transform(&mut self, input: I) -> Result<Option<O>> {
        (self.mapper)(input).map(Some)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Collects every consumed item into a shared vector
pub struct CollectSink<T> {
    name: String,
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectSink<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of the collected items; stays valid after the sink is moved
    pub fn items(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T: Send + 'static> Sink for CollectSink<T> {
    type Item = T;

    fn consume(&mut self, item: T) -> Result<()> {
        self.items.lock().push(item);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Hands every item to a closure
pub struct FnSink<T, F> {
    name: String,
    f: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> FnSink<T, F>
where
    F: FnMut(T) -> Result<()> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _item: PhantomData,
        }
    }
}

impl<T, F> Sink for FnSink<T, F>
where
    T: Send + 'static,
    F: FnMut(T) -> Result<()> + Send + 'static,
{
    type Item = T;

    fn consume(&mut self, item: T) -> Result<()> {
        (self.f)(item)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OverflowPolicy, Queue};
    use crate::shutdown::ShutdownTrigger;
    use std::thread;

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_stats_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_passthrough_stage() {
        let mut stage = PassthroughStage::new();
        assert_eq!(stage.transform(vec![1, 2, 3]).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_filter_stage() {
        let mut stage = FilterStage::new("test_filter", |data: &u8| *data > 5);
        assert_eq!(stage.transform(3).unwrap(), None);
        assert_eq!(stage.transform(7).unwrap(), Some(7));
    }

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("test_map", |data: u8| Ok(u16::from(data) * 2));
        assert_eq!(stage.transform(5).unwrap(), Some(10));
    }

    #[test]
    fn test_iter_source_exhausts() {
        let mut source = IterSource::new("numbers", 0..2);
        assert_eq!(source.produce().unwrap(), Produced::Item(0));
        assert_eq!(source.produce().unwrap(), Produced::Item(1));
        assert_eq!(source.produce().unwrap(), Produced::Exhausted);
    }

    #[test]
    fn test_stage_runner_metrics() {
        let handle = StageHandle::new("stage", Role::Transform);
        let trigger = ShutdownTrigger::new();
        let control = MonitorControl::new("stage", trigger.signal());
        let runner = StageRunner::new(&handle, control, &RuntimeConfig::default());
        assert_eq!(runner.metrics().total_received(), 0);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_transform_propagates_close_downstream() {
        let input = Queue::unbounded("in");
        let output = Queue::unbounded("out");
        for i in 0..10u32 {
            input.put(i).unwrap();
        }
        input.close();

        let trigger = ShutdownTrigger::new();
        let handle = StageHandle::new("evens", Role::Transform);
        let control = MonitorControl::new("evens", trigger.signal());
        let runner = StageRunner::new(&handle, control, &fast_config());
        let consumer = input.consumer();
        let producer = output.producer().unwrap();
        let stage = FilterStage::new("evens", |n: &u32| n % 2 == 0);

        thread::spawn(move || runner.run_transform(Box::new(stage), consumer, producer))
            .join()
            .unwrap();

        assert!(output.is_closed());
        let mut seen = Vec::new();
        while let Ok(item) = output.get() {
            seen.push(item);
        }
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);
        let stats = handle.stats();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.emitted, 5);
        assert_eq!(stats.filtered, 5);
        assert!(!handle.is_running());
    }

    #[test]
    fn test_panicking_transform_lowers_running_flag() {
        let input = Queue::unbounded("in");
        let output: Queue<u32> = Queue::unbounded("out");
        input.put(1u32).unwrap();

        let trigger = ShutdownTrigger::new();
        let handle = StageHandle::new("boom", Role::Transform);
        let control = MonitorControl::new("boom", trigger.signal());
        let runner = StageRunner::new(&handle, control, &fast_config());
        let consumer = input.consumer();
        let producer = output.producer().unwrap();
        let stage = MapStage::new("boom", |_: u32| -> Result<u32> { panic!("stage bug") });

        let joined =
            thread::spawn(move || runner.run_transform(Box::new(stage), consumer, producer)).join();

        assert!(joined.is_err());
        assert!(!handle.is_running());
        assert!(output.is_closed());
    }

    #[test]
    fn test_source_stops_on_done_while_blocked() {
        let output = Queue::bounded("out", 1, OverflowPolicy::Block);
        let trigger = ShutdownTrigger::new();
        let handle = StageHandle::new("numbers", Role::Source);
        let control = MonitorControl::new("numbers", trigger.signal());
        let runner = StageRunner::new(&handle, control, &fast_config());
        let producer = output.producer().unwrap();

        let join = thread::spawn(move || {
            runner.run_source(Box::new(IterSource::new("numbers", 0u64..)), producer)
        });

        while output.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        // Let the source block on the full queue with its second item.
        thread::sleep(Duration::from_millis(20));
        trigger.assert();
        join.join().unwrap();

        assert!(output.is_closed());
        assert!(!handle.is_running());
        assert_eq!(handle.stats().emitted, 1);
        assert_eq!(handle.stats().dropped, 1);
    }

    #[test]
    fn test_sink_errors_are_reported_not_fatal() {
        let input = Queue::unbounded("in");
        for i in 0..4u8 {
            input.put(i).unwrap();
        }
        input.close();

        let trigger = ShutdownTrigger::new();
        let (control, monitor) =
            MonitorControl::channel("picky", trigger.signal(), &fast_config());
        let handle = StageHandle::new("picky", Role::Sink);
        let runner = StageRunner::new(&handle, control, &fast_config());
        let sink = FnSink::new("picky", |n: u8| {
            if n % 2 == 1 {
                Err(ReservoirError::stage("picky", format!("odd item {n}")))
            } else {
                Ok(())
            }
        });

        runner.run_sink(Box::new(sink), vec![input.consumer()]);

        let stats = handle.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(monitor.drain_errors().len(), 2);
        let reports = monitor.drain_stats();
        assert!(reports.last().is_some_and(|r| r.terminal));
    }

    #[test]
    fn test_backpressure_holds_source() {
        let output = Queue::bounded("out", 10, OverflowPolicy::Block);
        let trigger = ShutdownTrigger::new();
        let handle = StageHandle::new("numbers", Role::Source);
        let control = MonitorControl::new("numbers", trigger.signal());
        let runner = StageRunner::new(&handle, control, &fast_config())
            .with_backpressure(BackpressureController::with_watermarks(50, 20));
        let producer = output.producer().unwrap();

        let join = thread::spawn(move || {
            runner.run_source(Box::new(IterSource::new("numbers", 0u64..)), producer)
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(output.len(), 5);
        trigger.assert();
        join.join().unwrap();
    }
}
