use crate::backpressure::BackpressureController;
use crate::config::{QueueConfig, RuntimeConfig};
use crate::error::{ReservoirError, Result};
use crate::metrics::MetricsSnapshot;
use crate::monitor::{ErrorReport, MonitorControl, MonitorHandle, StatsReport};
use crate::queue::{Consumer, Producer, Queue, QueueStats};
use crate::registry::Registry;
use crate::shutdown::{LoopState, Supervisor};
use crate::stage::{Role, StageHandle, StageRunner};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// A queue declaration in the pipeline builder
struct QueueDecl {
    name: String,
    source: QueueSource,
}

/// Where a declared queue comes from
enum QueueSource {
    Config(QueueConfig),
    Kind { kind: String, config: String },
}

/// A stage declaration in the pipeline builder
struct StageDecl {
    name: String,
    role: Role,
    kind: String,
    config: String,
    inputs: Vec<String>,
    output: Option<String>,
}

/// Builder for wiring named stages to named queues
pub struct PipelineBuilder<T> {
    registry: Registry<T>,
    queues: Vec<QueueDecl>,
    stages: Vec<StageDecl>,
    runtime: RuntimeConfig,
    backpressure: Option<(u32, u32)>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn new(registry: Registry<T>) -> Self {
        Self {
            registry,
            queues: Vec::new(),
            stages: Vec::new(),
            runtime: RuntimeConfig::default(),
            backpressure: None,
        }
    }

    /// Declare a queue
    pub fn queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.push(QueueDecl {
            name: name.into(),
            source: QueueSource::Config(config),
        });
        self
    }

    /// Declare a queue built by a registered queue factory
    pub fn queue_kind(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        self.queues.push(QueueDecl {
            name: name.into(),
            source: QueueSource::Kind {
                kind: kind.into(),
                config: config.into(),
            },
        });
        self
    }

    /// Add a source producing into `output`
    pub fn source(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        config: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.stages.push(StageDecl {
            name: name.into(),
            role: Role::Source,
            kind: kind.into(),
            config: config.into(),
            inputs: Vec::new(),
            output: Some(output.into()),
        });
        self
    }

    /// Add a transform consuming `input` and producing into `output`
    pub fn transform(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        config: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.stages.push(StageDecl {
            name: name.into(),
            role: Role::Transform,
            kind: kind.into(),
            config: config.into(),
            inputs: vec![input.into()],
            output: Some(output.into()),
        });
        self
    }

    /// Add a sink consuming every queue in `inputs`
    pub fn sink(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        config: impl Into<String>,
        inputs: &[&str],
    ) -> Self {
        self.stages.push(StageDecl {
            name: name.into(),
            role: Role::Sink,
            kind: kind.into(),
            config: config.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: None,
        });
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Hold sources back while their output is above `high` percent full
    pub fn with_backpressure(mut self, high: u32, low: u32) -> Self {
        self.backpressure = Some((high, low));
        self
    }

    /// Validate the topology and create the queues
    pub fn build(self) -> Result<Pipeline<T>> {
        if self.stages.is_empty() {
            return Err(ReservoirError::NoStages);
        }
        self.runtime.validate()?;

        let mut queues = BTreeMap::new();
        for decl in &self.queues {
            if queues.contains_key(&decl.name) {
                return Err(ReservoirError::Topology(format!(
                    "duplicate queue `{}`",
                    decl.name
                )));
            }
            let queue = match &decl.source {
                QueueSource::Config(config) => {
                    config.validate()?;
                    Queue::with_config(&decl.name, config)
                }
                QueueSource::Kind { kind, config } => {
                    self.registry.build_queue(kind, &decl.name, config)?
                }
            };
            queues.insert(decl.name.clone(), queue);
        }

        let mut stage_names = HashSet::new();
        let mut produced = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(ReservoirError::Topology(format!(
                    "duplicate stage `{}`",
                    stage.name
                )));
            }
            if stage.role == Role::Sink && stage.inputs.is_empty() {
                return Err(ReservoirError::Topology(format!(
                    "sink `{}` has no inputs",
                    stage.name
                )));
            }
            for queue in stage.inputs.iter().chain(&stage.output) {
                if !queues.contains_key(queue) {
                    return Err(ReservoirError::Topology(format!(
                        "stage `{}` references unknown queue `{queue}`",
                        stage.name
                    )));
                }
            }
            if let Some(output) = &stage.output {
                if !produced.insert(output.as_str()) {
                    return Err(ReservoirError::Topology(format!(
                        "queue `{output}` has more than one producer"
                    )));
                }
            }
        }

        Ok(Pipeline {
            registry: self.registry,
            queues,
            stages: self.stages,
            runtime: self.runtime,
            backpressure: self.backpressure,
        })
    }
}

/// An assembled pipeline that has not started yet
pub struct Pipeline<T> {
    registry: Registry<T>,
    queues: BTreeMap<String, Queue<T>>,
    stages: Vec<StageDecl>,
    runtime: RuntimeConfig,
    backpressure: Option<(u32, u32)>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Feed a queue from outside. Only possible for a queue no stage produces into.
    pub fn producer(&self, queue: &str) -> Result<Producer<T>> {
        if self.stages.iter().any(|s| s.output.as_deref() == Some(queue)) {
            return Err(ReservoirError::ProducerTaken(queue.to_string()));
        }
        self.lookup(queue)?.producer()
    }

    /// Read a queue from outside, e.g. to tap a pipeline's final output
    pub fn consumer(&self, queue: &str) -> Result<Consumer<T>> {
        Ok(self.lookup(queue)?.consumer())
    }

    pub fn queue(&self, name: &str) -> Option<&Queue<T>> {
        self.queues.get(name)
    }

    fn lookup(&self, queue: &str) -> Result<&Queue<T>> {
        self.queues
            .get(queue)
            .ok_or_else(|| ReservoirError::Topology(format!("unknown queue `{queue}`")))
    }

    /// Construct every stage and start its loop, plus one monitor loop per
    /// queue. A stage whose factory fails is left out and recorded; the rest
    /// of the pipeline still starts. Queues left without a producer are
    /// closed so their consumers drain and stop. Queues left without a
    /// consumer are recorded as orphaned; their monitors stop once they
    /// close instead of waiting for a drain that never comes.
    pub fn start(self) -> Result<RunningPipeline<T>> {
        let mut supervisor = Supervisor::new();
        let mut stages = Vec::new();
        let mut monitors = Vec::new();
        let mut construction_errors = Vec::new();
        let mut orphaned = Vec::new();

        for decl in &self.stages {
            match self.start_stage(decl, &mut supervisor) {
                Ok((handle, monitor)) => {
                    stages.push(handle);
                    monitors.push(monitor);
                }
                Err(err) => {
                    tracing::error!(stage = %decl.name, kind = %decl.kind, error = %err, "stage excluded from pipeline");
                    construction_errors.push(err);
                }
            }
        }

        for (name, queue) in &self.queues {
            if !queue.has_producer() {
                tracing::warn!(queue = %name, "queue has no producer, closing");
                queue.close();
            }
            if !queue.has_consumer() {
                tracing::warn!(queue = %name, "queue has no consumer");
                orphaned.push(name.clone());
            }
            let (control, monitor) =
                MonitorControl::channel(name.clone(), supervisor.done_signal(), &self.runtime);
            let queue = queue.clone();
            supervisor.spawn(format!("queue:{name}"), control, move |control| {
                queue.monitor(&control)
            })?;
            monitors.push(monitor);
        }

        tracing::info!(
            stages = stages.len(),
            queues = self.queues.len(),
            excluded = construction_errors.len(),
            "pipeline started"
        );

        Ok(RunningPipeline {
            supervisor,
            stages,
            monitors,
            queues: self.queues,
            construction_errors,
            orphaned,
            poll_interval: self.runtime.poll_interval(),
        })
    }

    fn start_stage(
        &self,
        decl: &StageDecl,
        supervisor: &mut Supervisor,
    ) -> Result<(StageHandle, MonitorHandle)> {
        let handle = StageHandle::new(&decl.name, decl.role);
        let (control, monitor) =
            MonitorControl::channel(decl.name.clone(), supervisor.done_signal(), &self.runtime);
        let runtime = self.runtime;

        match decl.role {
            Role::Source => {
                let source = self.registry.build_source(&decl.kind, &decl.config)?;
                let output = self.output_of(decl)?;
                let backpressure = self.backpressure;
                let stage = handle.clone();
                supervisor.spawn(decl.name.clone(), control, move |control| {
                    let mut runner = StageRunner::new(&stage, control, &runtime);
                    if let Some((high, low)) = backpressure {
                        runner =
                            runner.with_backpressure(BackpressureController::with_watermarks(high, low));
                    }
                    runner.run_source(source, output)
                })?;
            }
            Role::Transform => {
                let transform = self.registry.build_transform(&decl.kind, &decl.config)?;
                let input = self.consumer(&decl.inputs[0])?;
                let output = self.output_of(decl)?;
                let stage = handle.clone();
                supervisor.spawn(decl.name.clone(), control, move |control| {
                    StageRunner::new(&stage, control, &runtime).run_transform(transform, input, output)
                })?;
            }
            Role::Sink => {
                let sink = self.registry.build_sink(&decl.kind, &decl.config)?;
                let inputs = decl
                    .inputs
                    .iter()
                    .map(|name| self.consumer(name))
                    .collect::<Result<Vec<_>>>()?;
                let stage = handle.clone();
                supervisor.spawn(decl.name.clone(), control, move |control| {
                    StageRunner::new(&stage, control, &runtime).run_sink(sink, inputs)
                })?;
            }
        }

        Ok((handle, monitor))
    }

    fn output_of(&self, decl: &StageDecl) -> Result<Producer<T>> {
        let name = decl
            .output
            .as_deref()
            .ok_or_else(|| ReservoirError::Topology(format!("stage `{}` has no output", decl.name)))?;
        self.lookup(name)?.producer()
    }
}

/// A running pipeline that can be observed and shut down
pub struct RunningPipeline<T> {
    supervisor: Supervisor,
    stages: Vec<StageHandle>,
    monitors: Vec<MonitorHandle>,
    queues: BTreeMap<String, Queue<T>>,
    construction_errors: Vec<ReservoirError>,
    orphaned: Vec<String>,
    poll_interval: Duration,
}

impl<T: Send + 'static> RunningPipeline<T> {
    /// Whether the named stage's loop is running
    pub fn stage_running(&self, name: &str) -> Option<bool> {
        self.stage(name).map(StageHandle::is_running)
    }

    /// Pull the current snapshot of a stage
    pub fn stage_stats(&self, name: &str) -> Option<MetricsSnapshot> {
        self.stage(name).map(StageHandle::stats)
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.queues.get(name).map(Queue::stats)
    }

    pub fn queue(&self, name: &str) -> Option<&Queue<T>> {
        self.queues.get(name)
    }

    /// Lifecycle state of every stage and queue monitor loop
    pub fn loop_states(&self) -> Vec<(String, LoopState)> {
        self.supervisor.task_states()
    }

    /// Ask every stage and queue monitor to reset its statistics
    pub fn clear_stats(&self) {
        for monitor in &self.monitors {
            monitor.request_clear();
        }
    }

    /// Drain every statistics snapshot pushed so far
    pub fn reports(&self) -> Vec<StatsReport> {
        self.monitors
            .iter()
            .flat_map(MonitorHandle::drain_stats)
            .collect()
    }

    /// Drain every error reported so far
    pub fn errors(&self) -> Vec<ErrorReport> {
        self.monitors
            .iter()
            .flat_map(MonitorHandle::drain_errors)
            .collect()
    }

    /// Error reports dropped across every loop because an error channel
    /// was full
    pub fn lost_errors(&self) -> u64 {
        self.monitors.iter().map(MonitorHandle::lost_errors).sum()
    }

    /// Stages excluded because their construction failed
    pub fn construction_errors(&self) -> &[ReservoirError] {
        &self.construction_errors
    }

    /// Queues nothing reads from, usually because their consumer failed
    /// to construct
    pub fn orphaned_queues(&self) -> &[String] {
        &self.orphaned
    }

    fn stage(&self, name: &str) -> Option<&StageHandle> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Assert the done signal and wait for every loop to stop.
    /// Returns every snapshot still queued, terminal ones included.
    pub fn shutdown(self) -> Result<Vec<StatsReport>> {
        self.supervisor.trigger().assert();
        self.finish(None)
    }

    /// Like [`shutdown`](Self::shutdown), but reports stuck loops once
    /// `timeout` expires.
    pub fn shutdown_timeout(self, timeout: Duration) -> Result<Vec<StatsReport>> {
        self.supervisor.trigger().assert();
        self.finish(Some(timeout))
    }

    /// Wait for the pipeline to end on its own: sources exhausted and
    /// every queue closed and drained.
    pub fn wait(self) -> Result<Vec<StatsReport>> {
        self.finish(None)
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<Vec<StatsReport>> {
        self.finish(Some(timeout))
    }

    /// Relay snapshots while waiting so no loop blocks on a full stats
    /// channel during its terminal send.
    fn finish(mut self, timeout: Option<Duration>) -> Result<Vec<StatsReport>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut collected = Vec::new();
        loop {
            collected.extend(self.reports());
            if self.supervisor.await_barrier(Some(self.poll_interval)) {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let stuck = self.supervisor.stuck();
                tracing::error!(?stuck, "pipeline did not stop in time");
                return Err(ReservoirError::ShutdownTimeout { stuck });
            }
        }
        self.supervisor.join()?;
        collected.extend(self.reports());
        tracing::info!("pipeline stopped");
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverflowPolicy;
    use crate::stage::{CollectSink, IterSource};

    fn registry() -> Registry<u32> {
        let mut registry = Registry::with_builtins();
        registry
            .register_source("numbers", |_config| Ok(IterSource::new("numbers", 0..3u32)))
            .register_sink("collect", |_config| Ok(CollectSink::new("collect")));
        registry
    }

    #[test]
    fn test_pipeline_builder() {
        let result = PipelineBuilder::new(registry())
            .queue("a", QueueConfig::bounded(10, OverflowPolicy::Block))
            .queue("b", QueueConfig::unbounded())
            .source("src", "numbers", "", "a")
            .transform("pass", "passthrough", "", "a", "b")
            .sink("out", "collect", "", &["b"])
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_no_stages_error() {
        let result = PipelineBuilder::new(registry()).build();
        assert!(matches!(result, Err(ReservoirError::NoStages)));
    }

    #[test]
    fn test_unknown_queue_error() {
        let result = PipelineBuilder::new(registry())
            .source("src", "numbers", "", "missing")
            .build();
        assert!(matches!(result, Err(ReservoirError::Topology(_))));
    }

    #[test]
    fn test_second_producer_rejected() {
        let result = PipelineBuilder::new(registry())
            .queue("a", QueueConfig::unbounded())
            .source("one", "numbers", "", "a")
            .source("two", "numbers", "", "a")
            .build();
        assert!(matches!(result, Err(ReservoirError::Topology(msg)) if msg.contains("more than one producer")));
    }

    #[test]
    fn test_sink_without_inputs_rejected() {
        let result = PipelineBuilder::new(registry()).sink("out", "collect", "", &[]).build();
        assert!(matches!(result, Err(ReservoirError::Topology(_))));
    }

    #[test]
    fn test_queue_from_registered_kind() {
        let pipeline = PipelineBuilder::new(registry())
            .queue_kind("a", "fifo", r#"{ "capacity": 2, "overflow": "reject" }"#)
            .source("src", "numbers", "", "a")
            .sink("out", "collect", "", &["a"])
            .build()
            .unwrap();
        let queue = pipeline.queue("a").unwrap();
        assert_eq!(queue.cap(), 2);
        assert_eq!(queue.policy(), OverflowPolicy::Reject);

        let result = PipelineBuilder::new(registry())
            .queue_kind("a", "ring", "")
            .source("src", "numbers", "", "a")
            .build();
        assert!(matches!(result, Err(ReservoirError::UnknownKind(kind)) if kind == "ring"));
    }

    #[test]
    fn test_external_producer_only_for_unproduced_queue() {
        let pipeline = PipelineBuilder::new(registry())
            .queue("a", QueueConfig::unbounded())
            .queue("b", QueueConfig::unbounded())
            .source("src", "numbers", "", "a")
            .sink("out", "collect", "", &["a", "b"])
            .build()
            .unwrap();
        assert!(matches!(pipeline.producer("a"), Err(ReservoirError::ProducerTaken(_))));
        assert!(pipeline.producer("b").is_ok());
        assert!(pipeline.queue("b").unwrap().has_producer());
    }
}
