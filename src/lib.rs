//! Concurrency core for pluggable streaming pipelines.
//!
//! Source, transform and sink stages run on their own threads and talk
//! through named in-process queues. A supervisor owns every loop it starts
//! and coordinates a cooperative shutdown; a per-loop monitor bundle lets an
//! orchestrator observe and reset statistics without pausing the data path.
//!
//! # Features
//!
//! - FIFO queues with close/drain semantics that distinguish "empty for now"
//!   from "closed and drained"
//! - Construction-time overflow policies (Block, Reject or DropOldest)
//! - Single-producer enforcement: only a queue's producer can close it
//! - Stage harness with bounded waits, so the done signal is always reachable
//! - Shutdown that propagates downstream as producers close their outputs
//! - Push (channel) and pull (accessor) statistics, both clearable while running
//! - Watermark-based backpressure for sources
//!
//! # Example
//!
//! ```ignore
//! use reservoir::{PipelineBuilder, QueueConfig, OverflowPolicy, Registry, IterSource, CollectSink};
//!
//! let mut registry = Registry::with_builtins();
//! registry
//!     .register_source("numbers", |_cfg| Ok(IterSource::new("numbers", 0..100u32)))
//!     .register_sink("collect", |_cfg| Ok(CollectSink::new("collect")));
//!
//! let running = PipelineBuilder::new(registry)
//!     .queue("raw", QueueConfig::bounded(64, OverflowPolicy::Block))
//!     .queue("clean", QueueConfig::unbounded())
//!     .source("numbers", "numbers", "", "raw")
//!     .transform("pass", "passthrough", "", "raw", "clean")
//!     .sink("out", "collect", "", &["clean"])
//!     .build()?
//!     .start()?;
//!
//! // Sources exhausted: shutdown propagates downstream on its own.
//! let final_stats = running.wait()?;
//! ```

pub mod backpressure;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod stage;

// Re-exports for convenience
pub use backpressure::BackpressureController;
pub use config::{QueueConfig, RuntimeConfig};
pub use error::{QueueError, ReservoirError, Result};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use monitor::{ErrorReport, MonitorControl, MonitorHandle, StatsReport};
pub use pipeline::{Pipeline, PipelineBuilder, RunningPipeline};
pub use queue::{Consumer, OverflowPolicy, Producer, Queue, QueueStats};
pub use registry::Registry;
pub use shutdown::{DoneSignal, LoopState, ShutdownTrigger, Supervisor, TaskTracker};
pub use stage::{
    CollectSink, FilterStage, FnSink, IterSource, MapStage, PassthroughStage, Produced, Role,
    Sink, Source, StageHandle, StageRunner, Transform,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
