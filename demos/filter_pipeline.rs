//! Number processing pipeline demonstrating filtering and transformations
//!
//! Pipeline:
//! 1. Generate: Produces numbers 1-100
//! 2. Filter: Keep only even numbers
//! 3. Transform: Multiply by 10
//! 4. Aggregate: Sum all numbers
//!
//! Usage: cargo run --example filter_pipeline --release

use reservoir::{
    FilterStage, IterSource, MapStage, MetricsSnapshot, OverflowPolicy, PipelineBuilder,
    QueueConfig, Registry, Result as ReservoirResult, RuntimeConfig, Sink,
};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Aggregator stage that sums all numbers
struct SumAggregator {
    sum: u64,
    count: u64,
}

impl SumAggregator {
    fn new() -> Self {
        Self { sum: 0, count: 0 }
    }
}

impl Sink for SumAggregator {
    type Item = u64;

    fn consume(&mut self, num: u64) -> ReservoirResult<()> {
        self.sum += num;
        self.count += 1;

        if self.count % 5 == 0 {
            println!("Running sum: {} (count: {})", self.sum, self.count);
        }
        Ok(())
    }

    fn on_shutdown(&mut self) -> ReservoirResult<()> {
        println!("\n=== Final Results ===");
        println!("Total numbers processed: {}", self.count);
        println!("Sum of all numbers: {}", self.sum);
        if self.count > 0 {
            println!("Average: {:.2}", self.sum as f64 / self.count as f64);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sum_aggregator"
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,reservoir=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("Number Processing Pipeline");
    println!("==========================");
    println!("Generating numbers 1-100, filtering evens, multiplying by 10, and summing");
    println!();

    let start = Instant::now();

    let mut registry = Registry::new();
    registry
        .register_source("generator", |_config| Ok(IterSource::new("generator", 1..=100u64)))
        .register_transform("even", |_config| {
            Ok(FilterStage::new("even_filter", |n: &u64| n % 2 == 0))
        })
        .register_transform("times_ten", |_config| {
            Ok(MapStage::new("multiply_by_10", |n: u64| Ok(n * 10)))
        })
        .register_sink("sum", |_config| Ok(SumAggregator::new()));

    let runtime = RuntimeConfig::default().with_stats_interval(Duration::from_millis(50));
    let running = PipelineBuilder::new(registry)
        .runtime(runtime)
        .with_backpressure(80, 40)
        .queue("numbers", QueueConfig::bounded(50, OverflowPolicy::Block))
        .queue("evens", QueueConfig::bounded(50, OverflowPolicy::Block))
        .queue("scaled", QueueConfig::bounded(50, OverflowPolicy::Block))
        .source("generate", "generator", "", "numbers")
        .transform("filter", "even", "", "numbers", "evens")
        .transform("transform", "times_ten", "", "evens", "scaled")
        .sink("aggregate", "sum", "", &["scaled"])
        .build()?
        .start()?;

    // The generator runs dry, so the pipeline drains and stops on its own.
    let reports = running.wait()?;

    println!("\n=== Stage Statistics ===");
    for report in reports.iter().filter(|r| r.terminal) {
        if let Ok(stats) = serde_json::from_str::<MetricsSnapshot>(&report.payload) {
            println!("{:>10}: {}", report.source, stats.format());
        }
    }

    let elapsed = start.elapsed();
    println!("\nPipeline execution time: {:.3}s", elapsed.as_secs_f64());

    Ok(())
}
