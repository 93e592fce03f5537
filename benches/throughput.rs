use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reservoir::{
    FnSink, IterSource, OverflowPolicy, PipelineBuilder, Queue, QueueConfig, Registry,
    RuntimeConfig,
};
use std::thread;
use std::time::Duration;

fn registry(messages: usize) -> Registry<Vec<u8>> {
    let mut registry = Registry::with_builtins();
    registry
        .register_source("bytes", move |_config| {
            Ok(IterSource::new("bytes", (0..messages).map(|i| vec![i as u8; 64])))
        })
        .register_sink("discard", |_config| {
            Ok(FnSink::new("discard", |data: Vec<u8>| {
                black_box(data);
                Ok(())
            }))
        });
    registry
}

fn runtime() -> RuntimeConfig {
    RuntimeConfig::default().with_poll_interval(Duration::from_millis(1))
}

fn benchmark_queue_spsc(c: &mut Criterion) {
    c.bench_function("queue_spsc_10000_msgs", |b| {
        b.iter(|| {
            let queue = Queue::bounded("bench", 1024, OverflowPolicy::Block);
            let producer = queue.producer().expect("producer taken");
            let consumer = queue.consumer();

            let writer = thread::spawn(move || {
                for i in 0..10_000u64 {
                    producer.put(black_box(i)).expect("put failed");
                }
            });

            let mut count = 0u64;
            while consumer.get().is_ok() {
                count += 1;
            }
            writer.join().expect("writer panicked");
            assert_eq!(count, 10_000);
        });
    });
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    c.bench_function("single_stage_1000_msgs", |b| {
        b.iter(|| {
            let running = PipelineBuilder::new(registry(1000))
                .runtime(runtime())
                .queue("raw", QueueConfig::bounded(1000, OverflowPolicy::Block))
                .source("src", "bytes", "", "raw")
                .sink("out", "discard", "", &["raw"])
                .build()
                .expect("Build failed")
                .start()
                .expect("Start failed");

            let _ = running.wait();
        });
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    c.bench_function("three_stage_1000_msgs", |b| {
        b.iter(|| {
            let running = PipelineBuilder::new(registry(1000))
                .runtime(runtime())
                .queue("q1", QueueConfig::bounded(1000, OverflowPolicy::Block))
                .queue("q2", QueueConfig::bounded(1000, OverflowPolicy::Block))
                .queue("q3", QueueConfig::bounded(1000, OverflowPolicy::Block))
                .source("src", "bytes", "", "q1")
                .transform("stage1", "passthrough", "", "q1", "q2")
                .transform("stage2", "passthrough", "", "q2", "q3")
                .sink("out", "discard", "", &["q3"])
                .build()
                .expect("Build failed")
                .start()
                .expect("Start failed");

            let _ = running.wait();
        });
    });
}

fn benchmark_high_throughput(c: &mut Criterion) {
    c.bench_function("high_throughput_5000_msgs", |b| {
        b.iter(|| {
            let running = PipelineBuilder::new(registry(5000))
                .runtime(runtime())
                .queue("q1", QueueConfig::bounded(2000, OverflowPolicy::Block))
                .queue("q2", QueueConfig::bounded(2000, OverflowPolicy::Block))
                .source("src", "bytes", "", "q1")
                .transform("stage1", "passthrough", "", "q1", "q2")
                .sink("out", "discard", "", &["q2"])
                .build()
                .expect("Build failed")
                .start()
                .expect("Start failed");

            let _ = running.wait();
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_queue_spsc, benchmark_single_stage_throughput, benchmark_three_stage_throughput, benchmark_high_throughput
);
criterion_main!(benches);
