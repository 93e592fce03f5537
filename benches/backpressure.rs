use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reservoir::{
    FnSink, IterSource, MapStage, OverflowPolicy, PipelineBuilder, Queue, QueueConfig, Registry,
    RuntimeConfig,
};
use std::time::Duration;

fn registry(messages: usize) -> Registry<Vec<u8>> {
    let mut registry = Registry::with_builtins();
    registry
        .register_source("bytes", move |_config| {
            Ok(IterSource::new("bytes", (0..messages).map(|i| vec![i as u8; 64])))
        })
        .register_transform("slow", |_config| {
            Ok(MapStage::new("slow", |data: Vec<u8>| {
                std::thread::sleep(Duration::from_micros(100));
                Ok(data)
            }))
        })
        .register_sink("discard", |_config| {
            Ok(FnSink::new("discard", |data: Vec<u8>| {
                black_box(data);
                Ok(())
            }))
        });
    registry
}

fn slow_consumer(backpressure: bool) {
    let mut builder = PipelineBuilder::new(registry(1000))
        .runtime(RuntimeConfig::default().with_poll_interval(Duration::from_millis(1)))
        .queue("raw", QueueConfig::bounded(500, OverflowPolicy::Block))
        .queue("slowed", QueueConfig::bounded(100, OverflowPolicy::Block))
        .source("producer", "bytes", "", "raw")
        .transform("consumer", "slow", "", "raw", "slowed")
        .sink("out", "discard", "", &["slowed"]);
    if backpressure {
        builder = builder.with_backpressure(80, 40);
    }

    let running = builder
        .build()
        .expect("Build failed")
        .start()
        .expect("Start failed");
    let _ = running.wait();
}

fn benchmark_backpressure_slow_consumer(c: &mut Criterion) {
    c.bench_function("backpressure_slow_consumer_1000_msgs", |b| {
        b.iter(|| slow_consumer(true));
    });
}

fn benchmark_without_backpressure(c: &mut Criterion) {
    c.bench_function("no_backpressure_slow_consumer_1000_msgs", |b| {
        b.iter(|| slow_consumer(false));
    });
}

fn benchmark_drop_policy_high_load(c: &mut Criterion) {
    c.bench_function("drop_policy_high_load_2000_msgs", |b| {
        b.iter(|| {
            let queue = Queue::bounded("lossy", 200, OverflowPolicy::DropOldest);
            let producer = queue.producer().expect("producer taken");
            for i in 0..2000 {
                let _ = producer.put(black_box(vec![i as u8; 64]));
            }
            assert_eq!(queue.stats().dropped, 1800);
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(15))
        .sample_size(20);
    targets = benchmark_backpressure_slow_consumer, benchmark_without_backpressure, benchmark_drop_policy_high_load
);
criterion_main!(benches);
