//! Word frequency counter pipeline
//!
//! Reads lines from stdin, normalizes them, counts word frequencies, and prints top-N words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use anyhow::Context;
use reservoir::{
    OverflowPolicy, PipelineBuilder, QueueConfig, Registry, Result as ReservoirResult, Sink,
    Transform,
};
use std::collections::HashMap;
use std::io::{self, BufRead};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Lowercases a line and strips everything but words
struct LineCleaner;

impl Transform for LineCleaner {
    type Input = String;
    type Output = String;

    fn transform(&mut self, line: String) -> ReservoirResult<Option<String>> {
        let cleaned: Vec<String> = line
            .split_whitespace()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| w.len() > 2)
            .collect();

        if cleaned.is_empty() {
            Ok(None)
        } else {
            Ok(Some(cleaned.join(" ")))
        }
    }

    fn name(&self) -> &str {
        "line_cleaner"
    }
}

/// Counts words and periodically prints the most frequent ones
struct WordCounter {
    counts: HashMap<String, usize>,
    words: usize,
    report_every: usize,
}

impl WordCounter {
    fn new(report_every: usize) -> Self {
        Self {
            counts: HashMap::new(),
            words: 0,
            report_every: report_every.max(1),
        }
    }

    fn top_n(&self, n: usize) -> Vec<(&str, usize)> {
        let mut items: Vec<_> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        items.truncate(n);
        items
    }

    fn print_top(&self, n: usize) {
        println!("\n=== Top {n} Words (after {} words) ===", self.words);
        for (i, (word, count)) in self.top_n(n).iter().enumerate() {
            println!("{:2}. {} ({})", i + 1, word, count);
        }
    }
}

impl Sink for WordCounter {
    type Item = String;

    fn consume(&mut self, line: String) -> ReservoirResult<()> {
        for word in line.split_whitespace() {
            *self.counts.entry(word.to_string()).or_insert(0) += 1;
            self.words += 1;
            if self.words % self.report_every == 0 {
                self.print_top(10);
            }
        }
        Ok(())
    }

    fn on_shutdown(&mut self) -> ReservoirResult<()> {
        self.print_top(10);
        Ok(())
    }

    fn name(&self) -> &str {
        "word_counter"
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,reservoir=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let mut registry = Registry::new();
    registry
        .register_transform("clean", |_config| Ok(LineCleaner))
        .register_sink("count", |config| {
            let report_every = if config.is_empty() {
                100
            } else {
                config.parse().map_err(|_| {
                    reservoir::ReservoirError::construction("count", format!("bad interval `{config}`"))
                })?
            };
            Ok(WordCounter::new(report_every))
        });

    let pipeline = PipelineBuilder::new(registry)
        .queue("lines", QueueConfig::bounded(100, OverflowPolicy::Block))
        .queue("clean", QueueConfig::bounded(200, OverflowPolicy::Block))
        .transform("cleaner", "clean", "", "lines", "clean")
        .sink("counter", "count", "100", &["clean"])
        .build()
        .context("failed to assemble pipeline")?;

    let input = pipeline.producer("lines")?;
    let running = pipeline.start()?;

    for line in io::stdin().lock().lines() {
        input.put(line.context("failed to read stdin")?)?;
    }
    // End of input closes the first queue; every stage drains and stops.
    drop(input);

    for report in running.wait()?.iter().filter(|r| r.terminal) {
        tracing::info!(source = %report.source, stats = %report.payload, "final stats");
    }

    println!("\n\nProcessing complete!");
    Ok(())
}
