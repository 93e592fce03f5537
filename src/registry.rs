//! Stage and queue factories keyed by kind.
//!
//! Every stage is built the same way: a factory receives the stage's opaque
//! configuration string and returns either a ready-to-run stage or a
//! construction error. Queue factories also receive the queue's name. Runtime capabilities (done signal, statistics,
//! clear requests, error reports) are supplied later through the stage's
//! `MonitorControl`, not at construction.

use crate::error::{ReservoirError, Result};
use crate::queue::Queue;
use crate::stage::{PassthroughStage, Role, Sink, Source, Transform};
use std::collections::HashMap;

pub type SourceFactory<T> = Box<dyn Fn(&str) -> Result<Box<dyn Source<Item = T>>> + Send + Sync>;
pub type TransformFactory<T> =
    Box<dyn Fn(&str) -> Result<Box<dyn Transform<Input = T, Output = T>>> + Send + Sync>;
pub type SinkFactory<T> = Box<dyn Fn(&str) -> Result<Box<dyn Sink<Item = T>>> + Send + Sync>;
pub type QueueFactory<T> = Box<dyn Fn(&str, &str) -> Result<Queue<T>> + Send + Sync>;

/// Named factories for one item type
pub struct Registry<T> {
    sources: HashMap<String, SourceFactory<T>>,
    transforms: HashMap<String, TransformFactory<T>>,
    sinks: HashMap<String, SinkFactory<T>>,
    queues: HashMap<String, QueueFactory<T>>,
}

impl<T: Send + 'static> Registry<T> {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            transforms: HashMap::new(),
            sinks: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    /// A registry with the `passthrough` transform and the `fifo` queue,
    /// whose configuration is a JSON [`QueueConfig`](crate::QueueConfig)
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_transform("passthrough", |_config| Ok(PassthroughStage::<T>::new()))
            .register_queue("fifo", |name, config| Queue::from_config(name, config));
        registry
    }

    pub fn register_source<F, S>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Result<S> + Send + Sync + 'static,
        S: Source<Item = T>,
    {
        self.sources.insert(
            kind.into(),
            Box::new(move |config: &str| Ok(Box::new(factory(config)?) as Box<dyn Source<Item = T>>)),
        );
        self
    }

    pub fn register_transform<F, S>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Result<S> + Send + Sync + 'static,
        S: Transform<Input = T, Output = T>,
    {
        self.transforms.insert(
            kind.into(),
            Box::new(move |config: &str| {
                Ok(Box::new(factory(config)?) as Box<dyn Transform<Input = T, Output = T>>)
            }),
        );
        self
    }

    pub fn register_sink<F, S>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Result<S> + Send + Sync + 'static,
        S: Sink<Item = T>,
    {
        self.sinks.insert(
            kind.into(),
            Box::new(move |config: &str| Ok(Box::new(factory(config)?) as Box<dyn Sink<Item = T>>)),
        );
        self
    }

    pub fn register_queue<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str, &str) -> Result<Queue<T>> + Send + Sync + 'static,
    {
        self.queues.insert(kind.into(), Box::new(factory));
        self
    }

    pub fn build_source(&self, kind: &str, config: &str) -> Result<Box<dyn Source<Item = T>>> {
        let factory = self
            .sources
            .get(kind)
            .ok_or_else(|| ReservoirError::UnknownKind(kind.to_string()))?;
        factory(config)
    }

    pub fn build_transform(
        &self,
        kind: &str,
        config: &str,
    ) -> Result<Box<dyn Transform<Input = T, Output = T>>> {
        let factory = self
            .transforms
            .get(kind)
            .ok_or_else(|| ReservoirError::UnknownKind(kind.to_string()))?;
        factory(config)
    }

    pub fn build_sink(&self, kind: &str, config: &str) -> Result<Box<dyn Sink<Item = T>>> {
        let factory = self
            .sinks
            .get(kind)
            .ok_or_else(|| ReservoirError::UnknownKind(kind.to_string()))?;
        factory(config)
    }

    /// Build a queue named `name` from a registered queue kind
    pub fn build_queue(&self, kind: &str, name: &str, config: &str) -> Result<Queue<T>> {
        let factory = self
            .queues
            .get(kind)
            .ok_or_else(|| ReservoirError::UnknownKind(kind.to_string()))?;
        factory(name, config)
    }

    /// Registered queue kinds, sorted
    pub fn queue_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn contains(&self, role: Role, kind: &str) -> bool {
        match role {
            Role::Source => self.sources.contains_key(kind),
            Role::Transform => self.transforms.contains_key(kind),
            Role::Sink => self.sinks.contains_key(kind),
        }
    }

    /// Registered kinds for a role, sorted
    pub fn kinds(&self, role: Role) -> Vec<&str> {
        let mut kinds: Vec<&str> = match role {
            Role::Source => self.sources.keys().map(String::as_str).collect(),
            Role::Transform => self.transforms.keys().map(String::as_str).collect(),
            Role::Sink => self.sinks.keys().map(String::as_str).collect(),
        };
        kinds.sort_unstable();
        kinds
    }
}

impl<T: Send + 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
