use thiserror::Error;

/// Result type for reservoir operations
pub type Result<T> = std::result::Result<T, ReservoirError>;

/// Errors returned by queue access.
///
/// These are routine, caller-local conditions. Transient emptiness and an
/// expired wait are not errors; the non-blocking and timed variants report
/// them as `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Put on a queue that has been closed by its producer
    #[error("queue `{0}` is closed")]
    Closed(String),

    /// Put on a full bounded queue using the reject policy
    #[error("queue `{name}` is at capacity ({capacity})")]
    Full { name: String, capacity: usize },

    /// Get on a queue that is closed and has no items left
    #[error("queue `{0}` is closed and drained")]
    Drained(String),
}

impl QueueError {
    /// True for the closed-and-empty end-of-stream condition
    pub fn is_drained(&self) -> bool {
        matches!(self, QueueError::Drained(_))
    }
}

/// Errors that can occur while assembling, running or stopping a pipeline
#[derive(Error, Debug)]
pub enum ReservoirError {
    /// Queue access failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A stage factory rejected its configuration or could not acquire a resource
    #[error("Failed to construct stage `{stage}`: {reason}")]
    Construction { stage: String, reason: String },

    /// No factory is registered under the requested kind
    #[error("No factory registered for kind `{0}`")]
    UnknownKind(String),

    /// Configuration payload could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queues and stages are wired inconsistently
    #[error("Topology error: {0}")]
    Topology(String),

    /// The producer handle of a queue was already handed out
    #[error("Producer for queue `{0}` has already been taken")]
    ProducerTaken(String),

    /// Domain error raised by stage logic
    #[error("Stage `{stage}` failed: {message}")]
    Stage { stage: String, message: String },

    /// Loops still running when the shutdown deadline expired
    #[error("Shutdown timed out; still running: {}", stuck.join(", "))]
    ShutdownTimeout { stuck: Vec<String> },

    /// A supervised loop panicked
    #[error("Task `{0}` panicked")]
    TaskPanicked(String),

    /// No stages in pipeline
    #[error("Cannot start pipeline with no stages")]
    NoStages,
}

impl ReservoirError {
    /// Build a domain error for a stage
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ReservoirError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Build a construction error for a stage
    pub fn construction(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        ReservoirError::Construction {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ReservoirError {
    fn from(err: serde_json::Error) -> Self {
        ReservoirError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_into_reservoir_error() {
        let err: ReservoirError = QueueError::Closed("q".into()).into();
        assert!(matches!(err, ReservoirError::Queue(QueueError::Closed(_))));
        assert_eq!(err.to_string(), "queue `q` is closed");
    }

    #[test]
    fn test_shutdown_timeout_lists_stuck_loops() {
        let err = ReservoirError::ShutdownTimeout {
            stuck: vec!["reader".into(), "writer".into()],
        };
        assert_eq!(err.to_string(), "Shutdown timed out; still running: reader, writer");
    }

    #[test]
    fn test_drained_is_distinct() {
        assert!(QueueError::Drained("q".into()).is_drained());
        assert!(!QueueError::Closed("q".into()).is_drained());
    }
}
