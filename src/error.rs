//! Error taxonomy for the pipeline.
//!
//! Component seams return [`PipelineError`] so callers can branch on the kind of
//! failure: bounds and configuration errors are fatal, transient I/O is retried
//! with backoff, chunk analysis failures are contained at the chunk boundary and
//! stage failures halt the coordinator.

use thiserror::Error;

/// Errors surfaced by pipeline components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A planned or requested region exceeds the volume extents.
    #[error("region {region} is outside volume bounds {shape}")]
    Bounds {
        /// The offending region.
        region: String,
        /// The volume shape it was checked against.
        shape: String,
    },

    /// A remote transfer or external tool invocation failed in a retryable way.
    #[error("transient I/O failure: {message}")]
    TransientIo {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A remote object or local artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Analysis of a single chunk failed.
    #[error("analysis of chunk {chunk} failed: {message}")]
    ChunkAnalysis { chunk: usize, message: String },

    /// A stage failed after exhausting its retries.
    #[error("stage '{stage}' failed: {message}")]
    StageFatal { stage: String, message: String },

    /// Invalid or contradictory configuration.
    #[error("configuration: {0}")]
    Config(String),

    /// Work was cancelled before it completed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a transient error without an underlying source.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error wrapping the underlying cause.
    pub fn transient_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransientIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a stage failure.
    pub fn stage_fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFatal {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether the operation that produced this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(PipelineError::transient("connection reset").is_retryable());
        assert!(!PipelineError::NotFound("s3://b/k".into()).is_retryable());
        assert!(!PipelineError::config("bad").is_retryable());
        assert!(!PipelineError::Bounds {
            region: "r".into(),
            shape: "s".into()
        }
        .is_retryable());
        assert!(!PipelineError::stage_fatal("process", "too many failures").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::ChunkAnalysis {
            chunk: 3,
            message: "worker panicked".into(),
        };
        assert_eq!(err.to_string(), "analysis of chunk 3 failed: worker panicked");

        let err = PipelineError::stage_fatal("upload", "retries exhausted");
        assert!(err.to_string().contains("upload"));
    }
}
