use thiserror::Error;

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures a session transition reports to its caller. Precondition
/// problems are not errors; they come back as inert results.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A store read or write failed. Reload authoritative state before retrying.
    #[error("failed to {operation}: {message}")]
    Persistence {
        operation: &'static str,
        message: String,
        #[source]
        source: BoxedError,
    },
    /// Some writes of a multi-record transition landed and some did not.
    #[error("transition partially persisted; failed: {}", failed.join("; "))]
    PartialWrite { failed: Vec<String> },
}

impl EngineError {
    pub fn persistence(operation: &'static str, err: anyhow::Error) -> Self {
        EngineError::Persistence {
            operation,
            message: format!("{err:#}"),
            source: err.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
