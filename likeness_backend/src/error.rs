use thiserror::Error;

/// Error taxonomy for the engine.
///
/// Capability boundaries and validation return these so callers can pick a
/// recovery strategy; internal plumbing keeps using `anyhow::Result` with context.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient failure of an external generation service. Retried, then the
    /// caller falls back to a degraded result.
    #[error("{service} request failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// Malformed AI response. Triggers the heuristic strategy.
    #[error("could not parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    /// Malformed schedule definition, rejected at configuration time.
    #[error("invalid schedule: {0}")]
    Validation(String),

    /// Single-writer invariant violated. Never expected under correct locking.
    #[error("concurrency conflict on conversation {0}")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn external(service: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::ExternalService {
            service,
            message: err.to_string(),
        }
    }

    pub fn parse(what: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::Parse {
            what,
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ExternalService { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_external_service_errors_are_transient() {
        assert!(EngineError::external("llm", "timeout").is_transient());
        assert!(!EngineError::parse("analysis", "eof").is_transient());
        assert!(!EngineError::Validation("empty".to_string()).is_transient());
        assert!(!EngineError::ConcurrencyConflict("c1".to_string()).is_transient());
    }

    #[test]
    fn display_includes_service_and_message() {
        let err = EngineError::external("comfyui", "connection refused");
        assert_eq!(err.to_string(), "comfyui request failed: connection refused");
    }
}
