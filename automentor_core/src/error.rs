//! Agent error taxonomy
//!
//! One error enum shared by every component. Capability failures are the
//! only retryable class; everything else is surfaced to the caller as-is.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Capability '{capability}' timed out after {timeout_ms}ms")]
    CapabilityTimeout { capability: String, timeout_ms: u64 },

    #[error("Text generation failed: {0}")]
    Generation(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Goal is incomplete, missing SMART fields: {}", .missing.join(", "))]
    IncompleteGoal { missing: Vec<String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Config(#[from] serde_yaml::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn validation(message: impl Into<String>) -> Self {
        AgentError::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        AgentError::InvalidState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AgentError::NotFound(message.into())
    }

    /// Failures of an external capability (embedding, generation, timeout).
    /// The orchestrator retries these once before degrading.
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            AgentError::CapabilityTimeout { .. }
                | AgentError::Generation(_)
                | AgentError::Embedding(_)
        )
    }

    /// Control-flow outcomes that callers are expected to handle.
    pub fn is_expected(&self) -> bool {
        matches!(self, AgentError::IncompleteGoal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_classification() {
        let timeout = AgentError::CapabilityTimeout {
            capability: "embedding".to_string(),
            timeout_ms: 50,
        };
        assert!(timeout.is_capability_failure());
        assert!(AgentError::Generation("boom".into()).is_capability_failure());
        assert!(!AgentError::validation("bad").is_capability_failure());
        assert!(!AgentError::invalid_state("nope").is_capability_failure());
    }

    #[test]
    fn test_incomplete_goal_message_lists_fields() {
        let err = AgentError::IncompleteGoal {
            missing: vec!["measurable".to_string(), "time_bound".to_string()],
        };
        assert!(err.is_expected());
        assert_eq!(
            err.to_string(),
            "Goal is incomplete, missing SMART fields: measurable, time_bound"
        );
    }
}
