//! Error types for the multi-connector router.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Connector {name} is registered more than once")]
    DuplicateConnector { name: String },

    #[error("At least one connector must be registered")]
    NoConnectors,

    #[error("No provider supplied for configured connector {name}")]
    MissingProvider { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text-completion provider errors.
///
/// These are the only errors a caller of the router ever observes: the router
/// forwards them verbatim from the connector it selected.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Request to {provider} was cancelled")]
    Cancelled { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether this error was produced by a cancellation signal rather than a
    /// backend failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LlmError::Cancelled { .. })
    }
}

/// Errors raised by the background analysis pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Evaluation of connector {connector} failed: {reason}")]
    EvaluationFailed { connector: String, reason: String },

    #[error("Failed to persist analysis to {path}: {reason}")]
    Persistence { path: String, reason: String },

    #[error("Analysis was cancelled")]
    Cancelled,

    #[error("Analysis task terminated abnormally: {reason}")]
    TaskAborted { reason: String },

    #[error("LLM call during analysis failed: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    /// Cancellation is the only error the analysis loop treats as a clean exit.
    pub fn is_cancellation(&self) -> bool {
        match self {
            AnalysisError::Cancelled => true,
            AnalysisError::Llm(err) => err.is_cancellation(),
            _ => false,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "connectors.main.temperature_range".to_string(),
            message: "min 1 is greater than max 0.5".to_string(),
        };
        let msg = err.to_string();
        assert!(
            msg.contains("connectors.main.temperature_range"),
            "Should mention the key: {msg}"
        );
        assert!(msg.contains("greater than"), "Should include the reason: {msg}");

        let err = ConfigError::DuplicateConnector {
            name: "gpt-small".to_string(),
        };
        assert!(err.to_string().contains("gpt-small"));
    }

    #[test]
    fn llm_error_display() {
        let err = LlmError::Timeout {
            provider: "backend-a".to_string(),
            timeout: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("backend-a"), "Should mention provider: {msg}");
        assert!(msg.contains("30s"), "Should mention timeout: {msg}");

        let err = LlmError::ContextLengthExceeded {
            used: 100_000,
            limit: 50_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("100000"), "Should mention used tokens: {msg}");
        assert!(msg.contains("50000"), "Should mention limit: {msg}");
    }

    #[test]
    fn cancellation_classification() {
        assert!(
            LlmError::Cancelled {
                provider: "p".into()
            }
            .is_cancellation()
        );
        assert!(
            !LlmError::RequestFailed {
                provider: "p".into(),
                reason: "boom".into()
            }
            .is_cancellation()
        );
        assert!(AnalysisError::Cancelled.is_cancellation());
        assert!(
            AnalysisError::Llm(LlmError::Cancelled {
                provider: "p".into()
            })
            .is_cancellation()
        );
        assert!(
            !AnalysisError::EvaluationFailed {
                connector: "b".into(),
                reason: "bad".into()
            }
            .is_cancellation()
        );
    }

    #[test]
    fn top_level_error_from_conversions() {
        let err: Error = ConfigError::NoConnectors.into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = LlmError::AuthFailed {
            provider: "p".into(),
        }
        .into();
        assert!(matches!(err, Error::Llm(_)));

        let err: Error = AnalysisError::Cancelled.into();
        assert!(matches!(err, Error::Analysis(_)));
    }
}
