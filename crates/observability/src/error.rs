//! Error types for the observability crate.

use thiserror::Error;

/// Observability result type.
pub type Result<T> = std::result::Result<T, ObservabilityError>;

/// Errors that can occur while sampling, aggregating, or alerting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObservabilityError {
    /// A configured alert predicate could not be evaluated.
    #[error("invalid alert predicate {rule}: {reason}")]
    InvalidPredicate {
        /// Name of the rule whose predicate failed to parse/evaluate.
        rule: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The sampler could not read a system resource signal.
    #[error("sampling failed: {0}")]
    SamplingFailed(String),

    /// Prometheus registration or encoding failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
