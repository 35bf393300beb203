//! Error taxonomy (spec §7).
//!
//! Every variant maps to one row of the error-kind table. [`Error::kind`]
//! recovers that taxonomy so the coordinator's retry policy can reason about
//! recoverability without matching on every concrete variant.

use thiserror::Error;

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The error-kind taxonomy from spec §7. Names are the wire-visible tags
/// used in `retry.retryOn` and in structured errors surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed workflow definition, unknown capability.
    Validation,
    /// Matcher produced an empty candidate set.
    NoCandidates,
    /// Executor I/O hiccup, event bus backpressure.
    Transient,
    /// Step or assignment exceeded its deadline.
    Timeout,
    /// Consensus quorum not reached.
    Consensus,
    /// Executor returned a structured failure.
    AgentFailure,
    /// CAS failed `maxCASRetries` times.
    Concurrent,
    /// Checkpoint hash mismatch.
    Corruption,
    /// User-initiated cancellation.
    Cancelled,
    /// Invariant violation; operator attention required.
    Fatal,
}

impl ErrorKind {
    /// Whether this kind is retryable by default (absent an explicit
    /// `retryOn` override). `cancelled` and `fatal` are never retried;
    /// `consensus` is not retried by default (spec §7).
    #[must_use]
    pub fn retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::NoCandidates
                | ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::AgentFailure
        )
    }
}

/// Core error type. One variant per taxonomy row, plus the wrapped
/// infrastructure failures (I/O, serialization) that feed into them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Workflow definition failed validation at `start()`.
    #[error("validation error: {0}")]
    Validation(String),

    /// The capability matcher found no eligible agent.
    #[error("no candidates matched requirement: {0}")]
    NoCandidates(String),

    /// A transient infrastructure failure occurred.
    #[error("transient error: {0}")]
    Transient(String),

    /// A step or assignment exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A consensus step failed to reach quorum.
    #[error("consensus not reached: quorum {quorum}, tally {tally:?}")]
    Consensus {
        /// Required quorum count.
        quorum: usize,
        /// Observed tally, stringified per distinct output.
        tally: std::collections::HashMap<String, usize>,
    },

    /// The executor returned a structured failure for an assignment.
    #[error("agent {agent_id} failed: {reason}")]
    AgentFailure {
        /// The agent that failed.
        agent_id: String,
        /// Executor-supplied failure reason.
        reason: String,
    },

    /// A CAS-guarded mutation failed to land after `maxCASRetries` attempts.
    #[error("concurrent mutation conflict on {execution_id} after {attempts} attempts")]
    ConcurrentMutation {
        /// Execution whose state could not be mutated.
        execution_id: String,
        /// Number of CAS attempts made.
        attempts: u32,
    },

    /// Checkpoint integrity verification failed.
    #[error("checkpoint corruption: {0}")]
    Corruption(String),

    /// The operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An invariant was violated; this should never be retried automatically.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Wrapped I/O failure (checkpoint storage, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Recover this error's taxonomy kind (spec §7).
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NoCandidates(_) => ErrorKind::NoCandidates,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Consensus { .. } => ErrorKind::Consensus,
            Error::AgentFailure { .. } => ErrorKind::AgentFailure,
            Error::ConcurrentMutation { .. } => ErrorKind::Concurrent,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Io(_) => ErrorKind::Transient,
            Error::Serialization(_) => ErrorKind::Fatal,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_taxonomy() {
        assert_eq!(
            Error::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::Cancelled("user".into()).kind(), ErrorKind::Cancelled);
        assert!(ErrorKind::Timeout.retryable_by_default());
        assert!(!ErrorKind::Fatal.retryable_by_default());
        assert!(!ErrorKind::Cancelled.retryable_by_default());
    }
}
