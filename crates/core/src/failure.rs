//! Failure classification for analyzer errors.
//!
//! Workers never look at error messages to decide what happens next; they
//! look at the [`ErrorClass`] an analyzer attached to its failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class of an analyzer failure, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or semantically invalid input. Never retried.
    Validation,
    /// Timeout, network hiccup. Retried with backoff.
    Transient,
    /// Backend rate-limited or down. Retried with a longer backoff.
    ResourceExhausted,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Validation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Transient => "transient",
            ErrorClass::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified error returned by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("backend exhausted: {message}")]
    ResourceExhausted {
        message: String,
        /// Backend-provided hint (e.g. `Retry-After`).
        retry_after: Option<Duration>,
    },
}

impl AnalyzerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn exhausted_with_hint(msg: impl Into<String>, retry_after: Duration) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AnalyzerError::Validation(_) => ErrorClass::Validation,
            AnalyzerError::Transient(_) => ErrorClass::Transient,
            AnalyzerError::ResourceExhausted { .. } => ErrorClass::ResourceExhausted,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalyzerError::ResourceExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_validation_is_terminal() {
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::ResourceExhausted.is_retryable());
    }

    #[test]
    fn retry_hint_only_on_exhaustion() {
        let err = AnalyzerError::exhausted_with_hint("429", Duration::from_secs(7));
        assert_eq!(err.class(), ErrorClass::ResourceExhausted);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(AnalyzerError::transient("reset").retry_after(), None);
    }
}
