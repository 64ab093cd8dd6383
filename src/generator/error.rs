//! Generator error types

use thiserror::Error;

/// Error types for content generation
///
/// Rate limits, outages and timeouts are retryable; malformed output and
/// invalid requests are not. The task runner retries purely on its
/// configured budget and does not look at this distinction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited(_)
                | GenerationError::Unavailable(_)
                | GenerationError::Timeout(_)
        )
    }
}
