use thiserror::Error;

/// Failures raised by the opaque upstream providers (embedding vectors,
/// text generation). Retryable subclasses are retried with bounded backoff
/// by the pipeline; the rest degrade the owning stage.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    #[error("provider quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("provider rejected credentials: {0}")]
    InvalidCredentials(String),
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("provider call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

impl ProviderError {
    /// Rate limits and transport blips are worth retrying; quota, bad
    /// credentials, and malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport(_) | Self::Timeout { .. })
    }
}

/// Query-path taxonomy. Validation and rate-limit failures always surface;
/// upstream failures only surface when every fallback is exhausted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid query request: {0}")]
    Validation(String),
    #[error("business rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error(transparent)]
    Upstream(#[from] ProviderError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("query processing exceeded the {limit_ms}ms deadline")]
    Timeout { limit_ms: u64 },
    #[error("internal failure: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "The request could not be processed. Check inputs and try again.",
            Self::RateLimited { .. } => {
                "Too many requests for this business right now. Please retry shortly."
            }
            Self::Upstream(_) | Self::Timeout { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::NotFound(_) => "The requested business or content does not exist.",
            Self::Internal(_) => "An unexpected internal error occurred.",
        }
    }

    /// Seconds the caller should wait before retrying, when that is knowable.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs }
            | Self::Upstream(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}
