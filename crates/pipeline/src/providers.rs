//! Trait seams for the opaque external collaborators and the shared retry
//! policy for the retryable provider failures.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use tably_core::domain::content::BusinessId;
use tably_core::domain::context::{BusinessFacts, ConversationTurn, Session, SessionId};
use tably_core::domain::query::{ContextSourceCounts, TokenUsage};
use tably_core::errors::ProviderError;
use tably_core::intent::Intent;

#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationChunk {
    pub text: String,
}

/// Text to fixed-length vector. Implementations must return vectors of the
/// dimensionality the embedding index was built with.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Single-shot and chunked text generation.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError>;

    /// Opens a provider stream. Dropping the receiver releases it.
    async fn stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_or_create(
        &self,
        business_id: &BusinessId,
        session_id: Option<&SessionId>,
        customer_id: Option<&str>,
    ) -> Result<Session, ProviderError>;

    async fn history(
        &self,
        business_id: &BusinessId,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ProviderError>;
}

/// Read-only business facts (hours, location, specials).
#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    async fn facts(&self, business_id: &BusinessId) -> Result<BusinessFacts, ProviderError>;
}

/// One analytics row per processed query. Fire-and-forget from the
/// pipeline's point of view.
#[derive(Clone, Debug, Serialize)]
pub struct QueryLogRecord {
    pub query_id: String,
    pub business_id: BusinessId,
    pub query_text: String,
    pub intent: Intent,
    pub intent_confidence: f32,
    pub context_sources: ContextSourceCounts,
    pub duration_ms: u64,
    pub outcome: QueryOutcome,
    /// How many pipeline steps succeeded before the record was cut.
    pub steps_completed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered,
    Degraded,
    Rejected,
    TimedOut,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(&self, record: QueryLogRecord) -> Result<(), ProviderError>;
}

/// Bounded exponential backoff for retryable provider failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 200, multiplier: 2 }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt) as u64;
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or exhausts the retry budget. A provider-supplied retry-after hint
/// overrides the computed backoff.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < policy.max_retries => {
                let delay = match &error {
                    ProviderError::RateLimited { retry_after_secs } => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => policy.delay_for_attempt(attempt),
                };
                sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tably_core::errors::ProviderError;

    use super::{with_retries, RetryPolicy};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { max_retries: 2, base_delay_ms: 1, multiplier: 1 }
    }

    #[tokio::test]
    async fn retries_transport_failures_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(fast_policy(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Transport("reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn quota_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::QuotaExceeded("embedding tokens".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::QuotaExceeded(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(fast_policy(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Transport("reset".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Transport(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
