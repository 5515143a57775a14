use serde::{Deserialize, Serialize};

use crate::domain::content::ContentId;
use crate::domain::context::SessionId;
use crate::intent::Intent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub session_id: Option<SessionId>,
    pub customer_id: Option<String>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), session_id: None, customer_id: None }
    }
}

/// Estimated token spend for one query, prompt and completion sides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Character-count heuristic for providers that report no usage,
    /// matching the vectorizer's budget estimate.
    pub fn estimated(prompt: &str, completion: &str) -> Self {
        Self {
            prompt_tokens: crate::vectorizer::estimate_tokens(prompt) as u32,
            completion_tokens: crate::vectorizer::estimate_tokens(completion) as u32,
        }
    }
}

/// Which retrieval buckets contributed context to the answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSourceCounts {
    pub menu: usize,
    pub policies: usize,
    pub faqs: usize,
    pub facts: bool,
    pub history_turns: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub text: String,
    pub confidence: f32,
    pub intent: Intent,
    pub source_ids: Vec<ContentId>,
    pub follow_ups: Vec<String>,
    pub usage: TokenUsage,
    pub context_sources: ContextSourceCounts,
    /// True when a stage failed and a documented fallback produced the text.
    pub degraded: bool,
    pub elapsed_ms: u64,
}

/// Events pushed over the streaming channel. `Done` and `Error` are both
/// terminal; nothing follows either.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk(String),
    Done(QueryResponse),
    Error { message: String, retry_after_secs: Option<u64> },
}
