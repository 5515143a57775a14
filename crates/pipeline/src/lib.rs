//! Query pipeline - retrieval, decision, and generation orchestration
//!
//! This crate sequences a customer query through the deterministic engines
//! in `tably-core` and the external collaborators behind provider traits:
//!
//! 1. **Validation and rate limiting** (`orchestrator`, `ratelimit`) - the
//!    only stages allowed to abort a query
//! 2. **Intent classification** (`tably-core::intent`) - hybrid rules +
//!    model labeling
//! 3. **Context retrieval** (`retriever`) - concurrent embedding search,
//!    business facts, and conversation history
//! 4. **Rules evaluation** (`tably-core::rules`) - response-shaping actions
//! 5. **Generation** (`providers`, `openai`) - single-shot or streamed
//!
//! # Degradation principle
//!
//! Stages after rate limiting degrade instead of failing: unknown intent,
//! empty context, or a templated fallback answer. The caller always gets a
//! best-effort response unless validation, rate limiting, or the global
//! deadline rejects the query outright.

pub mod fallback;
pub mod openai;
pub mod orchestrator;
pub mod providers;
pub mod ratelimit;
pub mod retriever;
pub mod stub;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use providers::{
    AnalyticsSink, BusinessDirectory, Completion, EmbeddingProvider, GenerationChunk,
    GenerationProvider, QueryLogRecord, QueryOutcome, RetryPolicy, SessionStore,
};
pub use ratelimit::RateLimiter;
pub use retriever::{ContextRetriever, RetrieveError, RetrieverOptions};
