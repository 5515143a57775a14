//! End-to-end pipeline runs against deterministic in-process collaborators.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tably_core::domain::content::{BusinessId, ContentId, ContentType};
use tably_core::domain::context::BusinessFacts;
use tably_core::domain::query::{QueryRequest, StreamEvent};
use tably_core::errors::{ProviderError, QueryError};
use tably_core::index::EmbeddingIndex;
use tably_core::intent::{HybridClassifier, Intent, IntentModel};
use tably_core::rules::{RuleCache, RuleDraft, RuleEngine, RuleStore};
use tably_core::domain::rule::{
    ActionType, ConditionOperator, RuleAction, RuleCategory, RuleCondition,
};

use tably_pipeline::providers::{
    Completion, EmbeddingProvider, GenerationChunk, GenerationProvider, QueryOutcome, RetryPolicy,
};
use tably_pipeline::stub::{
    CannedGenerator, DeterministicEmbedder, InMemorySessionStore, MemoryAnalytics, StaticDirectory,
};
use tably_pipeline::{ContextRetriever, Orchestrator, OrchestratorConfig, RateLimiter, RetrieverOptions};
use tokio::sync::mpsc;

const DIMENSION: usize = 64;

fn business() -> BusinessId {
    BusinessId("biz-1".to_string())
}

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::QuotaExceeded("embedding tokens".to_string()))
    }
}

struct FailingGenerator;

#[async_trait]
impl GenerationProvider for FailingGenerator {
    async fn complete(&self, _prompt: &str) -> Result<Completion, ProviderError> {
        Err(ProviderError::InvalidCredentials("key rejected".to_string()))
    }

    async fn stream(
        &self,
        _prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError> {
        Err(ProviderError::InvalidCredentials("key rejected".to_string()))
    }
}

/// Streams far more chunks than any channel buffers, so a dropped
/// receiver is the only way the stream ends early.
struct ChattyGenerator;

#[async_trait]
impl GenerationProvider for ChattyGenerator {
    async fn complete(&self, _prompt: &str) -> Result<Completion, ProviderError> {
        Ok(Completion { text: "word ".repeat(500), usage: Default::default() })
    }

    async fn stream(
        &self,
        _prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError> {
        let (sender, receiver) = mpsc::channel(4);
        tokio::spawn(async move {
            for _ in 0..500 {
                if sender.send(Ok(GenerationChunk { text: "word ".to_string() })).await.is_err() {
                    return;
                }
            }
        });
        Ok(receiver)
    }
}

struct SlowGenerator;

#[async_trait]
impl GenerationProvider for SlowGenerator {
    async fn complete(&self, _prompt: &str) -> Result<Completion, ProviderError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Completion { text: "too late".to_string(), usage: Default::default() })
    }

    async fn stream(
        &self,
        _prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let (_sender, receiver) = mpsc::channel(1);
        Ok(receiver)
    }
}

struct Wiring {
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    analytics: Arc<MemoryAnalytics>,
    rules: Arc<RuleStore>,
    rate_limit_per_minute: u32,
    timeout: Duration,
}

impl Default for Wiring {
    fn default() -> Self {
        Self {
            index: Arc::new(EmbeddingIndex::new(DIMENSION)),
            embedder: Arc::new(DeterministicEmbedder::new(DIMENSION)),
            generator: Arc::new(CannedGenerator),
            analytics: Arc::new(MemoryAnalytics::new()),
            rules: Arc::new(RuleStore::new(Arc::new(RuleCache::with_default_ttl()))),
            rate_limit_per_minute: 60,
            timeout: Duration::from_secs(2),
        }
    }
}

impl Wiring {
    async fn seed_menu(&self, content_id: &str, name: &str, text: &str) {
        let vector = self.embedder.embed(text).await.expect("embed seed");
        self.index
            .upsert(
                business(),
                ContentType::Menu,
                ContentId(content_id.to_string()),
                text.to_string(),
                vector,
                [("name".to_string(), serde_json::json!(name))]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            )
            .expect("seed upsert");
    }

    fn orchestrator(&self) -> Arc<Orchestrator> {
        let retriever = ContextRetriever::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(StaticDirectory::new(vec![(
                business(),
                BusinessFacts {
                    name: "Trattoria Uno".to_string(),
                    hours: vec!["Mon-Fri 9-17".to_string()],
                    ..BusinessFacts::default()
                },
            )])),
            RetrieverOptions { min_score: 0.1, ..RetrieverOptions::default() },
        );

        Arc::new(Orchestrator::new(
            HybridClassifier::<Arc<dyn IntentModel>>::rules_only(),
            retriever,
            Arc::clone(&self.rules),
            RuleEngine::new(),
            Arc::clone(&self.generator),
            Arc::new(InMemorySessionStore::new()),
            Arc::clone(&self.analytics) as Arc<dyn tably_pipeline::providers::AnalyticsSink>,
            Arc::new(RateLimiter::new(self.rate_limit_per_minute)),
            OrchestratorConfig {
                timeout: self.timeout,
                retry: RetryPolicy { max_retries: 1, base_delay_ms: 1, multiplier: 1 },
            },
        ))
    }
}

async fn wait_for_analytics(analytics: &MemoryAnalytics) {
    wait_for_records(analytics, 1).await;
}

async fn wait_for_records(analytics: &MemoryAnalytics, count: usize) {
    for _ in 0..50 {
        if analytics.records().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn healthy_query_answers_from_seeded_context() {
    let wiring = Wiring::default();
    wiring.seed_menu("pizza", "Margherita Pizza", "Margherita pizza with tomato and basil").await;
    let orchestrator = wiring.orchestrator();

    let response = orchestrator
        .process_query(&business(), QueryRequest::new("Do you serve margherita pizza?"))
        .await
        .expect("query");

    assert_eq!(response.intent, Intent::MenuInquiry);
    assert!(!response.degraded);
    assert_eq!(response.context_sources.menu, 1);
    assert!(response.context_sources.facts);
    assert!(response.text.contains("Margherita"));
    assert!(!response.follow_ups.is_empty());
    assert_eq!(response.source_ids, vec![ContentId("pizza".to_string())]);

    wait_for_analytics(&wiring.analytics).await;
    let records = wiring.analytics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, QueryOutcome::Answered);
    assert_eq!(records[0].intent, Intent::MenuInquiry);
    // All eight stages ran, logging included.
    assert_eq!(records[0].steps_completed, 8);
}

#[tokio::test]
async fn embedding_outage_degrades_to_empty_context() {
    let wiring = Wiring { embedder: Arc::new(FailingEmbedder), ..Wiring::default() };
    let orchestrator = wiring.orchestrator();

    let response = orchestrator
        .process_query(&business(), QueryRequest::new("What are your hours?"))
        .await
        .expect("query still answers");

    assert!(response.degraded);
    assert_eq!(response.intent, Intent::HoursPolicy);
    assert_eq!(response.context_sources.menu, 0);
    assert!(!response.context_sources.facts);
    assert!(!response.text.is_empty());

    wait_for_analytics(&wiring.analytics).await;
    assert_eq!(wiring.analytics.records()[0].outcome, QueryOutcome::Degraded);
}

#[tokio::test]
async fn generation_outage_serves_intent_keyed_fallback() {
    let wiring = Wiring { generator: Arc::new(FailingGenerator), ..Wiring::default() };
    let orchestrator = wiring.orchestrator();

    let response = orchestrator
        .process_query(&business(), QueryRequest::new("Are your desserts nut-free or vegan?"))
        .await
        .expect("fallback response");

    assert!(response.degraded);
    assert_eq!(response.intent, Intent::DietaryRestriction);
    assert!(response.text.contains("Trattoria Uno"));
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_hint() {
    let wiring = Wiring { rate_limit_per_minute: 1, ..Wiring::default() };
    let orchestrator = wiring.orchestrator();

    orchestrator
        .process_query(&business(), QueryRequest::new("hello"))
        .await
        .expect("first query admitted");

    let rejected = orchestrator
        .process_query(&business(), QueryRequest::new("hello again"))
        .await
        .expect_err("second query rejected");

    match rejected {
        QueryError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
        other => panic!("expected rate limit rejection, got {other:?}"),
    }

    // Both the admitted and the rejected query leave an analytics row.
    wait_for_records(&wiring.analytics, 2).await;
    let records = wiring.analytics.records();
    assert!(records.iter().any(|record| {
        record.outcome == QueryOutcome::Rejected && record.query_text == "hello again"
    }));
}

#[tokio::test]
async fn rejected_queries_still_reach_analytics() {
    let wiring = Wiring::default();
    let orchestrator = wiring.orchestrator();

    let result = orchestrator.process_query(&business(), QueryRequest::new("   ")).await;
    assert!(matches!(result, Err(QueryError::Validation(_))));

    wait_for_analytics(&wiring.analytics).await;
    let records = wiring.analytics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, QueryOutcome::Rejected);
    assert_eq!(records[0].query_text, "   ");
    assert_eq!(records[0].intent, Intent::Unknown);
    assert_eq!(records[0].steps_completed, 0);
}

#[tokio::test]
async fn global_deadline_times_out_slow_generation() {
    let wiring = Wiring {
        generator: Arc::new(SlowGenerator),
        timeout: Duration::from_millis(50),
        ..Wiring::default()
    };
    let orchestrator = wiring.orchestrator();

    let result = orchestrator.process_query(&business(), QueryRequest::new("hello")).await;
    assert!(matches!(result, Err(QueryError::Timeout { .. })));

    wait_for_analytics(&wiring.analytics).await;
    let records = wiring.analytics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, QueryOutcome::TimedOut);
    assert_eq!(records[0].query_text, "hello");
}

#[tokio::test]
async fn tone_conflict_is_resolved_without_failing_the_query() {
    let wiring = Wiring::default();
    for (priority, tone) in [(50u8, "formal"), (90u8, "casual")] {
        wiring
            .rules
            .create(RuleDraft {
                business_id: business(),
                category: RuleCategory::ResponseStyle,
                priority,
                conditions: vec![RuleCondition {
                    field: "intent.label".to_string(),
                    operator: ConditionOperator::Equals,
                    value: serde_json::json!("general_chat"),
                    case_sensitive: false,
                }],
                actions: vec![RuleAction {
                    action_type: ActionType::SetTone,
                    parameters: [("tone".to_string(), serde_json::json!(tone))]
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                    priority: 50,
                }],
                active: true,
            })
            .expect("rule accepted");
    }
    let orchestrator = wiring.orchestrator();

    let response = orchestrator
        .process_query(&business(), QueryRequest::new("hello there"))
        .await
        .expect("query");

    assert_eq!(response.intent, Intent::GeneralChat);
    assert!(!response.degraded);
}

#[tokio::test]
async fn streaming_chunks_reassemble_into_the_final_answer() {
    let wiring = Wiring::default();
    wiring.seed_menu("pizza", "Margherita Pizza", "Margherita pizza with tomato and basil").await;
    let orchestrator = wiring.orchestrator();

    let mut events = Arc::clone(&orchestrator)
        .process_streaming_query(business(), QueryRequest::new("Do you serve margherita pizza?"));

    let mut assembled = String::new();
    let mut done = None;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Chunk(text) => assembled.push_str(&text),
            StreamEvent::Done(response) => done = Some(response),
            StreamEvent::Error { message, .. } => panic!("unexpected stream error: {message}"),
        }
    }

    let response = done.expect("terminal done event");
    assert_eq!(assembled, response.text);
    assert!(response.text.contains("Margherita"));
    // Streamed answers estimate usage from the prompt and accumulated text.
    assert!(response.usage.total() > 0);
}

#[tokio::test]
async fn dropping_the_stream_receiver_cancels_the_query() {
    let wiring = Wiring { generator: Arc::new(ChattyGenerator), ..Wiring::default() };
    let orchestrator = wiring.orchestrator();

    let mut events = Arc::clone(&orchestrator)
        .process_streaming_query(business(), QueryRequest::new("Do you serve margherita pizza?"));

    let first = events.recv().await.expect("first event");
    assert!(matches!(first, StreamEvent::Chunk(_)));
    drop(events);

    // The producer notices the closed channel and never reaches the
    // analytics stage.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(wiring.analytics.records().is_empty());
}

#[tokio::test]
async fn streaming_validation_failure_emits_a_terminal_error_event() {
    let wiring = Wiring::default();
    let orchestrator = wiring.orchestrator();

    let mut events =
        Arc::clone(&orchestrator).process_streaming_query(business(), QueryRequest::new("  "));

    match events.recv().await.expect("error event") {
        StreamEvent::Error { message, retry_after_secs } => {
            assert!(!message.is_empty());
            assert_eq!(retry_after_secs, None);
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(events.recv().await.is_none());
}
