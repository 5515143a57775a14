//! Pipeline orchestration.
//!
//! One query walks `Validating → RateLimiting → SessionResolving →
//! IntentClassifying → ContextRetrieving → RulesEvaluating → Generating →
//! Logging`. Every stage runs through the same step wrapper and lands in
//! the query's `ProcessingMetrics`. Validation and rate limiting abort;
//! everything downstream degrades to a documented fallback so the caller
//! still gets an answer. A global deadline bounds the whole walk.

use chrono::Utc;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use tably_core::domain::content::BusinessId;
use tably_core::domain::context::ContextBundle;
use tably_core::domain::query::{
    ContextSourceCounts, QueryRequest, QueryResponse, StreamEvent, TokenUsage,
};
use tably_core::errors::QueryError;
use tably_core::intent::{HybridClassifier, Intent, IntentModel, IntentResult};
use tably_core::metrics::{PipelineStep, ProcessingMetrics};
use tably_core::rules::{EvaluationContext, RuleEngine, RuleEvaluation, RuleStore};
use tably_core::ActionType;

use crate::fallback::{fallback_answer, follow_ups};
use crate::providers::{
    with_retries, AnalyticsSink, GenerationProvider, QueryLogRecord, QueryOutcome, RetryPolicy,
    SessionStore,
};
use crate::ratelimit::RateLimiter;
use crate::retriever::ContextRetriever;

const STREAM_EVENT_CAPACITY: usize = 32;
const MAX_QUERY_CHARS: usize = 2_000;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), retry: RetryPolicy::default() }
    }
}

/// Explicitly constructed dependencies. Every test and every deployment
/// builds a fresh wiring; nothing here is process-global.
pub struct Orchestrator {
    classifier: HybridClassifier<Arc<dyn IntentModel>>,
    retriever: ContextRetriever,
    rule_store: Arc<RuleStore>,
    rule_engine: RuleEngine,
    generator: Arc<dyn GenerationProvider>,
    sessions: Arc<dyn SessionStore>,
    analytics: Arc<dyn AnalyticsSink>,
    rate_limiter: Arc<RateLimiter>,
    config: OrchestratorConfig,
}

struct Prepared {
    query_id: String,
    metrics: ProcessingMetrics,
    intent: IntentResult,
    bundle: ContextBundle,
    prompt: String,
    degraded: bool,
}

/// A validation or rate-limit abort, carrying the step ledger collected
/// before the query was turned away.
struct Rejection {
    error: QueryError,
    query_id: String,
    metrics: ProcessingMetrics,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: HybridClassifier<Arc<dyn IntentModel>>,
        retriever: ContextRetriever,
        rule_store: Arc<RuleStore>,
        rule_engine: RuleEngine,
        generator: Arc<dyn GenerationProvider>,
        sessions: Arc<dyn SessionStore>,
        analytics: Arc<dyn AnalyticsSink>,
        rate_limiter: Arc<RateLimiter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            classifier,
            retriever,
            rule_store,
            rule_engine,
            generator,
            sessions,
            analytics,
            rate_limiter,
            config,
        }
    }

    /// Single-shot entry point.
    pub async fn process_query(
        &self,
        business_id: &BusinessId,
        request: QueryRequest,
    ) -> Result<QueryResponse, QueryError> {
        let limit_ms = self.config.timeout.as_millis() as u64;
        match tokio::time::timeout(self.config.timeout, self.run_query(business_id, &request))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                self.record_timeout(business_id, &request, limit_ms);
                Err(QueryError::Timeout { limit_ms })
            }
        }
    }

    /// Streaming entry point. Events arrive on the returned channel;
    /// dropping the receiver cancels the producer and releases the
    /// provider stream.
    pub fn process_streaming_query(
        self: Arc<Self>,
        business_id: BusinessId,
        request: QueryRequest,
    ) -> mpsc::Receiver<StreamEvent> {
        let (sender, receiver) = mpsc::channel(STREAM_EVENT_CAPACITY);
        let limit_ms = self.config.timeout.as_millis() as u64;

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                self.config.timeout,
                self.run_streaming(&business_id, &request, &sender),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(query_error)) => {
                    let _ = sender
                        .send(StreamEvent::Error {
                            message: query_error.user_message().to_string(),
                            retry_after_secs: query_error.retry_after_secs(),
                        })
                        .await;
                }
                Err(_) => {
                    self.record_timeout(&business_id, &request, limit_ms);
                    let _ = sender
                        .send(StreamEvent::Error {
                            message: QueryError::Timeout { limit_ms }.user_message().to_string(),
                            retry_after_secs: None,
                        })
                        .await;
                }
            }
        });

        receiver
    }

    async fn run_query(
        &self,
        business_id: &BusinessId,
        request: &QueryRequest,
    ) -> Result<QueryResponse, QueryError> {
        let started = std::time::Instant::now();
        let mut prepared = match self.prepare(business_id, request).await {
            Ok(prepared) => prepared,
            Err(rejection) => return Err(self.log_rejection(business_id, request, rejection)),
        };

        let generation_started = Utc::now();
        let generation = with_retries(self.config.retry, || {
            let prompt = prepared.prompt.clone();
            let generator = Arc::clone(&self.generator);
            async move { generator.complete(&prompt).await }
        })
        .await;

        let (text, usage) = match generation {
            Ok(completion) => {
                prepared.metrics.record(PipelineStep::Generating, generation_started, true, None);
                (completion.text, completion.usage)
            }
            Err(provider_error) => {
                prepared.metrics.record(
                    PipelineStep::Generating,
                    generation_started,
                    false,
                    Some(provider_error.to_string()),
                );
                error!(
                    event_name = "pipeline.generate.degraded",
                    business_id = %business_id.0,
                    query_text = %request.text,
                    error = %provider_error,
                    "generation failed, serving templated fallback"
                );
                prepared.degraded = true;
                let name = prepared.bundle.facts.as_ref().map(|facts| facts.name.as_str());
                (fallback_answer(prepared.intent.intent, name), TokenUsage::default())
            }
        };

        let response = self.build_response(&prepared, text, usage, started.elapsed());
        self.log_analytics(business_id, request, &mut prepared, &response);
        Ok(response)
    }

    async fn run_streaming(
        &self,
        business_id: &BusinessId,
        request: &QueryRequest,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), QueryError> {
        let started = std::time::Instant::now();
        let mut prepared = match self.prepare(business_id, request).await {
            Ok(prepared) => prepared,
            Err(rejection) => return Err(self.log_rejection(business_id, request, rejection)),
        };

        let generation_started = Utc::now();
        let stream = with_retries(self.config.retry, || {
            let prompt = prepared.prompt.clone();
            let generator = Arc::clone(&self.generator);
            async move { generator.stream(&prompt).await }
        })
        .await;

        let mut accumulated = String::new();
        let mut usage = TokenUsage::default();
        match stream {
            Ok(mut chunks) => {
                while let Some(chunk) = chunks.recv().await {
                    match chunk {
                        Ok(chunk) => {
                            accumulated.push_str(&chunk.text);
                            if events.send(StreamEvent::Chunk(chunk.text)).await.is_err() {
                                // Client cancelled; dropping `chunks` here
                                // releases the provider stream.
                                return Ok(());
                            }
                        }
                        Err(provider_error) => {
                            prepared.metrics.record(
                                PipelineStep::Generating,
                                generation_started,
                                false,
                                Some(provider_error.to_string()),
                            );
                            error!(
                                event_name = "pipeline.stream.failed",
                                business_id = %business_id.0,
                                query_text = %request.text,
                                error = %provider_error,
                                "provider stream failed after streaming began"
                            );
                            let _ = events
                                .send(StreamEvent::Error {
                                    message: QueryError::from(provider_error.clone())
                                        .user_message()
                                        .to_string(),
                                    retry_after_secs: QueryError::from(provider_error)
                                        .retry_after_secs(),
                                })
                                .await;
                            return Ok(());
                        }
                    }
                }
                prepared.metrics.record(PipelineStep::Generating, generation_started, true, None);
                // Streamed chunks carry no provider-reported usage.
                usage = TokenUsage::estimated(&prepared.prompt, &accumulated);
            }
            Err(provider_error) => {
                // The stream never opened, so nothing has been sent yet;
                // degrade to the templated fallback as a single chunk.
                prepared.metrics.record(
                    PipelineStep::Generating,
                    generation_started,
                    false,
                    Some(provider_error.to_string()),
                );
                prepared.degraded = true;
                let name = prepared.bundle.facts.as_ref().map(|facts| facts.name.as_str());
                accumulated = fallback_answer(prepared.intent.intent, name);
                if events.send(StreamEvent::Chunk(accumulated.clone())).await.is_err() {
                    return Ok(());
                }
            }
        }

        let response = self.build_response(&prepared, accumulated, usage, started.elapsed());
        self.log_analytics(business_id, request, &mut prepared, &response);
        let _ = events.send(StreamEvent::Done(response)).await;
        Ok(())
    }

    /// Stages shared by both entry points: everything before generation.
    async fn prepare(
        &self,
        business_id: &BusinessId,
        request: &QueryRequest,
    ) -> Result<Prepared, Rejection> {
        let mut metrics = ProcessingMetrics::new();
        let query_id = Uuid::new_v4().to_string();

        if let Err(error) = run_step(&mut metrics, PipelineStep::Validating, async {
            validate_request(business_id, request)
        })
        .await
        {
            return Err(Rejection { error, query_id, metrics });
        }

        if let Err(error) = run_step(&mut metrics, PipelineStep::RateLimiting, async {
            self.rate_limiter
                .check(business_id)
                .map_err(|retry_after_secs| QueryError::RateLimited { retry_after_secs })
        })
        .await
        {
            return Err(Rejection { error, query_id, metrics });
        }

        let session_id = run_step(&mut metrics, PipelineStep::SessionResolving, async {
            self.sessions
                .get_or_create(
                    business_id,
                    request.session_id.as_ref(),
                    request.customer_id.as_deref(),
                )
                .await
                .map(|session| session.id)
        })
        .await
        .map(Some)
        .unwrap_or_else(|_| request.session_id.clone());

        let intent = run_step(&mut metrics, PipelineStep::IntentClassifying, async {
            Ok::<_, QueryError>(self.classifier.classify(&request.text).await)
        })
        .await
        .unwrap_or_else(|_| IntentResult::unknown(0.0));

        let mut degraded = false;
        let bundle = match run_step(&mut metrics, PipelineStep::ContextRetrieving, async {
            self.retriever.retrieve(business_id, &request.text, session_id.as_ref()).await
        })
        .await
        {
            Ok(bundle) => bundle,
            Err(retrieve_error) => {
                error!(
                    event_name = "pipeline.retrieve.degraded",
                    business_id = %business_id.0,
                    query_text = %request.text,
                    error = %retrieve_error,
                    "context retrieval failed, continuing with empty context"
                );
                degraded = true;
                ContextBundle::default()
            }
        };

        let evaluation = run_step(&mut metrics, PipelineStep::RulesEvaluating, async {
            let rules = self.rule_store.active_rules(business_id);
            let context = EvaluationContext {
                business_id,
                query_text: &request.text,
                intent: &intent,
                bundle: &bundle,
            };
            Ok::<_, QueryError>(self.rule_engine.evaluate(&rules, &context))
        })
        .await
        .unwrap_or_default();

        info!(
            event_name = "pipeline.prepare.complete",
            business_id = %business_id.0,
            query_id = %query_id,
            intent = intent.intent.as_str(),
            intent_confidence = intent.confidence,
            applicable_rules = evaluation.applicable_rules.len(),
            conflicts_resolved = evaluation.conflicts_resolved,
            "pre-generation stages complete"
        );

        let prompt = build_prompt(request, &intent, &bundle, &evaluation);
        Ok(Prepared { query_id, metrics, intent, bundle, prompt, degraded })
    }

    fn build_response(
        &self,
        prepared: &Prepared,
        text: String,
        usage: TokenUsage,
        elapsed: Duration,
    ) -> QueryResponse {
        QueryResponse {
            query_id: prepared.query_id.clone(),
            text,
            confidence: response_confidence(prepared),
            intent: prepared.intent.intent,
            source_ids: prepared.bundle.source_ids(),
            follow_ups: follow_ups(prepared.intent.intent),
            usage,
            context_sources: source_counts(&prepared.bundle),
            degraded: prepared.degraded,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Fire-and-forget: an analytics failure is logged and never changes
    /// the caller-visible outcome.
    fn log_analytics(
        &self,
        business_id: &BusinessId,
        request: &QueryRequest,
        prepared: &mut Prepared,
        response: &QueryResponse,
    ) {
        prepared.metrics.record(PipelineStep::Logging, Utc::now(), true, None);

        info!(
            event_name = "pipeline.query.complete",
            business_id = %business_id.0,
            query_id = %prepared.query_id,
            intent = prepared.intent.intent.as_str(),
            degraded = prepared.degraded,
            elapsed_ms = response.elapsed_ms,
            stages_ms = prepared.metrics.total_elapsed_ms(),
            failed_steps = ?prepared.metrics.failed_steps(),
            "query complete"
        );

        self.submit_record(QueryLogRecord {
            query_id: prepared.query_id.clone(),
            business_id: business_id.clone(),
            query_text: request.text.clone(),
            intent: prepared.intent.intent,
            intent_confidence: prepared.intent.confidence,
            context_sources: response.context_sources.clone(),
            duration_ms: response.elapsed_ms,
            outcome: if prepared.degraded { QueryOutcome::Degraded } else { QueryOutcome::Answered },
            steps_completed: prepared.metrics.completed_steps(),
        });
    }

    /// Rejections never reach generation but still leave a structured
    /// trail: the query text, the failing step's timing, and an analytics
    /// row with the `Rejected` outcome.
    fn log_rejection(
        &self,
        business_id: &BusinessId,
        request: &QueryRequest,
        rejection: Rejection,
    ) -> QueryError {
        error!(
            event_name = "pipeline.query.rejected",
            business_id = %business_id.0,
            query_id = %rejection.query_id,
            query_text = %request.text,
            error = %rejection.error,
            stages_ms = rejection.metrics.total_elapsed_ms(),
            failed_steps = ?rejection.metrics.failed_steps(),
            "query rejected before generation"
        );

        self.submit_record(QueryLogRecord {
            query_id: rejection.query_id,
            business_id: business_id.clone(),
            query_text: request.text.clone(),
            intent: Intent::Unknown,
            intent_confidence: 0.0,
            context_sources: ContextSourceCounts::default(),
            duration_ms: rejection.metrics.total_elapsed_ms(),
            outcome: QueryOutcome::Rejected,
            steps_completed: rejection.metrics.completed_steps(),
        });

        rejection.error
    }

    /// The abandoned task took its step ledger with it, so the record
    /// carries the deadline as the duration.
    fn record_timeout(&self, business_id: &BusinessId, request: &QueryRequest, limit_ms: u64) {
        error!(
            event_name = "pipeline.query.timeout",
            business_id = %business_id.0,
            query_text = %request.text,
            limit_ms,
            "query abandoned at the global deadline"
        );

        self.submit_record(QueryLogRecord {
            query_id: Uuid::new_v4().to_string(),
            business_id: business_id.clone(),
            query_text: request.text.clone(),
            intent: Intent::Unknown,
            intent_confidence: 0.0,
            context_sources: ContextSourceCounts::default(),
            duration_ms: limit_ms,
            outcome: QueryOutcome::TimedOut,
            steps_completed: 0,
        });
    }

    fn submit_record(&self, record: QueryLogRecord) {
        let analytics = Arc::clone(&self.analytics);
        tokio::spawn(async move {
            if let Err(sink_error) = analytics.record(record).await {
                error!(
                    event_name = "pipeline.analytics.failed",
                    error = %sink_error,
                    "analytics sink rejected a query log record"
                );
            }
        });
    }
}

async fn run_step<T, E, Fut>(
    metrics: &mut ProcessingMetrics,
    step: PipelineStep,
    operation: Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Utc::now();
    let result = operation.await;
    match &result {
        Ok(_) => metrics.record(step, started, true, None),
        Err(step_error) => metrics.record(step, started, false, Some(step_error.to_string())),
    }
    result
}

fn validate_request(business_id: &BusinessId, request: &QueryRequest) -> Result<(), QueryError> {
    if business_id.0.trim().is_empty() {
        return Err(QueryError::Validation("business id must not be empty".to_string()));
    }
    if request.text.trim().is_empty() {
        return Err(QueryError::Validation("query text must not be empty".to_string()));
    }
    if request.text.chars().count() > MAX_QUERY_CHARS {
        return Err(QueryError::Validation(format!(
            "query text exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(())
}

fn response_confidence(prepared: &Prepared) -> f32 {
    let top_similarity = prepared
        .bundle
        .menu
        .iter()
        .map(|m| m.similarity)
        .chain(prepared.bundle.policies.iter().map(|m| m.similarity))
        .chain(prepared.bundle.faqs.iter().map(|m| m.similarity))
        .fold(0.0f32, f32::max);

    let blended = 0.6 * prepared.intent.confidence + 0.4 * top_similarity;
    let scaled = if prepared.degraded { blended * 0.5 } else { blended };
    scaled.clamp(0.0, 1.0)
}

fn source_counts(bundle: &ContextBundle) -> ContextSourceCounts {
    ContextSourceCounts {
        menu: bundle.menu.len(),
        policies: bundle.policies.len(),
        faqs: bundle.faqs.len(),
        facts: bundle.facts.is_some(),
        history_turns: bundle.history.len(),
    }
}

/// Folds retrieved context and rule actions into the generation prompt.
fn build_prompt(
    request: &QueryRequest,
    intent: &IntentResult,
    bundle: &ContextBundle,
    evaluation: &RuleEvaluation,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    let business_name =
        bundle.facts.as_ref().map(|facts| facts.name.clone()).unwrap_or_else(|| "the business".to_string());
    lines.push(format!(
        "You are the customer assistant for {business_name}. Answer only from the provided context; say so when you do not know."
    ));
    lines.push(format!("Detected topic: {}", intent.intent.as_str()));

    for applied in &evaluation.applied_actions {
        match applied.action.action_type {
            ActionType::SetTone => {
                for (key, value) in &applied.action.parameters {
                    lines.push(format!("Required {key}: {}", parameter_text(value)));
                }
            }
            ActionType::AddConstraint => {
                for value in applied.action.parameters.values() {
                    lines.push(format!("Constraint: {}", parameter_text(value)));
                }
            }
            ActionType::Escalate => {
                lines.push(
                    "Escalation: tell the customer a staff member will follow up directly."
                        .to_string(),
                );
            }
            ActionType::SuggestItem => {
                for value in applied.action.parameters.values() {
                    lines.push(format!("If relevant, suggest: {}", parameter_text(value)));
                }
            }
            ActionType::AppendDisclaimer => {
                for value in applied.action.parameters.values() {
                    lines.push(format!("End the answer with: {}", parameter_text(value)));
                }
            }
        }
    }

    lines.push("Context:".to_string());
    for entry in &bundle.menu {
        lines.push(format!("- menu: {} ({})", entry.name, entry.snippet));
    }
    for entry in &bundle.policies {
        lines.push(format!("- policy: {} ({})", entry.title, entry.snippet));
    }
    for entry in &bundle.faqs {
        lines.push(format!("- faq: {} ({})", entry.question, entry.snippet));
    }
    if let Some(facts) = &bundle.facts {
        if !facts.hours.is_empty() {
            lines.push(format!("- hours: {}", facts.hours.join("; ")));
        }
        if let Some(location) = &facts.location {
            lines.push(format!("- location: {location}"));
        }
        if !facts.specials.is_empty() {
            lines.push(format!("- specials: {}", facts.specials.join("; ")));
        }
    }

    if !bundle.history.is_empty() {
        lines.push("Recent conversation:".to_string());
        for turn in &bundle.history {
            let role = match turn.role {
                tably_core::domain::context::TurnRole::Customer => "customer",
                tably_core::domain::context::TurnRole::Assistant => "assistant",
            };
            lines.push(format!("{role}: {}", turn.text));
        }
    }

    lines.push(format!("Customer question: {}", request.text));
    lines.join("\n")
}

fn parameter_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tably_core::domain::content::{BusinessId, ContentId};
    use tably_core::domain::context::{BusinessFacts, ContextBundle, MenuMatch};
    use tably_core::domain::query::QueryRequest;
    use tably_core::domain::rule::{ActionType, RuleAction, RuleId};
    use tably_core::intent::{Intent, IntentResult};
    use tably_core::rules::{AppliedAction, RuleEvaluation};

    use super::{build_prompt, validate_request};

    #[test]
    fn validation_rejects_blank_and_oversized_queries() {
        let business = BusinessId("biz-1".to_string());
        assert!(validate_request(&business, &QueryRequest::new("  ")).is_err());
        assert!(validate_request(&business, &QueryRequest::new("a".repeat(2_001))).is_err());
        assert!(validate_request(&business, &QueryRequest::new("What are your hours?")).is_ok());
    }

    #[test]
    fn prompt_folds_context_tone_and_escalation() {
        let bundle = ContextBundle {
            menu: vec![MenuMatch {
                content_id: ContentId("pizza".to_string()),
                name: "Margherita".to_string(),
                snippet: "Tomato and basil".to_string(),
                similarity: 0.9,
                confidence: 0.9,
            }],
            facts: Some(BusinessFacts {
                name: "Trattoria Uno".to_string(),
                hours: vec!["Mon-Fri 9-17".to_string()],
                ..BusinessFacts::default()
            }),
            ..ContextBundle::default()
        };
        let intent = IntentResult { intent: Intent::MenuInquiry, confidence: 0.8, alternatives: vec![] };
        let evaluation = RuleEvaluation {
            applicable_rules: vec![RuleId("r1".to_string())],
            applied_actions: vec![
                AppliedAction {
                    rule_id: RuleId("r1".to_string()),
                    rule_priority: 90,
                    action: RuleAction {
                        action_type: ActionType::SetTone,
                        parameters: [("tone".to_string(), serde_json::json!("casual"))]
                            .into_iter()
                            .collect::<BTreeMap<_, _>>(),
                        priority: 50,
                    },
                },
                AppliedAction {
                    rule_id: RuleId("r2".to_string()),
                    rule_priority: 80,
                    action: RuleAction {
                        action_type: ActionType::Escalate,
                        parameters: BTreeMap::new(),
                        priority: 50,
                    },
                },
            ],
            conflicts_resolved: 0,
        };

        let prompt =
            build_prompt(&QueryRequest::new("What pizzas do you have?"), &intent, &bundle, &evaluation);

        assert!(prompt.contains("Trattoria Uno"));
        assert!(prompt.contains("Required tone: casual"));
        assert!(prompt.contains("Escalation:"));
        assert!(prompt.contains("- menu: Margherita"));
        assert!(prompt.contains("- hours: Mon-Fri 9-17"));
        assert!(prompt.ends_with("Customer question: What pizzas do you have?"));
    }
}
