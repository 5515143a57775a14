//! Deterministic demo wiring: one fictional restaurant, its content run
//! through the vectorizer into the embedding index, and a pair of active
//! rules. Backs `tably ask` and the smoke checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use tably_core::config::AppConfig;
use tably_core::domain::content::{BusinessId, ContentId, ContentItem, ContentType};
use tably_core::domain::context::BusinessFacts;
use tably_core::domain::rule::{
    ActionType, ConditionOperator, RuleAction, RuleCategory, RuleCondition,
};
use tably_core::index::EmbeddingIndex;
use tably_core::intent::{HybridClassifier, IntentModel};
use tably_core::rules::{RuleCache, RuleDraft, RuleEngine, RuleStore, SystemClock};
use tably_core::vectorizer::ContentVectorizer;
use tably_pipeline::providers::{EmbeddingProvider, RetryPolicy};
use tably_pipeline::stub::{
    CannedGenerator, DeterministicEmbedder, InMemorySessionStore, MemoryAnalytics, StaticDirectory,
};
use tably_pipeline::{
    ContextRetriever, Orchestrator, OrchestratorConfig, RateLimiter, RetrieverOptions,
};

pub const DEMO_BUSINESS_ID: &str = "demo-trattoria";

pub struct DemoPipeline {
    pub orchestrator: Arc<Orchestrator>,
    pub analytics: Arc<MemoryAnalytics>,
    pub business_id: BusinessId,
}

pub async fn build(config: &AppConfig) -> anyhow::Result<DemoPipeline> {
    let business_id = BusinessId(DEMO_BUSINESS_ID.to_string());
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(DeterministicEmbedder::new(config.embedding.dimension));
    let index = Arc::new(EmbeddingIndex::new(config.embedding.dimension));

    seed_content(&business_id, &index, embedder.as_ref()).await?;
    let rules = seed_rules(&business_id, config)?;

    let retriever = ContextRetriever::new(
        Arc::clone(&index),
        Arc::clone(&embedder),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(StaticDirectory::new(vec![(
            business_id.clone(),
            BusinessFacts {
                name: "Trattoria Demo".to_string(),
                hours: vec!["Mon-Sat 11:00-22:00".to_string(), "Sun closed".to_string()],
                location: Some("12 Via Roma".to_string()),
                phone: Some("+1 555 0100".to_string()),
                specials: vec!["Tuesday: two-for-one margherita".to_string()],
            },
        )])),
        RetrieverOptions {
            search_limit: config.pipeline.search_limit,
            min_score: config.pipeline.search_min_score,
            history_window: config.pipeline.history_window,
        },
    );

    let analytics = Arc::new(MemoryAnalytics::new());
    let orchestrator = Arc::new(Orchestrator::new(
        HybridClassifier::<Arc<dyn IntentModel>>::new(
            None,
            config.intent.model_escalation_threshold,
        ),
        retriever,
        rules,
        RuleEngine::new(),
        Arc::new(CannedGenerator),
        Arc::new(InMemorySessionStore::new()),
        Arc::clone(&analytics) as Arc<dyn tably_pipeline::providers::AnalyticsSink>,
        Arc::new(RateLimiter::new(config.pipeline.rate_limit_per_minute)),
        OrchestratorConfig {
            timeout: Duration::from_secs(config.pipeline.timeout_secs),
            retry: RetryPolicy { max_retries: config.llm.max_retries, ..RetryPolicy::default() },
        },
    ));

    Ok(DemoPipeline { orchestrator, analytics, business_id })
}

async fn seed_content(
    business_id: &BusinessId,
    index: &EmbeddingIndex,
    embedder: &dyn EmbeddingProvider,
) -> anyhow::Result<()> {
    let vectorizer = ContentVectorizer::default();
    for item in demo_items(business_id) {
        let vectorized = vectorizer
            .process(&item)
            .with_context(|| format!("demo content `{}` failed to vectorize", item.content_id.0))?;
        let vector = embedder
            .embed(&vectorized.text)
            .await
            .with_context(|| format!("demo content `{}` failed to embed", item.content_id.0))?;
        index
            .upsert(
                business_id.clone(),
                item.content_type,
                item.content_id.clone(),
                vectorized.text,
                vector,
                vectorized.metadata,
            )
            .with_context(|| format!("demo content `{}` failed to index", item.content_id.0))?;
    }
    Ok(())
}

fn demo_items(business_id: &BusinessId) -> Vec<ContentItem> {
    let item = |content_type: ContentType, id: &str, fields: Vec<(&str, serde_json::Value)>| {
        ContentItem {
            business_id: business_id.clone(),
            content_type,
            content_id: ContentId(id.to_string()),
            fields: fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect::<BTreeMap<_, _>>(),
        }
    };

    vec![
        item(
            ContentType::Menu,
            "menu-margherita",
            vec![
                ("name", json!("Margherita Pizza")),
                ("description", json!("Wood-fired pizza with tomato, mozzarella, and basil")),
                ("price", json!("12.50")),
                ("tags", json!("vegetarian")),
            ],
        ),
        item(
            ContentType::Menu,
            "menu-carbonara",
            vec![
                ("name", json!("Spaghetti Carbonara")),
                ("description", json!("Spaghetti with guanciale, egg, and pecorino")),
                ("price", json!("14.00")),
            ],
        ),
        item(
            ContentType::Policy,
            "policy-reservations",
            vec![
                ("title", json!("Reservations")),
                (
                    "content",
                    json!("Reservations are recommended on weekends. Parties over eight should call ahead. Cancellations are free up to two hours before."),
                ),
            ],
        ),
        item(
            ContentType::Faq,
            "faq-gluten",
            vec![
                ("question", json!("Do you offer gluten-free options?")),
                (
                    "answer",
                    json!("Yes, gluten-free pizza bases and pasta are available on request."),
                ),
            ],
        ),
    ]
}

fn seed_rules(business_id: &BusinessId, config: &AppConfig) -> anyhow::Result<Arc<RuleStore>> {
    let cache =
        Arc::new(RuleCache::new(config.pipeline.rule_cache_ttl_secs, Arc::new(SystemClock)));
    let store = Arc::new(RuleStore::new(cache));

    store
        .create(RuleDraft {
            business_id: business_id.clone(),
            category: RuleCategory::ResponseStyle,
            priority: 60,
            conditions: vec![RuleCondition {
                field: "intent.label".to_string(),
                operator: ConditionOperator::NotIn,
                value: json!(["complaint"]),
                case_sensitive: false,
            }],
            actions: vec![RuleAction {
                action_type: ActionType::SetTone,
                parameters: [("tone".to_string(), json!("warm and concise"))]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
                priority: 50,
            }],
            active: true,
        })
        .context("demo tone rule rejected")?;

    store
        .create(RuleDraft {
            business_id: business_id.clone(),
            category: RuleCategory::Escalation,
            priority: 90,
            conditions: vec![RuleCondition {
                field: "intent.label".to_string(),
                operator: ConditionOperator::Equals,
                value: json!("complaint"),
                case_sensitive: false,
            }],
            actions: vec![RuleAction {
                action_type: ActionType::Escalate,
                parameters: BTreeMap::new(),
                priority: 90,
            }],
            active: true,
        })
        .context("demo escalation rule rejected")?;

    Ok(store)
}
