//! Context retrieval: one query embedding, then concurrent lookups across
//! the embedding index, business directory, and session history.
//!
//! Every bucket degrades to empty on its own failure. Retrieval as a whole
//! fails only when the query embedding itself cannot be produced.

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use tably_core::domain::content::{BusinessId, ContentType};
use tably_core::domain::context::{ContextBundle, FaqMatch, MenuMatch, PolicyMatch, SessionId};
use tably_core::errors::ProviderError;
use tably_core::index::{EmbeddingIndex, SearchMatch, SearchOptions};

use crate::providers::{BusinessDirectory, EmbeddingProvider, SessionStore};

const SNIPPET_CHARS: usize = 160;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RetrieveError {
    #[error("query embedding failed: {0}")]
    QueryEmbedding(#[from] ProviderError),
}

#[derive(Clone, Copy, Debug)]
pub struct RetrieverOptions {
    pub search_limit: usize,
    pub min_score: f32,
    pub history_window: usize,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self { search_limit: 5, min_score: 0.2, history_window: 10 }
    }
}

pub struct ContextRetriever {
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn BusinessDirectory>,
    options: RetrieverOptions,
}

impl ContextRetriever {
    pub fn new(
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn BusinessDirectory>,
        options: RetrieverOptions,
    ) -> Self {
        Self { index, embedder, sessions, directory, options }
    }

    pub async fn retrieve(
        &self,
        business_id: &BusinessId,
        query: &str,
        session_id: Option<&SessionId>,
    ) -> Result<ContextBundle, RetrieveError> {
        let query_vector = self.embedder.embed(query).await?;

        let (menu, policies, faqs, facts, history) = tokio::join!(
            async { self.search_bucket(business_id, &query_vector, ContentType::Menu) },
            async { self.search_bucket(business_id, &query_vector, ContentType::Policy) },
            async { self.search_bucket(business_id, &query_vector, ContentType::Faq) },
            self.directory.facts(business_id),
            self.fetch_history(business_id, session_id),
        );

        Ok(ContextBundle {
            menu: menu.into_iter().map(menu_match).collect(),
            policies: policies.into_iter().map(policy_match).collect(),
            faqs: faqs.into_iter().map(faq_match).collect(),
            facts: match facts {
                Ok(facts) => Some(facts),
                Err(error) => {
                    warn!(
                        event_name = "pipeline.retrieve.facts_degraded",
                        business_id = %business_id.0,
                        error = %error,
                        "business facts lookup failed, continuing without facts"
                    );
                    None
                }
            },
            history,
        })
    }

    fn search_bucket(
        &self,
        business_id: &BusinessId,
        query_vector: &[f32],
        content_type: ContentType,
    ) -> Vec<SearchMatch> {
        let options = SearchOptions {
            content_type: Some(content_type),
            limit: self.options.search_limit,
            min_score: self.options.min_score,
        };
        match self.index.search(business_id, query_vector, &options) {
            Ok(matches) => matches,
            Err(error) => {
                warn!(
                    event_name = "pipeline.retrieve.bucket_degraded",
                    business_id = %business_id.0,
                    content_type = content_type.as_str(),
                    error = %error,
                    "embedding search failed, bucket degraded to empty"
                );
                Vec::new()
            }
        }
    }

    async fn fetch_history(
        &self,
        business_id: &BusinessId,
        session_id: Option<&SessionId>,
    ) -> Vec<tably_core::domain::context::ConversationTurn> {
        let Some(session_id) = session_id else {
            return Vec::new();
        };
        match self.sessions.history(business_id, session_id, self.options.history_window).await {
            Ok(turns) => turns,
            Err(error) => {
                warn!(
                    event_name = "pipeline.retrieve.history_degraded",
                    business_id = %business_id.0,
                    error = %error,
                    "conversation history lookup failed, continuing without history"
                );
                Vec::new()
            }
        }
    }
}

/// Similarity in [min,1] mapped straight to confidence, floored at zero.
fn derived_confidence(score: f32) -> f32 {
    score.clamp(0.0, 1.0)
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let prefix: String = text.chars().take(SNIPPET_CHARS).collect();
    let cut = prefix.rfind(char::is_whitespace).unwrap_or(prefix.len());
    format!("{}…", prefix[..cut].trim_end())
}

fn metadata_str(found: &SearchMatch, key: &str) -> Option<String> {
    found.metadata.get(key).and_then(|value| value.as_str()).map(str::to_string)
}

fn menu_match(found: SearchMatch) -> MenuMatch {
    MenuMatch {
        name: metadata_str(&found, "name").unwrap_or_else(|| snippet(&found.text)),
        snippet: snippet(&found.text),
        similarity: found.score,
        confidence: derived_confidence(found.score),
        content_id: found.content_id,
    }
}

fn policy_match(found: SearchMatch) -> PolicyMatch {
    PolicyMatch {
        title: metadata_str(&found, "title").unwrap_or_else(|| snippet(&found.text)),
        snippet: snippet(&found.text),
        similarity: found.score,
        confidence: derived_confidence(found.score),
        content_id: found.content_id,
    }
}

fn faq_match(found: SearchMatch) -> FaqMatch {
    FaqMatch {
        question: metadata_str(&found, "question").unwrap_or_else(|| snippet(&found.text)),
        snippet: snippet(&found.text),
        similarity: found.score,
        confidence: derived_confidence(found.score),
        content_id: found.content_id,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tably_core::domain::content::{BusinessId, ContentId, ContentType};
    use tably_core::domain::context::{BusinessFacts, SessionId, TurnRole};
    use tably_core::errors::ProviderError;
    use tably_core::index::EmbeddingIndex;

    use crate::providers::EmbeddingProvider;
    use crate::stub::{InMemorySessionStore, StaticDirectory};

    use super::{ContextRetriever, RetrieveError, RetrieverOptions};

    struct FixedEmbedder {
        result: Result<Vec<f32>, ProviderError>,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            self.result.clone()
        }
    }

    fn business() -> BusinessId {
        BusinessId("biz-1".to_string())
    }

    fn retriever(index: Arc<EmbeddingIndex>, embedder: FixedEmbedder) -> ContextRetriever {
        ContextRetriever::new(
            index,
            Arc::new(embedder),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(StaticDirectory::new(vec![(
                business(),
                BusinessFacts { name: "Trattoria Uno".to_string(), ..BusinessFacts::default() },
            )])),
            RetrieverOptions { min_score: 0.1, ..RetrieverOptions::default() },
        )
    }

    #[tokio::test]
    async fn merges_typed_buckets_and_facts() {
        let index = Arc::new(EmbeddingIndex::new(2));
        index
            .upsert(
                business(),
                ContentType::Menu,
                ContentId("pizza".to_string()),
                "Margherita Pizza. Tomato and basil".to_string(),
                vec![1.0, 0.0],
                [("name".to_string(), serde_json::json!("Margherita Pizza"))]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            )
            .expect("upsert");

        let retriever = retriever(index, FixedEmbedder { result: Ok(vec![1.0, 0.0]) });
        let bundle = retriever.retrieve(&business(), "pizza?", None).await.expect("retrieve");

        assert_eq!(bundle.menu.len(), 1);
        assert_eq!(bundle.menu[0].name, "Margherita Pizza");
        assert!(bundle.policies.is_empty());
        assert_eq!(bundle.facts.as_ref().map(|f| f.name.as_str()), Some("Trattoria Uno"));
    }

    #[tokio::test]
    async fn one_retrieve_fills_every_bucket() {
        let index = Arc::new(EmbeddingIndex::new(2));
        for (content_type, id, key, label) in [
            (ContentType::Menu, "pizza", "name", "Margherita Pizza"),
            (ContentType::Policy, "reservations", "title", "Reservations"),
            (ContentType::Faq, "gluten", "question", "Is the pasta gluten free?"),
        ] {
            index
                .upsert(
                    business(),
                    content_type,
                    ContentId(id.to_string()),
                    format!("{label}. Details available on request"),
                    vec![1.0, 0.0],
                    [(key.to_string(), serde_json::json!(label))]
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                )
                .expect("upsert");
        }

        let sessions = Arc::new(InMemorySessionStore::new());
        let session_id = SessionId("sess-1".to_string());
        sessions.push_turn(&session_id, TurnRole::Customer, "do you take bookings?");

        let retriever = ContextRetriever::new(
            index,
            Arc::new(FixedEmbedder { result: Ok(vec![1.0, 0.0]) }),
            sessions,
            Arc::new(StaticDirectory::new(vec![(
                business(),
                BusinessFacts { name: "Trattoria Uno".to_string(), ..BusinessFacts::default() },
            )])),
            RetrieverOptions { min_score: 0.1, ..RetrieverOptions::default() },
        );

        let bundle =
            retriever.retrieve(&business(), "pizza?", Some(&session_id)).await.expect("retrieve");

        assert_eq!(bundle.menu.len(), 1);
        assert_eq!(bundle.policies.len(), 1);
        assert_eq!(bundle.faqs.len(), 1);
        assert!(bundle.facts.is_some());
        assert_eq!(bundle.history.len(), 1);
    }

    #[tokio::test]
    async fn embedding_failure_fails_retrieval_as_a_whole() {
        let index = Arc::new(EmbeddingIndex::new(2));
        let retriever = retriever(
            index,
            FixedEmbedder {
                result: Err(ProviderError::QuotaExceeded("embedding tokens".to_string())),
            },
        );

        let result = retriever.retrieve(&business(), "pizza?", None).await;
        assert!(matches!(result, Err(RetrieveError::QueryEmbedding(_))));
    }

    #[tokio::test]
    async fn dimension_mismatch_degrades_buckets_to_empty() {
        // Index expects 3-dim vectors but the embedder returns 2-dim ones.
        let index = Arc::new(EmbeddingIndex::new(3));
        let retriever = retriever(index, FixedEmbedder { result: Ok(vec![1.0, 0.0]) });

        let bundle = retriever.retrieve(&business(), "pizza?", None).await.expect("retrieve");
        assert!(bundle.menu.is_empty());
        assert!(bundle.faqs.is_empty());
        assert!(bundle.facts.is_some());
    }
}
