//! Deterministic in-process collaborators. No network, no clocks beyond
//! `Utc::now`, so the smoke command and tests exercise the full pipeline
//! with reproducible behavior.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use tably_core::domain::content::BusinessId;
use tably_core::domain::context::{
    BusinessFacts, ConversationTurn, Session, SessionId, TurnRole,
};
use tably_core::domain::query::TokenUsage;
use tably_core::errors::ProviderError;

use crate::providers::{
    AnalyticsSink, BusinessDirectory, Completion, EmbeddingProvider, GenerationChunk,
    GenerationProvider, QueryLogRecord, SessionStore,
};

/// Hashes word tokens into vector buckets. Similar texts share buckets, so
/// cosine ranking behaves plausibly without a model.
pub struct DeterministicEmbedder {
    dimension: usize,
}

impl DeterministicEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

fn bucket_hash(token: &str) -> u64 {
    // FNV-1a, good enough for bucket spreading.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let token = token.trim_matches(|ch: char| !ch.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            let bucket = (bucket_hash(token) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}

/// Echoes a short answer assembled from the prompt's context section and
/// streams it word by word.
#[derive(Default)]
pub struct CannedGenerator;

impl CannedGenerator {
    fn render(prompt: &str) -> String {
        let first_context_line = prompt
            .lines()
            .skip_while(|line| !line.starts_with("Context:"))
            .nth(1)
            .unwrap_or("")
            .trim();

        if first_context_line.is_empty() {
            "Happy to help with questions about our menu, hours, and policies.".to_string()
        } else {
            format!("Based on what I know: {first_context_line}")
        }
    }
}

#[async_trait]
impl GenerationProvider for CannedGenerator {
    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        let text = Self::render(prompt);
        let usage = TokenUsage::estimated(prompt, &text);
        Ok(Completion { text, usage })
    }

    async fn stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<Result<GenerationChunk, ProviderError>>, ProviderError> {
        let text = Self::render(prompt);
        let (sender, receiver) = mpsc::channel(8);
        tokio::spawn(async move {
            for word in text.split_inclusive(' ') {
                if sender.send(Ok(GenerationChunk { text: word.to_string() })).await.is_err() {
                    return;
                }
            }
        });
        Ok(receiver)
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    turns: Mutex<HashMap<SessionId, Vec<ConversationTurn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, session_id: &SessionId, role: TurnRole, text: impl Into<String>) {
        let mut turns = self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        turns
            .entry(session_id.clone())
            .or_default()
            .push(ConversationTurn { role, text: text.into(), at: Utc::now() });
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(
        &self,
        business_id: &BusinessId,
        session_id: Option<&SessionId>,
        customer_id: Option<&str>,
    ) -> Result<Session, ProviderError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(id) = session_id {
            if let Some(session) = sessions.get(id) {
                return Ok(session.clone());
            }
        }

        let session = Session {
            id: session_id.cloned().unwrap_or_else(|| SessionId(Uuid::new_v4().to_string())),
            business_id: business_id.clone(),
            customer_id: customer_id.map(str::to_string),
            started_at: Utc::now(),
        };
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn history(
        &self,
        _business_id: &BusinessId,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ProviderError> {
        let turns = self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let all = turns.get(session_id).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

pub struct StaticDirectory {
    facts: HashMap<BusinessId, BusinessFacts>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<(BusinessId, BusinessFacts)>) -> Self {
        Self { facts: entries.into_iter().collect() }
    }
}

#[async_trait]
impl BusinessDirectory for StaticDirectory {
    async fn facts(&self, business_id: &BusinessId) -> Result<BusinessFacts, ProviderError> {
        self.facts
            .get(business_id)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidResponse(format!(
                "unknown business {}",
                business_id.0
            )))
    }
}

/// Collects analytics rows in memory for inspection.
#[derive(Default)]
pub struct MemoryAnalytics {
    records: Mutex<Vec<QueryLogRecord>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<QueryLogRecord> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalytics {
    async fn record(&self, record: QueryLogRecord) -> Result<(), ProviderError> {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(record);
        Ok(())
    }
}
