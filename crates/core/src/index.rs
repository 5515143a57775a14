//! In-memory embedding index: one live vector per
//! `(business, content_type, content_id)`, cosine nearest-neighbor search.
//!
//! The index is read-mostly and shared across queries; writes replace whole
//! rows under the write lock so readers never see a half-updated record.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::content::{BusinessId, ContentId, ContentType};

pub const DEFAULT_DIMENSION: usize = 1536;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("no live embedding for content `{0}`")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingRecord {
    pub id: String,
    pub business_id: BusinessId,
    pub content_type: ContentType,
    pub content_id: ContentId,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub content_type: Option<ContentType>,
    pub limit: usize,
    pub min_score: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { content_type: None, limit: 5, min_score: 0.0 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchMatch {
    pub content_id: ContentId,
    pub content_type: ContentType,
    pub score: f32,
    pub text: String,
    pub metadata: BTreeMap<String, Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EmbeddingIndex {
    dimension: usize,
    rows: RwLock<HashMap<BusinessId, Vec<EmbeddingRecord>>>,
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl EmbeddingIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, rows: RwLock::new(HashMap::new()) }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Inserts or replaces the live embedding for the content key. The
    /// dimension check happens before any row is touched.
    pub fn upsert(
        &self,
        business_id: BusinessId,
        content_type: ContentType,
        content_id: ContentId,
        text: String,
        vector: Vec<f32>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<(), IndexError> {
        self.check_dimension(&vector)?;
        let now = Utc::now();

        let mut rows = self.rows.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let business_rows = rows.entry(business_id.clone()).or_default();

        let existing = business_rows.iter_mut().find(|row| {
            row.deleted_at.is_none()
                && row.content_type == content_type
                && row.content_id == content_id
        });

        match existing {
            Some(row) => {
                row.text = text;
                row.vector = vector;
                row.metadata = metadata;
                row.updated_at = now;
            }
            None => business_rows.push(EmbeddingRecord {
                id: Uuid::new_v4().to_string(),
                business_id,
                content_type,
                content_id,
                text,
                vector,
                metadata,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            }),
        }

        Ok(())
    }

    /// Soft-deletes the live row for the content key.
    pub fn delete(
        &self,
        business_id: &BusinessId,
        content_type: ContentType,
        content_id: &ContentId,
    ) -> Result<(), IndexError> {
        let mut rows = self.rows.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let business_rows = rows
            .get_mut(business_id)
            .ok_or_else(|| IndexError::NotFound(content_id.0.clone()))?;

        let row = business_rows
            .iter_mut()
            .find(|row| {
                row.deleted_at.is_none()
                    && row.content_type == content_type
                    && row.content_id == *content_id
            })
            .ok_or_else(|| IndexError::NotFound(content_id.0.clone()))?;

        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    /// Ranked nearest-neighbor search over live rows. Scores below
    /// `min_score` are dropped; ties on score fall back to recency.
    pub fn search(
        &self,
        business_id: &BusinessId,
        query_vector: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchMatch>, IndexError> {
        self.check_dimension(query_vector)?;

        let rows = self.rows.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(business_rows) = rows.get(business_id) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<SearchMatch> = business_rows
            .iter()
            .filter(|row| row.deleted_at.is_none())
            .filter(|row| options.content_type.map_or(true, |ct| row.content_type == ct))
            .map(|row| SearchMatch {
                content_id: row.content_id.clone(),
                content_type: row.content_type,
                score: cosine_similarity(query_vector, &row.vector),
                text: row.text.clone(),
                metadata: row.metadata.clone(),
                updated_at: row.updated_at,
            })
            .filter(|candidate| candidate.score >= options.min_score)
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        matches.truncate(options.limit);
        Ok(matches)
    }

    /// Live row count for one business, any content type.
    pub fn live_count(&self, business_id: &BusinessId) -> usize {
        let rows = self.rows.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        rows.get(business_id)
            .map(|rows| rows.iter().filter(|row| row.deleted_at.is_none()).count())
            .unwrap_or(0)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Cosine similarity between two equal-length vectors. Zero-magnitude
/// inputs score 0.0 instead of dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut mag_a, mut mag_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0) as f32
    }
}
