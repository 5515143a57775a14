use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::content::{BusinessId, ContentId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Customer,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub business_id: BusinessId,
    pub customer_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Read-only operational facts served by the business directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessFacts {
    pub name: String,
    pub hours: Vec<String>,
    pub location: Option<String>,
    pub phone: Option<String>,
    pub specials: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuMatch {
    pub content_id: ContentId,
    pub name: String,
    pub snippet: String,
    pub similarity: f32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub content_id: ContentId,
    pub title: String,
    pub snippet: String,
    pub similarity: f32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaqMatch {
    pub content_id: ContentId,
    pub question: String,
    pub snippet: String,
    pub similarity: f32,
    pub confidence: f32,
}

/// Everything retrieval assembled for one query. Built fresh per request
/// and owned by that request's task for its whole lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub menu: Vec<MenuMatch>,
    pub policies: Vec<PolicyMatch>,
    pub faqs: Vec<FaqMatch>,
    pub facts: Option<BusinessFacts>,
    pub history: Vec<ConversationTurn>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.menu.is_empty()
            && self.policies.is_empty()
            && self.faqs.is_empty()
            && self.facts.is_none()
            && self.history.is_empty()
    }

    /// Content ids of every embedding match that contributed, menu first.
    pub fn source_ids(&self) -> Vec<ContentId> {
        self.menu
            .iter()
            .map(|m| m.content_id.clone())
            .chain(self.policies.iter().map(|m| m.content_id.clone()))
            .chain(self.faqs.iter().map(|m| m.content_id.clone()))
            .collect()
    }
}
