use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub String);

/// The content sources a business exposes to semantic retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Menu,
    Policy,
    Faq,
    Business,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Menu => "menu",
            Self::Policy => "policy",
            Self::Faq => "faq",
            Self::Business => "business",
        }
    }
}

/// One versioned unit of business content handed to the vectorizer.
/// Immutable once captured; a content edit produces a fresh item that
/// supersedes the previous embedding via upsert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub business_id: BusinessId,
    pub content_type: ContentType,
    pub content_id: ContentId,
    pub fields: BTreeMap<String, Value>,
}

impl ContentItem {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}
