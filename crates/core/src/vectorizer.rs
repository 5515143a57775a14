//! Turns structured business content into embeddable text.
//!
//! The output text is bounded so downstream embedding calls never exceed
//! provider limits. Token estimates use a 4:1 character heuristic, not a
//! real tokenizer.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::content::{ContentItem, ContentType};

pub const DEFAULT_TOKEN_BUDGET: usize = 8_000;
const CHARS_PER_TOKEN: usize = 4;
const TRUNCATION_MARKER: &str = "…";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VectorizeError {
    #[error("{content_type} content requires field `{field}`")]
    MissingField { content_type: &'static str, field: &'static str },
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorizedContent {
    pub text: String,
    pub token_estimate: usize,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Clone, Debug)]
pub struct ContentVectorizer {
    token_budget: usize,
}

impl Default for ContentVectorizer {
    fn default() -> Self {
        Self { token_budget: DEFAULT_TOKEN_BUDGET }
    }
}

impl ContentVectorizer {
    pub fn with_token_budget(token_budget: usize) -> Self {
        Self { token_budget }
    }

    pub fn process(&self, item: &ContentItem) -> Result<VectorizedContent, VectorizeError> {
        self.check_required_fields(item)?;

        let sections = match item.content_type {
            ContentType::Menu => self.menu_sections(item),
            ContentType::Policy => self.labeled_sections(item, &[("title", None), ("content", None)]),
            ContentType::Faq => {
                self.labeled_sections(item, &[("question", Some("Q")), ("answer", Some("A"))])
            }
            ContentType::Business => self.business_sections(item),
        };

        let joined = sections.join(". ");
        let cleaned = clean_text(&joined);
        let text = truncate_at_word_boundary(&cleaned, self.token_budget * CHARS_PER_TOKEN);
        let token_estimate = estimate_tokens(&text);

        Ok(VectorizedContent { text, token_estimate, metadata: salient_metadata(item) })
    }

    fn check_required_fields(&self, item: &ContentItem) -> Result<(), VectorizeError> {
        let required: &[&'static str] = match item.content_type {
            ContentType::Menu => &["name"],
            ContentType::Policy => &["title", "content"],
            ContentType::Faq => &["question", "answer"],
            ContentType::Business => &["name"],
        };

        for field in required {
            let present = item.field_str(field).map(str::trim).is_some_and(|v| !v.is_empty());
            if !present {
                return Err(VectorizeError::MissingField {
                    content_type: item.content_type.as_str(),
                    field,
                });
            }
        }
        Ok(())
    }

    fn menu_sections(&self, item: &ContentItem) -> Vec<String> {
        let mut sections = Vec::new();
        if let Some(name) = item.field_str("name") {
            sections.push(name.to_string());
        }
        if let Some(description) = item.field_str("description") {
            sections.push(description.to_string());
        }
        if let Some(category) = item.field_str("category") {
            sections.push(format!("Category: {category}"));
        }
        if let Some(price) = item.fields.get("price") {
            sections.push(format!("Price: {price}"));
        }
        if let Some(Value::Array(tags)) = item.fields.get("dietary_tags") {
            let tags =
                tags.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", ");
            if !tags.is_empty() {
                sections.push(format!("Dietary: {tags}"));
            }
        }
        sections
    }

    fn business_sections(&self, item: &ContentItem) -> Vec<String> {
        let mut sections = Vec::new();
        for field in ["name", "description", "cuisine", "location", "hours"] {
            if let Some(value) = item.field_str(field) {
                sections.push(value.to_string());
            }
        }
        sections
    }

    fn labeled_sections(
        &self,
        item: &ContentItem,
        fields: &[(&str, Option<&str>)],
    ) -> Vec<String> {
        fields
            .iter()
            .filter_map(|(field, label)| {
                item.field_str(field).map(|value| match label {
                    Some(label) => format!("{label}: {value}"),
                    None => value.to_string(),
                })
            })
            .collect()
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn salient_metadata(item: &ContentItem) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("content_type".to_string(), Value::from(item.content_type.as_str()));
    for field in ["name", "title", "question", "category", "price"] {
        if let Some(value) = item.fields.get(field) {
            metadata.insert(field.to_string(), value.clone());
        }
    }
    metadata
}

fn clean_text(text: &str) -> String {
    let without_control: String =
        text.chars().map(|ch| if ch.is_control() { ' ' } else { ch }).collect();
    without_control.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cuts at the last word boundary that fits `max_chars`, leaving room for
/// the truncation marker.
fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let budget = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let prefix: String = text.chars().take(budget).collect();
    let cut = prefix.rfind(char::is_whitespace).unwrap_or(prefix.len());
    let mut truncated = prefix[..cut].trim_end().to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::collections::BTreeMap;

    use crate::domain::content::{BusinessId, ContentId, ContentItem, ContentType};

    use super::{estimate_tokens, ContentVectorizer, VectorizeError};

    fn item(content_type: ContentType, fields: &[(&str, serde_json::Value)]) -> ContentItem {
        ContentItem {
            business_id: BusinessId("biz-1".to_string()),
            content_type,
            content_id: ContentId("content-1".to_string()),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn menu_item_concatenates_salient_fields() {
        let vectorizer = ContentVectorizer::default();
        let vectorized = vectorizer
            .process(&item(
                ContentType::Menu,
                &[
                    ("name", json!("Margherita Pizza")),
                    ("description", json!("Tomato, mozzarella, basil")),
                    ("category", json!("Pizza")),
                    ("price", json!(14.5)),
                    ("dietary_tags", json!(["vegetarian"])),
                ],
            ))
            .expect("valid menu item");

        assert!(vectorized.text.contains("Margherita Pizza"));
        assert!(vectorized.text.contains("Category: Pizza"));
        assert!(vectorized.text.contains("Dietary: vegetarian"));
        assert_eq!(vectorized.metadata.get("name"), Some(&json!("Margherita Pizza")));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let vectorizer = ContentVectorizer::default();
        let result = vectorizer.process(&item(ContentType::Faq, &[("question", json!("Hours?"))]));
        assert_eq!(
            result,
            Err(VectorizeError::MissingField { content_type: "faq", field: "answer" })
        );
    }

    #[test]
    fn blank_required_field_counts_as_missing() {
        let vectorizer = ContentVectorizer::default();
        let result = vectorizer.process(&item(ContentType::Menu, &[("name", json!("   "))]));
        assert!(matches!(result, Err(VectorizeError::MissingField { field: "name", .. })));
    }

    #[test]
    fn control_characters_and_excess_whitespace_are_stripped() {
        let vectorizer = ContentVectorizer::default();
        let vectorized = vectorizer
            .process(&item(
                ContentType::Policy,
                &[("title", json!("Refunds")), ("content", json!("Full\u{0007} refund\n\n  within 14   days"))],
            ))
            .expect("valid policy");

        assert_eq!(vectorized.text, "Refunds. Full refund within 14 days");
    }

    #[test]
    fn long_content_is_truncated_at_a_word_boundary_within_budget() {
        let vectorizer = ContentVectorizer::with_token_budget(16);
        let long_answer = "word ".repeat(200);
        let vectorized = vectorizer
            .process(&item(
                ContentType::Faq,
                &[("question", json!("Catering?")), ("answer", json!(long_answer))],
            ))
            .expect("valid faq");

        assert!(vectorized.token_estimate <= 16);
        assert!(vectorized.text.ends_with('…'));
        // No mid-word cut: the char before the marker ends a whole word.
        let before_marker =
            vectorized.text.trim_end_matches('…').chars().next_back().expect("text");
        assert!(!before_marker.is_whitespace());
        assert!(vectorized.text.trim_end_matches('…').ends_with("word"));
    }

    #[test]
    fn token_estimate_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
        assert_eq!(estimate_tokens(""), 0);
    }
}
