//! Hybrid intent classification.
//!
//! Stage one scores the query against per-intent keyword and regex tables;
//! stage two escalates low-confidence queries to an external language model
//! constrained to the same taxonomy. The model is strictly a classifier
//! here. It never shapes the answer, only labels the question.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// Fixed intent taxonomy for customer queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    MenuInquiry,
    HoursPolicy,
    Pricing,
    DietaryRestriction,
    Location,
    GeneralChat,
    Complaint,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MenuInquiry => "menu_inquiry",
            Self::HoursPolicy => "hours_policy",
            Self::Pricing => "pricing",
            Self::DietaryRestriction => "dietary_restriction",
            Self::Location => "location",
            Self::GeneralChat => "general_chat",
            Self::Complaint => "complaint",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "menu_inquiry" => Some(Self::MenuInquiry),
            "hours_policy" => Some(Self::HoursPolicy),
            "pricing" => Some(Self::Pricing),
            "dietary_restriction" => Some(Self::DietaryRestriction),
            "location" => Some(Self::Location),
            "general_chat" => Some(Self::GeneralChat),
            "complaint" => Some(Self::Complaint),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentScore {
    pub intent: Intent,
    pub confidence: f32,
}

/// Classification outcome. Ephemeral: logged for analytics, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f32,
    pub alternatives: Vec<IntentScore>,
}

impl IntentResult {
    pub fn unknown(confidence: f32) -> Self {
        Self { intent: Intent::Unknown, confidence, alternatives: Vec::new() }
    }
}

/// Stage-two seam. Implementations send the prompt to a language model and
/// return its raw text output; parsing stays here.
#[async_trait]
pub trait IntentModel: Send + Sync {
    async fn classify_intent(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[async_trait]
impl<T> IntentModel for std::sync::Arc<T>
where
    T: IntentModel + ?Sized,
{
    async fn classify_intent(&self, prompt: &str) -> Result<String, ProviderError> {
        (**self).classify_intent(prompt).await
    }
}

pub const DEFAULT_MODEL_ESCALATION_THRESHOLD: f32 = 0.5;

/// Keyword hits count once, pattern hits twice; five weighted hits saturate
/// the confidence scale.
const SCORE_SCALE: f32 = 5.0;
const ALTERNATIVE_FLOOR: f32 = 0.1;
const MAX_ALTERNATIVES: usize = 3;
const AGREEMENT_BONUS: f32 = 0.1;
const DISAGREEMENT_FLOOR: f32 = 0.3;
const MODEL_FALLBACK_CONFIDENCE: f32 = 0.1;

struct IntentSignals {
    intent: Intent,
    keywords: &'static [&'static str],
    patterns: Vec<Regex>,
}

fn signals(intent: Intent, keywords: &'static [&'static str], patterns: &[&str]) -> IntentSignals {
    IntentSignals {
        intent,
        keywords,
        patterns: patterns
            .iter()
            .map(|pattern| Regex::new(pattern).expect("intent pattern must compile"))
            .collect(),
    }
}

static SIGNAL_TABLE: Lazy<Vec<IntentSignals>> = Lazy::new(|| {
    vec![
        signals(
            Intent::MenuInquiry,
            &["menu", "dish", "dishes", "food", "serve", "order", "appetizer", "dessert", "special"],
            &[r"what.*(menu|serve|food)", r"do you (have|serve|offer)"],
        ),
        signals(
            Intent::HoursPolicy,
            &["hours", "open", "close", "closed", "policy", "reservation", "booking", "holiday"],
            &[r"(what|when).*(hours|open|close)", r"are you open"],
        ),
        signals(
            Intent::Pricing,
            &["price", "prices", "cost", "expensive", "cheap", "deal", "discount"],
            &[r"how much", r"\$\d+"],
        ),
        signals(
            Intent::DietaryRestriction,
            &["vegan", "vegetarian", "gluten", "allergy", "allergic", "dairy", "nut", "halal", "kosher"],
            &[r"(gluten|dairy|nut)[\s-]?free", r"is .* (vegan|vegetarian)"],
        ),
        signals(
            Intent::Location,
            &["where", "location", "address", "directions", "parking", "nearby"],
            &[r"where (are|is) (you|your)", r"how (do|can) i (get|find)"],
        ),
        signals(
            Intent::GeneralChat,
            &["hello", "hi", "hey", "thanks", "thank", "bye", "goodbye"],
            &[r"^\s*(hi|hello|hey)\b"],
        ),
        signals(
            Intent::Complaint,
            &["complaint", "terrible", "awful", "wrong", "cold", "rude", "slow", "disappointed", "refund"],
            &[r"(never|not) (coming|ordering) (back|again)", r"speak (to|with) (a|the) manager"],
        ),
    ]
});

pub const INTENT_PROMPT_TEMPLATE: &str = "Classify the customer message into exactly one intent.\n\
Allowed intents: menu_inquiry, hours_policy, pricing, dietary_restriction, location, general_chat, complaint, unknown.\n\
Respond with strict JSON only: {\"intent\": \"<label>\", \"confidence\": <0.0-1.0>}\n\
Customer message: {message}";

pub fn intent_prompt(text: &str) -> String {
    INTENT_PROMPT_TEMPLATE.replace("{message}", text)
}

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    intent: String,
    confidence: f32,
}

/// Stage one: deterministic keyword + pattern scoring.
pub fn classify_rules(text: &str) -> IntentResult {
    let lowered = text.to_lowercase();

    let mut scored: Vec<IntentScore> = SIGNAL_TABLE
        .iter()
        .map(|row| {
            let keyword_hits =
                row.keywords.iter().filter(|keyword| lowered.contains(*keyword)).count();
            let pattern_hits =
                row.patterns.iter().filter(|pattern| pattern.is_match(&lowered)).count();
            let raw = keyword_hits as f32 + 2.0 * pattern_hits as f32;
            IntentScore { intent: row.intent, confidence: (raw / SCORE_SCALE).clamp(0.0, 1.0) }
        })
        .filter(|score| score.confidence > 0.0)
        .collect();

    scored.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

    let Some(top) = scored.first().copied() else {
        return IntentResult::unknown(0.0);
    };

    let alternatives = scored
        .iter()
        .skip(1)
        .filter(|score| score.confidence > ALTERNATIVE_FLOOR)
        .take(MAX_ALTERNATIVES)
        .copied()
        .collect();

    IntentResult { intent: top.intent, confidence: top.confidence, alternatives }
}

#[derive(Clone)]
pub struct HybridClassifier<M> {
    model: Option<M>,
    escalation_threshold: f32,
}

impl<M> HybridClassifier<M>
where
    M: IntentModel,
{
    pub fn new(model: Option<M>, escalation_threshold: f32) -> Self {
        Self { model, escalation_threshold }
    }

    pub fn rules_only() -> Self {
        Self { model: None, escalation_threshold: DEFAULT_MODEL_ESCALATION_THRESHOLD }
    }

    /// Two-stage classification. Model-stage failures degrade to the
    /// rule-based result at half confidence rather than propagating.
    pub async fn classify(&self, text: &str) -> IntentResult {
        let rule_result = classify_rules(text);
        if rule_result.confidence >= self.escalation_threshold {
            return rule_result;
        }

        let Some(model) = &self.model else {
            return rule_result;
        };

        let raw = match model.classify_intent(&intent_prompt(text)).await {
            Ok(raw) => raw,
            Err(_) => {
                let mut degraded = rule_result;
                degraded.confidence /= 2.0;
                return degraded;
            }
        };

        let model_result = parse_model_verdict(&raw);
        merge_results(rule_result, model_result)
    }
}

fn parse_model_verdict(raw: &str) -> IntentScore {
    let parsed: Option<ModelVerdict> = serde_json::from_str(raw.trim()).ok();
    match parsed.and_then(|verdict| {
        Intent::from_label(&verdict.intent)
            .map(|intent| IntentScore { intent, confidence: verdict.confidence.clamp(0.0, 1.0) })
    }) {
        Some(score) => score,
        None => IntentScore { intent: Intent::Unknown, confidence: MODEL_FALLBACK_CONFIDENCE },
    }
}

fn merge_results(rules: IntentResult, model: IntentScore) -> IntentResult {
    if rules.intent == model.intent {
        let combined =
            ((rules.confidence + model.confidence) / 2.0 + AGREEMENT_BONUS).clamp(0.0, 1.0);
        return IntentResult { intent: rules.intent, confidence: combined, alternatives: rules.alternatives };
    }

    // Rules produced nothing: whatever the model says is all we have.
    if rules.confidence == 0.0 {
        return IntentResult { intent: model.intent, confidence: model.confidence, alternatives: Vec::new() };
    }

    let both_plausible =
        rules.confidence > DISAGREEMENT_FLOOR && model.confidence > DISAGREEMENT_FLOOR;
    let model_wins = if both_plausible {
        model.confidence > rules.confidence
    } else {
        model.confidence > DISAGREEMENT_FLOOR && rules.confidence <= DISAGREEMENT_FLOOR
    };

    if model_wins {
        let mut alternatives = vec![IntentScore { intent: rules.intent, confidence: rules.confidence }];
        alternatives.extend(rules.alternatives.into_iter().take(MAX_ALTERNATIVES - 1));
        IntentResult { intent: model.intent, confidence: model.confidence, alternatives }
    } else {
        rules
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::errors::ProviderError;

    use super::{
        classify_rules, HybridClassifier, Intent, IntentModel, DEFAULT_MODEL_ESCALATION_THRESHOLD,
    };

    struct ScriptedModel {
        response: Result<String, ProviderError>,
    }

    #[async_trait]
    impl IntentModel for ScriptedModel {
        async fn classify_intent(&self, _prompt: &str) -> Result<String, ProviderError> {
            self.response.clone()
        }
    }

    #[test]
    fn hours_question_scores_at_least_half_from_rules_alone() {
        let result = classify_rules("What are your hours?");
        assert_eq!(result.intent, Intent::HoursPolicy);
        assert!(result.confidence >= 0.5, "confidence was {}", result.confidence);
    }

    #[test]
    fn dietary_question_beats_menu_signals() {
        let result = classify_rules("Are your desserts nut-free or vegan?");
        assert_eq!(result.intent, Intent::DietaryRestriction);
        assert!(result.alternatives.iter().any(|alt| alt.intent == Intent::MenuInquiry));
    }

    #[test]
    fn unintelligible_text_is_unknown_with_zero_confidence() {
        let result = classify_rules("qwertyuiop zxcvbnm");
        assert_eq!(result.intent, Intent::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!(result.alternatives.is_empty());
    }

    #[tokio::test]
    async fn confident_rule_result_skips_the_model() {
        let classifier = HybridClassifier::new(
            Some(ScriptedModel {
                response: Ok(r#"{"intent": "pricing", "confidence": 0.99}"#.to_string()),
            }),
            DEFAULT_MODEL_ESCALATION_THRESHOLD,
        );
        let result = classifier.classify("What are your hours?").await;
        assert_eq!(result.intent, Intent::HoursPolicy);
    }

    #[tokio::test]
    async fn agreement_boosts_combined_confidence() {
        let classifier = HybridClassifier::new(
            Some(ScriptedModel {
                response: Ok(r#"{"intent": "pricing", "confidence": 0.6}"#.to_string()),
            }),
            DEFAULT_MODEL_ESCALATION_THRESHOLD,
        );
        // "expensive" alone: one keyword hit, 0.2 from rules.
        let result = classifier.classify("Is it expensive?").await;
        assert_eq!(result.intent, Intent::Pricing);
        assert!((result.confidence - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn disagreement_prefers_higher_confidence() {
        let classifier = HybridClassifier::new(
            Some(ScriptedModel {
                response: Ok(r#"{"intent": "complaint", "confidence": 0.9}"#.to_string()),
            }),
            DEFAULT_MODEL_ESCALATION_THRESHOLD,
        );
        let result = classifier.classify("Is it expensive?").await;
        assert_eq!(result.intent, Intent::Complaint);
        assert!(result.alternatives.iter().any(|alt| alt.intent == Intent::Pricing));
    }

    #[tokio::test]
    async fn unparseable_model_output_degrades_to_unknown_floor() {
        let classifier = HybridClassifier::new(
            Some(ScriptedModel { response: Ok("not json at all".to_string()) }),
            DEFAULT_MODEL_ESCALATION_THRESHOLD,
        );
        // Rules give 0.2 for "expensive"; the broken model verdict becomes
        // Unknown at 0.1 and loses to the rule result.
        let result = classifier.classify("Is it expensive?").await;
        assert_eq!(result.intent, Intent::Pricing);
    }

    #[tokio::test]
    async fn model_error_halves_rule_confidence() {
        let classifier = HybridClassifier::new(
            Some(ScriptedModel {
                response: Err(ProviderError::Transport("connection reset".to_string())),
            }),
            DEFAULT_MODEL_ESCALATION_THRESHOLD,
        );
        let result = classifier.classify("Is it expensive?").await;
        assert_eq!(result.intent, Intent::Pricing);
        assert!((result.confidence - 0.1).abs() < 1e-6);
    }
}
