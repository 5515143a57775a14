use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::content::BusinessId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    ResponseStyle,
    Escalation,
    Content,
    Promotion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

/// One predicate over the evaluation context. `field` is a dot-path into
/// the context (e.g. `query.text`, `intent.label`, `context.menu_count`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SetTone,
    AddConstraint,
    Escalate,
    SuggestItem,
    AppendDisclaimer,
}

/// A response-shaping instruction emitted when the owning rule matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub action_type: ActionType,
    pub parameters: BTreeMap<String, Value>,
    pub priority: u8,
}

/// Conflict classes are the contract shared by the evaluator and the
/// rule-write validation. Tone actions conflict per parameter key;
/// escalation actions are globally mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConflictClass {
    Tone { parameter: String },
    Escalation,
}

impl RuleAction {
    pub fn conflict_class(&self) -> Option<ConflictClass> {
        match self.action_type {
            ActionType::SetTone => {
                let parameter = self
                    .parameters
                    .keys()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "tone".to_string());
                Some(ConflictClass::Tone { parameter })
            }
            ActionType::Escalate => Some(ConflictClass::Escalation),
            ActionType::AddConstraint
            | ActionType::SuggestItem
            | ActionType::AppendDisclaimer => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: RuleId,
    pub business_id: BusinessId,
    pub category: RuleCategory,
    /// 1..=100, higher wins conflicts.
    pub priority: u8,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub active: bool,
    /// Monotonically increasing, bumped on every update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
