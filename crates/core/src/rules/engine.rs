//! Rule evaluation: OR-matched conditions, priority-ordered action
//! accumulation, and class-based conflict resolution.

use regex::Regex;
use serde_json::Value;

use crate::domain::content::BusinessId;
use crate::domain::context::ContextBundle;
use crate::domain::rule::{BusinessRule, ConditionOperator, RuleAction, RuleCondition, RuleId};
use crate::intent::IntentResult;

/// The slice of one query's state a rule condition may address, via
/// dot-paths such as `query.text`, `intent.label`, or `context.menu_count`.
#[derive(Clone, Debug)]
pub struct EvaluationContext<'a> {
    pub business_id: &'a BusinessId,
    pub query_text: &'a str,
    pub intent: &'a IntentResult,
    pub bundle: &'a ContextBundle,
}

impl EvaluationContext<'_> {
    fn resolve(&self, field: &str) -> Option<Value> {
        match field {
            "query.text" => Some(Value::from(self.query_text)),
            "intent" | "intent.label" => Some(Value::from(self.intent.intent.as_str())),
            "intent.confidence" => Some(Value::from(f64::from(self.intent.confidence))),
            "context.menu_count" => Some(Value::from(self.bundle.menu.len())),
            "context.policy_count" => Some(Value::from(self.bundle.policies.len())),
            "context.faq_count" => Some(Value::from(self.bundle.faqs.len())),
            "context.history_count" => Some(Value::from(self.bundle.history.len())),
            "business.name" => {
                self.bundle.facts.as_ref().map(|facts| Value::from(facts.name.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppliedAction {
    pub rule_id: RuleId,
    pub rule_priority: u8,
    pub action: RuleAction,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleEvaluation {
    pub applicable_rules: Vec<RuleId>,
    pub applied_actions: Vec<AppliedAction>,
    pub conflicts_resolved: usize,
}

#[derive(Clone, Debug, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic: same rules and same context always produce the same
    /// actions and conflict count.
    pub fn evaluate(&self, rules: &[BusinessRule], context: &EvaluationContext<'_>) -> RuleEvaluation {
        let mut applicable: Vec<&BusinessRule> = rules
            .iter()
            .filter(|rule| rule.active && rule.business_id == *context.business_id)
            .filter(|rule| rule_matches(rule, context))
            .collect();

        // Higher priority first; stable sort keeps discovery order on ties.
        applicable.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut applied: Vec<AppliedAction> = Vec::new();
        let mut conflicts_resolved = 0usize;

        for rule in &applicable {
            for action in &rule.actions {
                let incoming = AppliedAction {
                    rule_id: rule.id.clone(),
                    rule_priority: rule.priority,
                    action: action.clone(),
                };

                match find_conflict(&applied, &incoming) {
                    Some(existing_index) => {
                        conflicts_resolved += 1;
                        // Ties favor the already-accumulated action, which
                        // walked in at higher-or-equal priority.
                        if incoming.rule_priority > applied[existing_index].rule_priority {
                            applied.remove(existing_index);
                            applied.push(incoming);
                        }
                    }
                    None => applied.push(incoming),
                }
            }
        }

        RuleEvaluation {
            applicable_rules: applicable.iter().map(|rule| rule.id.clone()).collect(),
            applied_actions: applied,
            conflicts_resolved,
        }
    }
}

/// Two actions conflict when they share a conflict class. Tone classes
/// carry their parameter key, so equal classes already mean the same key;
/// escalation classes are all equal and therefore always collide.
fn find_conflict(applied: &[AppliedAction], incoming: &AppliedAction) -> Option<usize> {
    let incoming_class = incoming.action.conflict_class()?;
    applied
        .iter()
        .position(|existing| existing.action.conflict_class().as_ref() == Some(&incoming_class))
}

/// OR semantics: a rule applies when at least one condition matches.
/// A rule with no conditions matches nothing (writes reject those anyway).
fn rule_matches(rule: &BusinessRule, context: &EvaluationContext<'_>) -> bool {
    rule.conditions.iter().any(|condition| condition_matches(condition, context))
}

fn condition_matches(condition: &RuleCondition, context: &EvaluationContext<'_>) -> bool {
    let Some(actual) = context.resolve(&condition.field) else {
        return false;
    };

    match condition.operator {
        ConditionOperator::Equals => string_compare(&actual, &condition.value, condition.case_sensitive, |a, b| a == b)
            .or_else(|| numeric_compare(&actual, &condition.value, |a, b| a == b))
            .unwrap_or(false),
        ConditionOperator::Contains => {
            string_compare(&actual, &condition.value, condition.case_sensitive, |a, b| {
                a.contains(b)
            })
            .unwrap_or(false)
        }
        ConditionOperator::StartsWith => {
            string_compare(&actual, &condition.value, condition.case_sensitive, |a, b| {
                a.starts_with(b)
            })
            .unwrap_or(false)
        }
        ConditionOperator::EndsWith => {
            string_compare(&actual, &condition.value, condition.case_sensitive, |a, b| {
                a.ends_with(b)
            })
            .unwrap_or(false)
        }
        ConditionOperator::Regex => regex_matches(&actual, &condition.value, condition.case_sensitive),
        ConditionOperator::GreaterThan => {
            numeric_compare(&actual, &condition.value, |a, b| a > b).unwrap_or(false)
        }
        ConditionOperator::LessThan => {
            numeric_compare(&actual, &condition.value, |a, b| a < b).unwrap_or(false)
        }
        ConditionOperator::In => {
            membership(&actual, &condition.value, condition.case_sensitive).unwrap_or(false)
        }
        ConditionOperator::NotIn => membership(&actual, &condition.value, condition.case_sensitive)
            .map(|contained| !contained)
            .unwrap_or(false),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_compare(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
    compare: impl Fn(&str, &str) -> bool,
) -> Option<bool> {
    let mut actual = value_as_string(actual)?;
    let mut expected = value_as_string(expected)?;
    if !case_sensitive {
        actual = actual.to_lowercase();
        expected = expected.to_lowercase();
    }
    Some(compare(&actual, &expected))
}

/// Numeric operators coerce both sides through a numeric parse.
fn numeric_compare(
    actual: &Value,
    expected: &Value,
    compare: impl Fn(f64, f64) -> bool,
) -> Option<bool> {
    let actual = value_as_f64(actual)?;
    let expected = value_as_f64(expected)?;
    Some(compare(actual, expected))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn regex_matches(actual: &Value, pattern: &Value, case_sensitive: bool) -> bool {
    let (Some(actual), Some(pattern)) = (value_as_string(actual), value_as_string(pattern)) else {
        return false;
    };
    let pattern = if case_sensitive { pattern } else { format!("(?i){pattern}") };
    Regex::new(&pattern).map(|regex| regex.is_match(&actual)).unwrap_or(false)
}

fn membership(actual: &Value, expected: &Value, case_sensitive: bool) -> Option<bool> {
    let candidates = expected.as_array()?;
    let actual = value_as_string(actual)?;
    let actual = if case_sensitive { actual } else { actual.to_lowercase() };

    Some(candidates.iter().filter_map(value_as_string).any(|candidate| {
        let candidate = if case_sensitive { candidate } else { candidate.to_lowercase() };
        candidate == actual
    }))
}
