//! Rule storage and write validation.
//!
//! Writes are validated, checked for conflicts against the existing active
//! set, versioned optimistically, and always invalidate the per-business
//! cache. High-severity conflicts block the write; the rest come back as
//! warnings attached to the outcome.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::content::BusinessId;
use crate::domain::rule::{BusinessRule, RuleCategory, RuleId};
use crate::rules::cache::RuleCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleConflictFinding {
    pub existing_rule: RuleId,
    pub severity: ConflictSeverity,
    pub reason: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleWriteError {
    #[error("rule validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("rule conflicts with {} existing active rule(s)", .0.len())]
    Conflict(Vec<RuleConflictFinding>),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("stale rule version: expected {expected}, got {actual}")]
    StaleVersion { expected: u64, actual: u64 },
}

/// What a caller submits; ids, versions, and timestamps are assigned here.
#[derive(Clone, Debug)]
pub struct RuleDraft {
    pub business_id: BusinessId,
    pub category: RuleCategory,
    pub priority: u8,
    pub conditions: Vec<crate::domain::rule::RuleCondition>,
    pub actions: Vec<crate::domain::rule::RuleAction>,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct RuleWriteOutcome {
    pub rule: BusinessRule,
    pub warnings: Vec<RuleConflictFinding>,
}

pub struct RuleStore {
    rules: RwLock<HashMap<BusinessId, Vec<BusinessRule>>>,
    cache: Arc<RuleCache>,
}

impl RuleStore {
    pub fn new(cache: Arc<RuleCache>) -> Self {
        Self { rules: RwLock::new(HashMap::new()), cache }
    }

    /// Active rules for a business, served from the cache when fresh. The
    /// epoch captured before the read lets the cache discard this fill if
    /// a write lands between the read and the store.
    pub fn active_rules(&self, business_id: &BusinessId) -> Arc<Vec<BusinessRule>> {
        if let Some(cached) = self.cache.get(business_id) {
            return cached;
        }

        let epoch = self.cache.epoch(business_id);
        let rules = self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let active: Vec<BusinessRule> = rules
            .get(business_id)
            .map(|all| all.iter().filter(|rule| rule.active).cloned().collect())
            .unwrap_or_default();
        let version = active.iter().map(|rule| rule.version).max().unwrap_or(0);
        drop(rules);

        self.cache.store(business_id.clone(), active.clone(), version, epoch);
        Arc::new(active)
    }

    pub fn create(&self, draft: RuleDraft) -> Result<RuleWriteOutcome, RuleWriteError> {
        let failures = validate_draft(&draft);
        if !failures.is_empty() {
            return Err(RuleWriteError::Validation(failures));
        }

        let mut rules = self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let business_rules = rules.entry(draft.business_id.clone()).or_default();

        let findings = conflict_findings(&draft, business_rules.iter());
        let (blocking, warnings): (Vec<_>, Vec<_>) =
            findings.into_iter().partition(|finding| finding.severity == ConflictSeverity::High);
        if !blocking.is_empty() {
            return Err(RuleWriteError::Conflict(blocking));
        }

        let now = Utc::now();
        let rule = BusinessRule {
            id: RuleId(Uuid::new_v4().to_string()),
            business_id: draft.business_id.clone(),
            category: draft.category,
            priority: draft.priority,
            conditions: draft.conditions,
            actions: draft.actions,
            active: draft.active,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        business_rules.push(rule.clone());
        drop(rules);

        self.cache.invalidate(&draft.business_id);
        Ok(RuleWriteOutcome { rule, warnings })
    }

    /// Optimistic update: the caller supplies the version it read; a
    /// mismatch means someone else won the race.
    pub fn update(
        &self,
        rule_id: &RuleId,
        expected_version: u64,
        draft: RuleDraft,
    ) -> Result<RuleWriteOutcome, RuleWriteError> {
        let failures = validate_draft(&draft);
        if !failures.is_empty() {
            return Err(RuleWriteError::Validation(failures));
        }

        let mut rules = self.rules.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let business_rules = rules
            .get_mut(&draft.business_id)
            .ok_or_else(|| RuleWriteError::NotFound(rule_id.0.clone()))?;

        let position = business_rules
            .iter()
            .position(|rule| rule.id == *rule_id)
            .ok_or_else(|| RuleWriteError::NotFound(rule_id.0.clone()))?;

        if business_rules[position].version != expected_version {
            return Err(RuleWriteError::StaleVersion {
                expected: business_rules[position].version,
                actual: expected_version,
            });
        }

        let others = business_rules.iter().filter(|rule| rule.id != *rule_id);
        let findings = conflict_findings(&draft, others);
        let (blocking, warnings): (Vec<_>, Vec<_>) =
            findings.into_iter().partition(|finding| finding.severity == ConflictSeverity::High);
        if !blocking.is_empty() {
            return Err(RuleWriteError::Conflict(blocking));
        }

        let existing = &mut business_rules[position];
        existing.category = draft.category;
        existing.priority = draft.priority;
        existing.conditions = draft.conditions;
        existing.actions = draft.actions;
        existing.active = draft.active;
        existing.version += 1;
        existing.updated_at = Utc::now();
        let updated = existing.clone();
        drop(rules);

        self.cache.invalidate(&draft.business_id);
        Ok(RuleWriteOutcome { rule: updated, warnings })
    }
}

fn validate_draft(draft: &RuleDraft) -> Vec<String> {
    let mut failures = Vec::new();
    if draft.business_id.0.trim().is_empty() {
        failures.push("Business id is required".to_string());
    }
    if draft.conditions.is_empty() {
        failures.push("At least one condition is required".to_string());
    }
    if draft.actions.is_empty() {
        failures.push("At least one action is required".to_string());
    }
    if !(1..=100).contains(&draft.priority) {
        failures.push("Priority must be between 1 and 100".to_string());
    }
    for condition in &draft.conditions {
        if condition.field.trim().is_empty() {
            failures.push("Condition field must not be empty".to_string());
        }
    }
    failures
}

/// Severity policy: same category plus an overlapping action conflict
/// class plus a priority gap under 10 is High (blocks the write); an
/// overlapping conflict class alone is Medium; same category alone is Low.
fn conflict_findings<'a>(
    draft: &RuleDraft,
    existing: impl Iterator<Item = &'a BusinessRule>,
) -> Vec<RuleConflictFinding> {
    let draft_classes: Vec<_> =
        draft.actions.iter().filter_map(|action| action.conflict_class()).collect();

    existing
        .filter(|rule| rule.active)
        .filter_map(|rule| {
            let same_category = rule.category == draft.category;
            let overlapping_class = rule
                .actions
                .iter()
                .filter_map(|action| action.conflict_class())
                .any(|class| draft_classes.contains(&class));

            let severity = match (same_category, overlapping_class) {
                (true, true) if rule.priority.abs_diff(draft.priority) < 10 => {
                    ConflictSeverity::High
                }
                (_, true) => ConflictSeverity::Medium,
                (true, false) => ConflictSeverity::Low,
                (false, false) => return None,
            };

            let reason = match severity {
                ConflictSeverity::High => format!(
                    "rule {} shares category, action class, and priority band",
                    rule.id.0
                ),
                ConflictSeverity::Medium => {
                    format!("rule {} emits actions in the same conflict class", rule.id.0)
                }
                ConflictSeverity::Low => format!("rule {} targets the same category", rule.id.0),
            };

            Some(RuleConflictFinding { existing_rule: rule.id.clone(), severity, reason })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::domain::content::BusinessId;
    use crate::domain::rule::{
        ActionType, ConditionOperator, RuleAction, RuleCategory, RuleCondition,
    };
    use crate::rules::cache::RuleCache;

    use super::{ConflictSeverity, RuleDraft, RuleStore, RuleWriteError};

    fn business() -> BusinessId {
        BusinessId("biz-1".to_string())
    }

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(RuleCache::with_default_ttl()))
    }

    fn tone_draft(priority: u8, tone: &str) -> RuleDraft {
        RuleDraft {
            business_id: business(),
            category: RuleCategory::ResponseStyle,
            priority,
            conditions: vec![RuleCondition {
                field: "intent.label".to_string(),
                operator: ConditionOperator::Equals,
                value: json!("hours_policy"),
                case_sensitive: false,
            }],
            actions: vec![RuleAction {
                action_type: ActionType::SetTone,
                parameters: [("tone".to_string(), json!(tone))]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
                priority: 50,
            }],
            active: true,
        }
    }

    #[test]
    fn zero_condition_rule_is_rejected_with_named_failure() {
        let store = store();
        let mut draft = tone_draft(50, "warm");
        draft.conditions.clear();

        let result = store.create(draft);
        match result {
            Err(RuleWriteError::Validation(failures)) => {
                assert!(failures.contains(&"At least one condition is required".to_string()));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let store = store();
        let draft = tone_draft(0, "warm");
        assert!(matches!(store.create(draft), Err(RuleWriteError::Validation(_))));
    }

    #[test]
    fn close_priority_same_class_conflict_blocks_the_write() {
        let store = store();
        store.create(tone_draft(50, "formal")).expect("first rule");

        let result = store.create(tone_draft(55, "casual"));
        match result {
            Err(RuleWriteError::Conflict(findings)) => {
                assert!(findings.iter().all(|f| f.severity == ConflictSeverity::High));
            }
            other => panic!("expected blocking conflict, got {other:?}"),
        }
    }

    #[test]
    fn distant_priority_conflict_is_a_warning_only() {
        let store = store();
        store.create(tone_draft(90, "formal")).expect("first rule");

        let outcome = store.create(tone_draft(20, "casual")).expect("warned write");
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].severity, ConflictSeverity::Medium);
    }

    #[test]
    fn update_bumps_version_and_invalidates_cache() {
        let store = store();
        let created = store.create(tone_draft(90, "formal")).expect("create");
        assert_eq!(created.rule.version, 1);

        // Prime the cache, then write through it.
        let cached_before = store.active_rules(&business());
        assert_eq!(cached_before.len(), 1);

        let updated = store
            .update(&created.rule.id, 1, tone_draft(90, "direct"))
            .expect("update");
        assert_eq!(updated.rule.version, 2);

        let cached_after = store.active_rules(&business());
        assert_eq!(cached_after[0].version, 2);
    }

    #[test]
    fn stale_version_update_is_rejected() {
        let store = store();
        let created = store.create(tone_draft(90, "formal")).expect("create");
        store.update(&created.rule.id, 1, tone_draft(90, "direct")).expect("first update");

        let result = store.update(&created.rule.id, 1, tone_draft(90, "casual"));
        assert_eq!(result.err(), Some(RuleWriteError::StaleVersion { expected: 2, actual: 1 }));
    }

    #[test]
    fn active_rules_excludes_disabled_rules() {
        let store = store();
        let mut draft = tone_draft(90, "formal");
        draft.active = false;
        store.create(draft).expect("create inactive");

        assert!(store.active_rules(&business()).is_empty());
    }
}
