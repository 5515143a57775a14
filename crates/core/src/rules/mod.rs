//! Business rules: storage with write validation, a versioned TTL cache,
//! and the evaluation engine that turns matching rules into an ordered,
//! conflict-free action list.

pub mod cache;
pub mod engine;
pub mod store;

pub use cache::{Clock, RuleCache, SystemClock, DEFAULT_RULE_TTL_SECS};
pub use engine::{AppliedAction, EvaluationContext, RuleEngine, RuleEvaluation};
pub use store::{
    ConflictSeverity, RuleConflictFinding, RuleDraft, RuleStore, RuleWriteError, RuleWriteOutcome,
};
