pub mod config;
pub mod domain;
pub mod errors;
pub mod index;
pub mod intent;
pub mod metrics;
pub mod rules;
pub mod vectorizer;

pub use domain::content::{BusinessId, ContentId, ContentItem, ContentType};
pub use domain::context::{
    BusinessFacts, ContextBundle, ConversationTurn, FaqMatch, MenuMatch, PolicyMatch, Session,
    SessionId, TurnRole,
};
pub use domain::query::{
    ContextSourceCounts, QueryRequest, QueryResponse, StreamEvent, TokenUsage,
};
pub use domain::rule::{
    ActionType, BusinessRule, ConditionOperator, ConflictClass, RuleAction, RuleCategory,
    RuleCondition, RuleId,
};
pub use errors::{ProviderError, QueryError};
pub use index::{EmbeddingIndex, IndexError, SearchMatch, SearchOptions};
pub use intent::{HybridClassifier, Intent, IntentModel, IntentResult, IntentScore};
pub use metrics::{PipelineStep, ProcessingMetrics, StepOutcome};
pub use rules::{
    AppliedAction, EvaluationContext, RuleCache, RuleDraft, RuleEngine, RuleEvaluation, RuleStore,
    RuleWriteError, RuleWriteOutcome,
};
pub use vectorizer::{ContentVectorizer, VectorizeError, VectorizedContent};
