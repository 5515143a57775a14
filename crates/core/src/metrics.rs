//! Per-query step ledger. Append-only while the query is in flight,
//! flushed to analytics afterwards, then discarded.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Validating,
    RateLimiting,
    SessionResolving,
    IntentClassifying,
    ContextRetrieving,
    RulesEvaluating,
    Generating,
    Logging,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::RateLimiting => "rate_limiting",
            Self::SessionResolving => "session_resolving",
            Self::IntentClassifying => "intent_classifying",
            Self::ContextRetrieving => "context_retrieving",
            Self::RulesEvaluating => "rules_evaluating",
            Self::Generating => "generating",
            Self::Logging => "logging",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: PipelineStep,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn elapsed_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessingMetrics {
    steps: Vec<StepOutcome>,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        step: PipelineStep,
        started_at: DateTime<Utc>,
        success: bool,
        error: Option<String>,
    ) {
        self.steps.push(StepOutcome {
            step,
            started_at,
            finished_at: Utc::now(),
            success,
            error,
        });
    }

    pub fn steps(&self) -> &[StepOutcome] {
        &self.steps
    }

    pub fn step(&self, step: PipelineStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|outcome| outcome.step == step)
    }

    pub fn total_elapsed_ms(&self) -> u64 {
        match (self.steps.first(), self.steps.last()) {
            (Some(first), Some(last)) => {
                (last.finished_at - first.started_at).num_milliseconds().max(0) as u64
            }
            _ => 0,
        }
    }

    pub fn failed_steps(&self) -> Vec<PipelineStep> {
        self.steps.iter().filter(|outcome| !outcome.success).map(|outcome| outcome.step).collect()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|outcome| outcome.success).count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{PipelineStep, ProcessingMetrics};

    #[test]
    fn records_append_in_order() {
        let mut metrics = ProcessingMetrics::new();
        metrics.record(PipelineStep::Validating, Utc::now(), true, None);
        metrics.record(
            PipelineStep::IntentClassifying,
            Utc::now(),
            false,
            Some("model unavailable".to_string()),
        );

        assert_eq!(metrics.steps().len(), 2);
        assert_eq!(metrics.failed_steps(), vec![PipelineStep::IntentClassifying]);
        assert_eq!(metrics.completed_steps(), 1);
        assert!(metrics.step(PipelineStep::Validating).expect("step").success);
    }
}
