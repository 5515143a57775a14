use std::time::Instant;

use serde::Serialize;

use crate::commands::CommandResult;
use crate::demo;
use tably_core::config::{AppConfig, LoadOptions};
use tably_core::domain::query::QueryRequest;
use tably_core::intent::{classify_rules, Intent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("intent_classifier"));
            checks.push(skipped("demo_pipeline_build"));
            checks.push(skipped("pipeline_query"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let intent_started = Instant::now();
    let intent_result = classify_rules("What are your hours?");
    let intent_ok =
        intent_result.intent == Intent::HoursPolicy && intent_result.confidence >= 0.5;
    checks.push(SmokeCheck {
        name: "intent_classifier",
        status: if intent_ok { SmokeStatus::Pass } else { SmokeStatus::Fail },
        elapsed_ms: intent_started.elapsed().as_millis() as u64,
        message: format!(
            "hours question classified as {} at {:.2}",
            intent_result.intent.as_str(),
            intent_result.confidence
        ),
    });

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "demo_pipeline_build",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("pipeline_query"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let build_started = Instant::now();
    let pipeline = match runtime.block_on(demo::build(&config)) {
        Ok(pipeline) => {
            checks.push(SmokeCheck {
                name: "demo_pipeline_build",
                status: SmokeStatus::Pass,
                elapsed_ms: build_started.elapsed().as_millis() as u64,
                message: "demo content vectorized, embedded, and indexed".to_string(),
            });
            pipeline
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name: "demo_pipeline_build",
                status: SmokeStatus::Fail,
                elapsed_ms: build_started.elapsed().as_millis() as u64,
                message: error.to_string(),
            });
            checks.push(skipped("pipeline_query"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let query_started = Instant::now();
    let query_result = runtime.block_on(pipeline.orchestrator.process_query(
        &pipeline.business_id,
        QueryRequest::new("Do you serve margherita pizza?"),
    ));
    match query_result {
        Ok(response) if !response.degraded => checks.push(SmokeCheck {
            name: "pipeline_query",
            status: SmokeStatus::Pass,
            elapsed_ms: query_started.elapsed().as_millis() as u64,
            message: format!(
                "answered with {} menu matches in {}ms",
                response.context_sources.menu, response.elapsed_ms
            ),
        }),
        Ok(response) => checks.push(SmokeCheck {
            name: "pipeline_query",
            status: SmokeStatus::Fail,
            elapsed_ms: query_started.elapsed().as_millis() as u64,
            message: format!("pipeline answered degraded (query {})", response.query_id),
        }),
        Err(error) => checks.push(SmokeCheck {
            name: "pipeline_query",
            status: SmokeStatus::Fail,
            elapsed_ms: query_started.elapsed().as_millis() as u64,
            message: error.to_string(),
        }),
    }

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due to previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
