use std::io::Write;
use std::sync::Arc;

use crate::commands::CommandResult;
use crate::demo;
use tably_core::config::{AppConfig, LoadOptions};
use tably_core::domain::query::{QueryRequest, StreamEvent};

pub fn run(question: &str, stream: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return CommandResult::failure("ask", "config", error.to_string(), 2),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::failure("ask", "runtime", error.to_string(), 3),
    };

    let pipeline = match runtime.block_on(demo::build(&config)) {
        Ok(pipeline) => pipeline,
        Err(error) => return CommandResult::failure("ask", "demo_build", error.to_string(), 4),
    };

    if stream {
        run_streaming(&runtime, pipeline, question)
    } else {
        run_single(&runtime, pipeline, question)
    }
}

fn run_single(
    runtime: &tokio::runtime::Runtime,
    pipeline: demo::DemoPipeline,
    question: &str,
) -> CommandResult {
    let result = runtime.block_on(
        pipeline.orchestrator.process_query(&pipeline.business_id, QueryRequest::new(question)),
    );

    match result {
        Ok(response) => {
            let output = serde_json::to_string_pretty(&response)
                .unwrap_or_else(|error| format!("serialization failed: {error}"));
            CommandResult { exit_code: 0, output }
        }
        Err(error) => CommandResult::failure("ask", "query", error.user_message(), 5),
    }
}

fn run_streaming(
    runtime: &tokio::runtime::Runtime,
    pipeline: demo::DemoPipeline,
    question: &str,
) -> CommandResult {
    runtime.block_on(async move {
        let mut events = Arc::clone(&pipeline.orchestrator)
            .process_streaming_query(pipeline.business_id.clone(), QueryRequest::new(question));

        let mut final_result =
            CommandResult::failure("ask", "stream", "stream ended without a terminal event", 5);

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Chunk(text) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::Done(response) => {
                    println!();
                    let output = serde_json::to_string_pretty(&response)
                        .unwrap_or_else(|error| format!("serialization failed: {error}"));
                    final_result = CommandResult { exit_code: 0, output };
                }
                StreamEvent::Error { message, retry_after_secs } => {
                    println!();
                    let hint = retry_after_secs
                        .map(|secs| format!(" (retry after {secs}s)"))
                        .unwrap_or_default();
                    final_result =
                        CommandResult::failure("ask", "stream", format!("{message}{hint}"), 5);
                }
            }
        }

        final_result
    })
}
