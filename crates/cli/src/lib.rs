pub mod commands;
pub mod demo;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tably",
    about = "Tably operator CLI",
    long_about = "Inspect configuration, run pipeline readiness checks, and answer \
                  customer questions against the bundled demo business.",
    after_help = "Examples:\n  tably config\n  tably smoke\n  tably ask \"What are your hours?\"\n  tably ask --stream \"Do you serve pizza?\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run end-to-end pipeline readiness checks with per-check timing details")]
    Smoke,
    #[command(about = "Answer one customer question against the bundled demo business")]
    Ask {
        #[arg(help = "Customer question text")]
        question: String,
        #[arg(long, help = "Stream the answer chunk by chunk")]
        stream: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Smoke => commands::smoke::run(),
        Command::Ask { question, stream } => commands::ask::run(&question, stream),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("TABLY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
