//! CogWorks CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load `.cogworks/pipeline.toml` and
//!    `.cogworks/services.toml` and validate them.
//! 2. **Wire observability**: configure `tracing-subscriber` with a JSON layer
//!    and, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OpenTelemetry OTLP
//!    exporter. All `tracing` spans and structured events emitted by every
//!    crate in the workspace flow through these layers.
//! 3. **Construct infrastructure**: create `GithubArtifactStore`,
//!    `AnthropicProvider` and `ExtensionApiClient` and inject them into
//!    `PipelineExecutor`.
//! 4. **Run one invocation**: `cogworks process <ref>` calls `advance` once
//!    and exits with a code describing the result.
//!
//! Credentials come from `GITHUB_TOKEN` and `ANTHROPIC_API_KEY` only; no
//! flag accepts them.

mod process;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use pipeline::step::EXIT_FATAL;

#[derive(Debug, Parser)]
#[command(name = "cogworks", version, about = "Advance CogWorks pipeline runs")]
struct Cli {
    /// Pipeline configuration.
    #[arg(long, global = true, default_value = ".cogworks/pipeline.toml", env = "COGWORKS_CONFIG")]
    config: PathBuf,

    /// Domain service registry.
    #[arg(long, global = true, default_value = ".cogworks/services.toml", env = "COGWORKS_SERVICES")]
    services: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one invocation of the step function for a work item.
    Process(process::ProcessArgs),
    /// Check the configuration files and exit.
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let telemetry = match telemetry::Telemetry::init() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cogworks: {e:#}");
            return exit(EXIT_FATAL);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = format!("{e:#}"), "cogworks failed");
            eprintln!("cogworks: {e:#}");
            EXIT_FATAL
        }
    };
    telemetry.shutdown();
    exit(code)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Process(args) => process::run(&cli.config, &cli.services, args).await,
        Command::Validate => {
            let summary = process::validate(&cli.config, &cli.services)?;
            println!("{summary}");
            Ok(0)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(exit_byte(code))
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_takes_a_reference() {
        let cli = Cli::try_parse_from(["cogworks", "process", "octo/widgets#42"]).unwrap();
        let Command::Process(args) = cli.command else {
            panic!("expected process");
        };
        assert_eq!(args.work_item, "octo/widgets#42");
        assert_eq!(cli.config, PathBuf::from(".cogworks/pipeline.toml"));
    }

    #[test]
    fn there_is_no_flag_for_credentials() {
        assert!(Cli::try_parse_from(["cogworks", "process", "o/r#1", "--github-token", "x"]).is_err());
        assert!(Cli::try_parse_from(["cogworks", "process", "o/r#1", "--api-key", "x"]).is_err());
    }

    #[test]
    fn exit_codes_fit_in_a_byte() {
        assert_eq!(exit_byte(EXIT_FATAL), 70);
        assert_eq!(exit_byte(12), 12);
        assert_eq!(exit_byte(-1), 1);
    }
}
