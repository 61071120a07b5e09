pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use agentrun_core::config::{AppConfig, LoadOptions, LogFormat};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "agentrun",
    about = "Agent run operator CLI",
    long_about = "Inspect engine configuration and execute batches of agent runs against the configured model provider.",
    after_help = "Examples:\n  agentrun config\n  agentrun run --prompt \"Summarize the release notes\" --count 3"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a TOML config file (defaults to agentrun.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run a one-block agent workflow one or more times and report the batch")]
    Run(RunCommand),
}

#[derive(Debug, Args)]
struct RunCommand {
    #[arg(long, help = "User prompt sent to the model")]
    prompt: String,
    #[arg(long, help = "Optional system prompt")]
    system: Option<String>,
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=1000),
        help = "Number of sequential runs; Ctrl-C stops before the next run"
    )]
    count: u32,
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        ..LoadOptions::default()
    };

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
        Command::Run(command) => {
            let args = commands::run::RunArgs {
                prompt: command.prompt,
                system: command.system,
                count: command.count,
            };
            commands::run::run(options, args).await
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber once; later calls are no-ops. `RUST_LOG`
/// takes precedence over `logging.level`.
pub fn init_logging(config: &AppConfig) {
    let filter = log_filter(&config.logging.level, std::env::var("RUST_LOG").ok().as_deref());
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn log_filter(configured: &str, from_env: Option<&str>) -> EnvFilter {
    from_env
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(configured).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::log_filter;

    #[test]
    fn configured_level_applies_without_rust_log() {
        assert_eq!(log_filter("debug", None).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn rust_log_wins_over_configured_level() {
        assert_eq!(log_filter("debug", Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn blank_rust_log_falls_back_to_configured_level() {
        assert_eq!(log_filter("error", Some("  ")).max_level_hint(), Some(LevelFilter::ERROR));
    }
}
