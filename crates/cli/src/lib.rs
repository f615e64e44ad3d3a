pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use roundkeeper_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "roundkeeper",
    about = "Roundkeeper operator CLI",
    long_about = "Inspect, export, and repair the decision trace store of a Roundkeeper deployment.",
    after_help = "Examples:\n  roundkeeper migrate\n  roundkeeper rounds --conversation abc\n  roundkeeper export --conversation abc --out trace.jsonl"
)]
pub struct Cli {
    #[arg(long = "config", global = true, help = "Path to a roundkeeper.toml config file")]
    config_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "List the rounds of one conversation in round_seq order")]
    Rounds {
        #[arg(long, help = "Conversation id (normalized the same way the runtime does)")]
        conversation: String,
        #[arg(long, help = "Maximum number of rounds to return")]
        limit: Option<u32>,
    },
    #[command(about = "Show one round header with every event it logged")]
    Show {
        #[arg(help = "Round id")]
        round_id: String,
    },
    #[command(about = "Export closed rounds as JSON lines, resumable from a watermark")]
    Export(commands::export::ExportArgs),
    #[command(about = "Close rounds left open by a process that stopped mid-round")]
    Recover,
    #[command(name = "library-id", about = "Print the deployment's library identifier")]
    LibraryId,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions { config_path: cli.config_path, ..LoadOptions::default() };

    if let Ok(config) = AppConfig::load(options.clone()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Rounds { conversation, limit } => {
            commands::rounds::run(&options, &conversation, limit)
        }
        Command::Show { round_id } => commands::show::run(&options, &round_id),
        Command::Export(args) => commands::export::run(&options, &args),
        Command::Recover => commands::recover::run(&options),
        Command::LibraryId => commands::library_id::run(&options),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Diagnostics go to stderr; stdout carries only the command outcome.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_env("ROUNDKEEPER_LOG_FILTER")
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    // A subscriber installed by an embedding process wins.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
