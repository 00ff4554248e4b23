// Relaykit CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so structured output on stdout stays parseable.

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "relaykit")]
#[command(about = "Relaykit CLI - Drive and inspect the task dispatch engine")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (YAML or JSON); RELAYKIT_* variables when omitted
    #[arg(long, short, env = "RELAYKIT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run synthetic load through the engine and report outcomes
    Simulate(commands::simulate::SimulateArgs),

    /// Inspect the effective engine configuration
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommand,
    },
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "relaykit=info,relaykit_dispatch=warn" };
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    if let Ok(path) = dotenv {
        tracing::debug!("Loaded .env from {:?}", path);
    }

    let output_format = output::OutputFormat::from_str(&cli.output);
    let config = commands::config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate(args) => {
            commands::simulate::run(args, config, output_format, cli.quiet).await
        }
        Commands::Config { command } => commands::config::run(command, &config, output_format),
    }
}
