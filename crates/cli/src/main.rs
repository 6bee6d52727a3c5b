//! Sage CLI - ask a question, get a cited answer
//!
//! Wires configuration, logging and one shared health monitor into a
//! [`PipelineOrchestrator`], then answers a single question or starts an
//! interactive session.

mod output;
mod repl;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sage::{
    HealthMonitor, PipelineError, PipelineOrchestrator, PipelineRequest, SageConfig, Tier,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::output::{OutputHandler, TerminalProgress};

/// Sage - resilient research assistant
#[derive(Parser)]
#[command(name = "sage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Answer questions from web search and a completion service, degrading gracefully")]
#[command(long_about = r#"
Sage plans a search, queries providers in fallback order, writes an answer with
citations and suggests follow-up questions. When a provider or the completion
service is down, the answer is still produced from whatever remains.

Examples:
  sage "What is AI?"              # Answer one question
  sage --tier pro "rust async"    # Add parallel perspectives
  sage                            # Interactive session
  sage config                     # Print the effective configuration
"#)]
struct Cli {
    /// Question to answer; omit to start an interactive session
    query: Option<String>,

    /// Research tier (standard or pro)
    #[arg(short, long, env = "SAGE_TIER", default_value = "standard")]
    tier: Tier,

    /// TOML configuration file
    #[arg(short, long, env = "SAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Disable markdown styling
    #[arg(long)]
    plain: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from `.env` so local runs pick up API keys
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose { "debug" } else { "warn" }.to_string()
    });
    let env_filter = EnvFilter::try_new(format!("warn,sage={level},sage_cli={level}", level = log_level))
        .context("Failed to create tracing filter")?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();

    let config = SageConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    tracing::debug!(
        "Configuration loaded: providers={:?}, completion model={}",
        config.search.providers,
        config.completion.model
    );

    if let Some(Commands::Config) = cli.command {
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    // One monitor per process, shared by every component that calls out
    let health = Arc::new(HealthMonitor::from_config(&config.health));
    let output = OutputHandler::new(!cli.plain);
    let orchestrator = Arc::new(
        PipelineOrchestrator::from_config(&config, health)
            .with_progress(Arc::new(TerminalProgress::new(cli.verbose))),
    );

    match cli.query {
        Some(query) => ask(&orchestrator, &output, &query, cli.tier, cli.json).await,
        None => {
            let mut repl = repl::SageRepl::new(orchestrator, output, cli.tier, cli.json)?;
            repl.run().await
        }
    }
}

/// Run one question; Ctrl-C cancels the run instead of killing the process
pub(crate) async fn ask(
    orchestrator: &PipelineOrchestrator,
    output: &OutputHandler,
    query: &str,
    tier: Tier,
    json: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let request = PipelineRequest::new(query).with_tier(tier);

    let result = tokio::select! {
        result = orchestrator.run_with(request, &cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(PipelineError::Cancelled)
        }
    };

    match result {
        Ok(result) if json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Ok(result) => {
            output.print_result(&result);
            Ok(())
        }
        Err(PipelineError::Cancelled) => {
            output.print_warning("Cancelled.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
