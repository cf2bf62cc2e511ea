//! Cadre - run tool-calling agents from the command line
//!
//! - `cadre run` - run an agent file against a scripted model
//! - `cadre extract` - show the tool calls detected in a text file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use cadre_core::agent::ToolCallExtractor;

mod config;
mod runner;
mod tools;

use config::{AgentFile, ResponseScript};

/// Cadre - agent runtime
#[derive(Parser)]
#[command(name = "cadre")]
#[command(about = "Run tool-calling agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent against a scripted model
    ///
    /// Events are written to stderr as JSON lines; the agent's output goes
    /// to stdout.
    Run {
        /// Agent file (TOML, or JSON with a .json extension)
        #[arg(short, long)]
        agent: PathBuf,

        /// JSON list of model replies to replay
        #[arg(short, long)]
        responses: PathBuf,

        /// Prompt passed to the agent
        #[arg(short, long)]
        input: String,

        /// Debug-level logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the tool calls detected in a text file as JSON
    Extract {
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            agent,
            responses,
            input,
            verbose,
        } => {
            init_logging(verbose);
            let file = AgentFile::load(&agent)?;
            let provider = Arc::new(ResponseScript::load(&responses)?.into_provider());

            let output = runner::run_agent(&file, provider, &input).await?;
            match output {
                Value::String(text) => println!("{}", text),
                other => println!("{}", serde_json::to_string_pretty(&other)?),
            }
        }
        Commands::Extract { file } => {
            init_logging(false);
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let calls = ToolCallExtractor::default().extract(&text);
            println!("{}", serde_json::to_string_pretty(&calls)?);
        }
    }

    Ok(())
}
