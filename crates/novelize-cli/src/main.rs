//! Novelize CLI - Command-line interface
//!
//! Usage:
//!   novelize run <input> [--output PATH] [--mode MODE] [--threshold N]
//!   novelize extract <input> [--mode MODE]
//!   novelize config
//!
//! The input file is split into paragraphs on blank lines; each paragraph is
//! one chunk of the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use novelize_core::{AppConfig, ExtractionMode, LoggingConfig};
use novelize_engine::{export_csv, SessionAggregator, SessionOutput};
use novelize_extractor::{CandidateExtractor, ExtractionAdapter};
use novelize_llm::build_gateway;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "novelize")]
#[command(about = "Track characters and what they do across a novel")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full session and export the character table
    Run {
        /// Text file to process
        input: PathBuf,
        /// CSV destination (defaults to export.path)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Extraction mode: exhaustive or incremental
        #[arg(short, long)]
        mode: Option<ExtractionMode>,
        /// Note length (characters) that triggers summarization
        #[arg(short, long)]
        threshold: Option<usize>,
    },
    /// Extract candidate pairs only, without resolving or consolidating
    Extract {
        /// Text file to process
        input: PathBuf,
        /// Extraction mode: exhaustive or incremental
        #[arg(short, long)]
        mode: Option<ExtractionMode>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run {
            input,
            output,
            mode,
            threshold,
        } => {
            if let Some(mode) = mode {
                config.extraction.mode = mode;
            }
            if let Some(threshold) = threshold {
                config.consolidation.threshold_chars = threshold;
            }
            let output = output.unwrap_or_else(|| config.export.path.clone());
            run(&config, &input, &output).await?;
        }
        Commands::Extract { input, mode } => {
            if let Some(mode) = mode {
                config.extraction.mode = mode;
            }
            extract(&config, &input).await?;
        }
        Commands::Config => {
            print!("{}", redacted(&config).to_toml_string()?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: &AppConfig, input: &Path, output: &Path) -> anyhow::Result<()> {
    config.validate()?;
    let chunks = read_chunks(input)?;
    let gateway = Arc::new(build_gateway(config)?);

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current update");
            interrupt.cancel();
        }
    });

    let session = SessionAggregator::new(gateway.clone(), config)?.with_cancellation(token);
    info!(
        session = %session.id(),
        chunks = chunks.len(),
        mode = %config.extraction.mode,
        "Starting session"
    );

    let started = Instant::now();
    let result = session.run(&chunks).await;
    let elapsed = started.elapsed();

    let (session_output, failure) = match result {
        Ok(session_output) => (session_output, None),
        Err(aborted) => (aborted.output, Some(aborted.error)),
    };

    // partial tables are exported too
    let rows = export_csv(&session_output.table, output)
        .with_context(|| format!("Failed to export to {}", output.display()))?;

    print_summary(&session_output, rows, output);
    println!(
        "Gateway retries: {} ({} calls exhausted), elapsed {:.2}s",
        gateway.retries(),
        gateway.exhausted_calls(),
        elapsed.as_secs_f64()
    );

    match failure {
        Some(error) => Err(error).context("Session stopped before the last chunk"),
        None => Ok(()),
    }
}

async fn extract(config: &AppConfig, input: &Path) -> anyhow::Result<()> {
    config.validate()?;
    let chunks = read_chunks(input)?;
    let gateway = Arc::new(build_gateway(config)?);
    let adapter = ExtractionAdapter::new(gateway, config.extraction.clone())?;

    for (index, chunk) in chunks.iter().enumerate() {
        let started = Instant::now();
        let outcome = adapter.extract(chunk).await?;

        println!(
            "[chunk {index}] {} candidate(s), {} call(s), stop: {}, {:.2}s",
            outcome.candidates.len(),
            outcome.calls,
            outcome.stop,
            started.elapsed().as_secs_f64()
        );
        for pair in &outcome.candidates {
            println!("  {}: {}", pair.name, pair.action);
        }
    }

    Ok(())
}

fn read_chunks(input: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let chunks = split_paragraphs(&text);
    if chunks.is_empty() {
        warn!(path = %input.display(), "Input has no paragraphs");
    }
    Ok(chunks)
}

fn print_summary(output: &SessionOutput, rows: usize, path: &Path) {
    let report = &output.report;

    println!("Characters ({rows}) written to {}", path.display());
    for entity in &output.table {
        println!("  {}: {}", entity.identifier(), entity.text());
    }
    println!(
        "Chunks: {} processed, {} without characters, {} failed",
        report.chunks_processed, report.chunks_skipped, report.chunks_failed
    );
    println!(
        "Updates: {} created, {} appended, {} summarized, {} ambiguous",
        report.entities_created,
        report.appends,
        report.summarizations,
        report.ambiguous_resolutions()
    );
    for failure in &report.candidate_failures {
        println!(
            "  skipped '{}' in chunk {}: {}",
            failure.name, failure.chunk_index, failure.message
        );
    }
    for failure in &report.chunk_failures {
        println!("  chunk {} failed: {}", failure.chunk_index, failure.message);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Split text into paragraphs on blank lines, reflowing lines inside each
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}

/// Copy of the config safe to print
fn redacted(config: &AppConfig) -> AppConfig {
    let mut config = config.clone();
    for key in [&mut config.llm.openai_api_key, &mut config.llm.anthropic_api_key] {
        if key.is_some() {
            *key = Some("********".to_string());
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_paragraphs_on_blank_lines() {
        let text = "Alice went to the market.\n  Bob helped her.\n\n\n   \nCharlie came over.\n";
        assert_eq!(
            split_paragraphs(text),
            vec![
                "Alice went to the market. Bob helped her.".to_string(),
                "Charlie came over.".to_string()
            ]
        );
    }

    #[test]
    fn test_split_paragraphs_empty_input() {
        assert!(split_paragraphs("").is_empty());
        assert!(split_paragraphs("\n \n\t\n").is_empty());
    }

    #[test]
    fn test_redacted_hides_keys() {
        let mut config = AppConfig::default();
        config.llm.anthropic_api_key = Some("sk-ant-secret".to_string());

        let shown = redacted(&config).to_toml_string().unwrap();
        assert!(!shown.contains("sk-ant-secret"));
        assert!(shown.contains("********"));
        assert_eq!(redacted(&config).llm.openai_api_key, None);
    }

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "novelize",
            "run",
            "novel.txt",
            "--mode",
            "incremental",
            "--threshold",
            "300",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                input,
                mode,
                threshold,
                output,
            } => {
                assert_eq!(input, PathBuf::from("novel.txt"));
                assert_eq!(mode, Some(ExtractionMode::Incremental));
                assert_eq!(threshold, Some(300));
                assert_eq!(output, None);
            }
            _ => panic!("expected run"),
        }
    }
}
