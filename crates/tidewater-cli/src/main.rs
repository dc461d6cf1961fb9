//! Tidewater CLI (tidewater)
//!
//! Runs a pipeline of continuous queries declared in a TOML file.
//!
//! ## Quick Start
//!
//! ```bash
//! # Check that every stream registers and every query compiles
//! tidewater --config pipeline.toml validate
//!
//! # Feed NDJSON into source streams and print the query targets
//! tidewater --config pipeline.toml run --input STATION_A=station_a.ndjson
//!
//! # Inspect streams, including the targets the queries create
//! tidewater --config pipeline.toml streams
//! tidewater --config pipeline.toml describe HIGH_READINGS
//! ```
//!
//! ## Configuration
//!
//! - `TIDEWATER_CONFIG`: pipeline file (default: tidewater.toml)
//! - `TIDEWATER_WAIT_MS`: how long `run` waits for queries to drain
//! - `RUST_LOG`: log filter, overriding the pipeline's `log_level`
//!
//! Set `colored = false` in the pipeline file to turn off colored output.
//!
//! Target records are printed to stdout as JSON lines; logs and the query
//! summary go to stderr.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod format;
mod input;
mod pipeline;

use config::Config;
use input::Input;

#[derive(Parser)]
#[command(name = "tidewater")]
#[command(about = "Tidewater continuous query engine", long_about = None)]
struct Cli {
    /// Pipeline file declaring streams and queries
    #[arg(short, long, env = "TIDEWATER_CONFIG", default_value = "tidewater.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed input files through the pipeline and print every target record
    Run {
        /// Input for a source stream, as STREAM=PATH (NDJSON)
        #[arg(short, long = "input")]
        inputs: Vec<Input>,

        /// Maximum time to wait for the queries to drain
        #[arg(long, env = "TIDEWATER_WAIT_MS", default_value = "5000")]
        wait_ms: u64,

        /// Print the Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Register the streams and compile the queries without running them
    Validate,
    /// List the streams, including query targets
    Streams,
    /// Describe a stream
    Describe {
        /// Stream name
        name: String,
    },
}

/// Colors only when enabled and stdout is a terminal
fn colored_stdout(config: &Config) -> bool {
    config.colored && std::io::stdout().is_terminal()
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Run {
            inputs,
            wait_ms,
            metrics,
        } => handle_run(&config, &inputs, Duration::from_millis(wait_ms), metrics).await,
        Commands::Validate => handle_validate(config).await,
        Commands::Streams => handle_streams(&config).await,
        Commands::Describe { name } => handle_describe(&config, &name).await,
    }
}

async fn handle_run(config: &Config, inputs: &[Input], wait: Duration, metrics: bool) -> Result<()> {
    let engine = pipeline::build_engine(config).await?;
    pipeline::submit_queries(&engine, config).await?;

    let mut produced = 0;
    for input in inputs {
        produced += pipeline::feed(&engine, input).await?;
    }
    let drained = pipeline::drain(&engine, wait).await?;
    info!(produced, drained, "input processed");

    for target in config.targets() {
        for (record, value) in pipeline::read_stream(&engine, target).await? {
            println!("{}", format::record_line(target, &record, &value));
        }
    }

    let queries = engine.list_queries().await;
    let mut stats = Vec::with_capacity(queries.len());
    for query in &queries {
        stats.push(engine.get_stats(&query.query_id).await?);
    }
    let colored = config.colored && std::io::stderr().is_terminal();
    eprint!("{}", format::query_summary(&queries, &stats, colored));

    if metrics {
        let text = tidewater_observability::exporter::render()
            .context("Failed to render metrics")?;
        eprint!("{}", text);
    }

    engine.shutdown().await;
    Ok(())
}

/// Validation never touches a persisted catalog
async fn handle_validate(mut config: Config) -> Result<()> {
    config.catalog_dir = None;
    let engine = pipeline::build_engine(&config).await?;
    pipeline::submit_queries(&engine, &config).await?;
    engine.shutdown().await;

    let message = format!(
        "{} streams, {} queries",
        config.streams.len(),
        config.queries.len()
    );
    println!("{}", format::success(&message, colored_stdout(&config)));
    Ok(())
}

async fn handle_streams(config: &Config) -> Result<()> {
    let engine = pipeline::build_engine(config).await?;
    pipeline::submit_queries(&engine, config).await?;
    print!("{}", format::streams_table(&engine.list_streams().await));
    engine.shutdown().await;
    Ok(())
}

async fn handle_describe(config: &Config, name: &str) -> Result<()> {
    let engine = pipeline::build_engine(config).await?;
    pipeline::submit_queries(&engine, config).await?;
    let description = engine
        .describe_stream(name)
        .await
        .with_context(|| format!("Failed to describe stream {}", name))?;
    print!("{}", format::description(&description, colored_stdout(config)));
    engine.shutdown().await;
    Ok(())
}
