use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use rust_fave_aggregator::{Aggregator, AggregatorConfig, AggregatorService};
use rust_fave_common::{metrics::AggregatorMetrics, FieldMapping};
use rust_fave_rpc::{Endpoint, NetPlumberClient, RecordingEngine, VerificationEngine};
use std::{path::PathBuf, sync::Arc};

/// FaVe aggregator daemon
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long)]
    verbose: bool,

    /// Configuration file (TOML, YAML or JSON)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// TCP address to accept producers on
    #[clap(short, long)]
    listen: Option<String>,

    /// Unix domain socket to accept producers on
    #[clap(short, long)]
    socket: Option<PathBuf>,

    /// Verification engine endpoint, one per shard
    #[clap(short, long = "engine")]
    engines: Vec<String>,

    /// JSON file holding the initial field mapping
    #[clap(short, long)]
    mapping: Option<PathBuf>,

    /// Log engine calls instead of sending them to NetPlumber
    #[clap(long)]
    dry_run: bool,
}

async fn run<E: VerificationEngine>(
    config: &AggregatorConfig,
    engine: E,
    mapping: FieldMapping,
) -> Result<()> {
    let metrics = Arc::new(AggregatorMetrics::new());
    let aggregator = Aggregator::new(engine, mapping, metrics);

    let service = AggregatorService::bind(config).await?;
    if let Some(addr) = service.tcp_addr() {
        info!("Accepting producers on tcp:{}", addr);
    }

    let aggregator = service.run(aggregator).await?;
    info!(
        "Aggregator finished with {} tables, {} ports and {} links",
        aggregator.state().table_count(),
        aggregator.state().port_count(),
        aggregator.state().link_count()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" }
    )).init();

    let mut config = AggregatorConfig::load(cli.config.as_deref())?;

    // Command line flags override the file and the environment
    if cli.listen.is_some() {
        config.listen = cli.listen;
    }
    if cli.socket.is_some() {
        config.socket = cli.socket;
    }
    if cli.mapping.is_some() {
        config.mapping_file = cli.mapping;
    }
    if !cli.engines.is_empty() {
        config.engine.endpoints = cli
            .engines
            .iter()
            .map(|s| s.parse::<Endpoint>())
            .collect::<Result<_, _>>()
            .context("Invalid engine endpoint")?;
    }

    let mapping = config.initial_mapping()?;
    info!("Initial header length: {} bits", mapping.length());

    if cli.dry_run {
        warn!("Dry run: engine calls are only logged");
        run(&config, RecordingEngine::new().verbose(), mapping).await
    } else {
        let endpoints: Vec<String> = config.engine.endpoints.iter().map(|e| e.to_string()).collect();
        info!("Connecting to NetPlumber at {}", endpoints.join(", "));
        let engine = NetPlumberClient::connect(config.engine.clone())
            .await
            .context("Failed to connect to the verification engine")?;
        run(&config, engine, mapping).await
    }
}
