use anyhow::{Context, Result};
use auction_config::{Config, ConfigLoader};
use auction_core::AuctionBuilder;
use auction_monitoring::{init_tracing, TracingConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod api;
mod factories;

#[derive(Parser)]
#[command(name = "auction-service")]
#[command(about = "Sealed-intent batch auction service", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/demo.toml")]
	config: PathBuf,

	/// Overrides `monitoring.log_level` from the configuration file
	#[arg(long, env = "AUCTION_LOG_LEVEL")]
	log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the auction service
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

	let level = cli
		.log_level
		.clone()
		.unwrap_or_else(|| config.monitoring.log_level.clone());
	init_tracing(
		TracingConfig::new()
			.with_level(level)
			.with_json_format(config.monitoring.log_format == "json"),
	)
	.map_err(|e| anyhow::anyhow!("{}", e))?;

	match cli.command {
		Some(Commands::Start) | None => start_service(config).await,
		Some(Commands::Validate) => validate_config(&cli.config, &config),
	}
}

async fn start_service(config: Config) -> Result<()> {
	info!(auction_id = %config.auction.id, "Starting auction service");

	let api_config = config.api.clone().filter(|api| api.enabled);
	let engine = factories::register(AuctionBuilder::new(config))
		.build()
		.context("Failed to build auction engine")?;
	let engine = Arc::new(engine);

	let api_handle = api_config.map(|api_config| {
		let server = api::ApiServer::new(&api_config, engine.clone());
		tokio::spawn(async move {
			if let Err(e) = server.run(setup_shutdown_signal()).await {
				error!(error = %e, "API server stopped");
			}
		})
	});

	// Returns once a shutdown signal arrives.
	engine.run().await.context("Auction engine failed")?;

	if let Some(handle) = api_handle {
		handle.abort();
	}
	info!("Auction service stopped");
	Ok(())
}

fn validate_config(path: &Path, config: &Config) -> Result<()> {
	info!("Configuration file {:?} is valid", path);
	info!("Auction: {} (chain {})", config.auction.id, config.auction.chain_id);
	info!(
		"Epoch size: {} blocks, finality depth: {}",
		config.auction.epoch_size, config.auction.finality_depth
	);
	info!("Storage backend: {}", config.storage.backend);
	info!("Time-lock backend: {}", config.timelock.backend);
	info!("Block source: {}", config.blocks.source);
	for provider in &config.delivery.providers {
		info!("  Delivery provider: {}", provider.backend);
	}
	info!("Pricing strategy: {}", config.pricing.strategy);
	if let Some(oracle) = &config.pricing.oracle {
		info!("  Price oracle: {}", oracle.backend);
	}

	// Factories validate their own tables, so building proves the file usable.
	factories::register(AuctionBuilder::new(config.clone()))
		.build()
		.context("Configuration is not usable")?;
	info!("All backends initialized");
	Ok(())
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
