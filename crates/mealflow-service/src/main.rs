//! Main entry point for the mealflow coordination service.
//!
//! This binary wires the order-lifecycle engine together from pluggable
//! storage and payment-gateway implementations and serves the client
//! facing HTTP API next to it.

use clap::Parser;
use mealflow_config::Config;
use mealflow_core::{Engine, EngineBuilder, EngineFactories};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

mod server;

/// Command-line arguments for the mealflow service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	let config_path = args.config.to_string_lossy();
	let config = Config::from_file(&config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.service.id);

	let engine = Arc::new(build_engine(config)?);

	let api_config = engine.config().api.clone().filter(|api| api.enabled);
	if let Some(api_config) = api_config {
		let api_engine = Arc::clone(&engine);

		tokio::select! {
			result = engine.run() => {
				tracing::info!("Engine finished");
				result?;
			}
			result = server::start_server(api_config, api_engine) => {
				tracing::info!("API server finished");
				result?;
			}
		}
	} else {
		tracing::info!("Starting engine without API server");
		engine.run().await?;
	}

	tracing::info!("Stopped mealflow service");
	Ok(())
}

/// Builds the engine from the implementations linked into this binary.
fn build_engine(config: Config) -> Result<Engine, Box<dyn std::error::Error>> {
	let storage_factories: HashMap<String, mealflow_storage::StorageFactory> =
		mealflow_storage::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect();
	let gateway_factories: HashMap<String, mealflow_gateway::GatewayFactory> =
		mealflow_gateway::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect();

	let engine = EngineBuilder::new(config).build(EngineFactories {
		storage_factories,
		gateway_factories,
	})?;
	Ok(engine)
}
