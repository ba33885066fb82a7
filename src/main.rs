use std::{collections::BTreeMap, process, sync::Arc};

use clap::Parser;
use itertools::Itertools;
use tracing::{error, info, warn};

use substrate_indexer::{
	errors::IndexerError,
	health, logging,
	rpc::{
		chain_client::{ChainClient, HashCache},
		http_client::HttpRpcClient,
	},
	server,
	session::Controller,
	settings::{CommandLineOptions, Settings},
	store::Store,
	types::ChainParams,
};

// Exit codes: 0 normal, 1 config error, 2 storage error, 3 fatal runtime.
#[tokio::main]
async fn main() {
	process::exit(run().await)
}

async fn run() -> i32 {
	let settings = match Settings::new(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(e) => {
			eprintln!("Error reading settings: {e}");
			return 1
		},
	};
	logging::init(&settings.log_level);

	let chain_ids = match settings.chain_ids() {
		Ok(chain_ids) => chain_ids,
		Err(e) => {
			error!("invalid chain configuration: {e}");
			return 1
		},
	};

	// Open the store once up front so schema problems fail fast, before any
	// client connects.
	if let Err(e) = Store::open(&settings.db) {
		error!("could not open database at {}: {e}", settings.db.display());
		return 2
	}

	let hash_cache = Arc::new(HashCache::default());
	let mut chains = BTreeMap::new();
	for chain in chain_ids {
		let mut params = ChainParams::for_chain(chain);
		if let Some(depth) = settings.finality_depth {
			params.finality_depth = depth;
		}

		let url = settings.rpc_url(chain).expect("validated at load time");
		let client = match HttpRpcClient::new(url) {
			Ok(client) => client,
			Err(e) => {
				error!("could not create RPC client for {chain}: {e}");
				return 1
			},
		};
		match client.validate_genesis(params.genesis_hash).await {
			Ok(()) => {},
			// A node that is down right now is not a config error; workers
			// retry on their own schedule.
			Err(IndexerError::Transient(e)) =>
				warn!("skipping genesis check for {chain}, node unreachable: {e}"),
			Err(e) => {
				error!("genesis check failed for {chain}: {e}");
				return 3
			},
		}
		chains.insert(chain, (params, Arc::new(ChainClient::new(client, hash_cache.clone()))));
	}

	info!("serving chains: {}", chains.keys().join(", "));
	let controller = Arc::new(Controller::new(settings.db.clone(), chains));

	if let Some(health_check) = settings.health_check.clone() {
		tokio::spawn(async move {
			if let Err(e) = health::run(&health_check).await {
				warn!("health check listener failed: {e}");
			}
		});
	}

	tokio::select! {
		result = server::run(settings.listen_address(), controller.clone()) => {
			if let Err(e) = result {
				error!("listener failed: {e}");
				return 3
			}
		},
		_ = shutdown_signal() => {
			info!("shutdown signal received, stopping sessions");
			controller.shutdown().await;
		},
	}
	0
}

async fn shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut sigterm =
			tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
				.expect("sigterm handler installs");
		tokio::select! {
			_ = ctrl_c => {},
			_ = sigterm.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
