//! Health endpoint, so that supervisors can probe liveness separately from
//! the client-facing listener. Returns 200 on `/health` while the process
//! runs.

use std::net::SocketAddr;

use anyhow::Context;
use tracing::info;
use warp::Filter;

use crate::settings::HealthCheck;

pub async fn run(health_check: &HealthCheck) -> anyhow::Result<()> {
	let address: SocketAddr = format!("{}:{}", health_check.hostname, health_check.port)
		.parse()
		.with_context(|| "invalid health check address")?;

	let route = warp::path("health").map(warp::reply);
	let (bound, server) = warp::serve(route)
		.try_bind_ephemeral(address)
		.with_context(|| format!("could not bind health check to {address}"))?;
	info!("health check listening on {bound}");
	server.await;
	Ok(())
}
