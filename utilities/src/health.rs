//! Health endpoint for the Voteflow daemons, allowing external monitors to
//! verify a tier is online. `GET /health` answers 200 with `INITIALISING`
//! until the daemon finishes startup, then `RUNNING`.

use std::{
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use anyhow::Context;
use serde::Deserialize;
use warp::Filter;

use crate::task_scope::Scope;

pub const INITIALISING: &str = "INITIALISING";
pub const RUNNING: &str = "RUNNING";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

/// Binds the health listener and spawns the serve loop on the scope.
/// Returns the bound address so tests can bind port 0.
pub fn start(
	scope: &Scope<'_, anyhow::Error>,
	health_check: &HealthCheck,
	has_completed_initialising: Arc<AtomicBool>,
) -> anyhow::Result<SocketAddr> {
	let route = warp::path("health").and(warp::get()).map(move || {
		if has_completed_initialising.load(Ordering::Relaxed) {
			RUNNING
		} else {
			INITIALISING
		}
	});

	let addr: SocketAddr = format!("{}:{}", health_check.hostname, health_check.port)
		.parse()
		.with_context(|| {
			format!("Invalid health check address {}:{}", health_check.hostname, health_check.port)
		})?;
	let (bound_addr, server) = warp::serve(route)
		.try_bind_ephemeral(addr)
		.with_context(|| format!("Could not bind health check listener to {addr}"))?;

	tracing::info!("Health check listening on {bound_addr}");

	scope.spawn(async move {
		server.await;
		Ok(())
	});

	Ok(bound_addr)
}

pub fn start_if_configured(
	scope: &Scope<'_, anyhow::Error>,
	health_check: Option<&HealthCheck>,
	has_completed_initialising: Arc<AtomicBool>,
) -> anyhow::Result<Option<SocketAddr>> {
	health_check
		.map(|health_check| start(scope, health_check, has_completed_initialising))
		.transpose()
}
