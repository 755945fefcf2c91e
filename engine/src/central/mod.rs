//! The central tier: idempotent intake feeding the durable tally.

pub mod intake;
pub mod tally;

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use jsonrpsee::core::async_trait;
use tokio::sync::{mpsc, watch};

use vf_primitives::CandidateId;
use vf_rpc_apis::{
	error as rpc_error, BallotOffer, CentralAdminApiServer, CentralApiServer, DeliveryAck,
	RpcResult,
};
use vf_utilities::task_scope::Scope;

use crate::{
	central::{
		intake::{run_committer, CentralIntake, IntakeError},
		tally::Tally,
	},
	rpc::{start_server, GracefulShutdown},
	settings::CentralSettings,
};

pub struct CentralRpc {
	intake: Arc<CentralIntake>,
}

#[async_trait]
impl CentralApiServer for CentralRpc {
	async fn receive_ballot(&self, offer: BallotOffer) -> RpcResult<DeliveryAck> {
		let ballot = offer
			.into_ballot()
			.map_err(|error| rpc_error::validation(error.to_string()))?;
		match self.intake.receive(ballot).await {
			Ok(status) => Ok(DeliveryAck { status }),
			Err(IntakeError::Validation(message)) => Err(rpc_error::validation(message)),
			Err(IntakeError::Violation(violation)) =>
				Err(rpc_error::protocol_violation(violation.to_string())),
			Err(error @ (IntakeError::Persistence(_) | IntakeError::CommitterGone)) =>
				Err(rpc_error::persistence(error.to_string())),
		}
	}

	async fn probe(&self) -> RpcResult<()> {
		Ok(())
	}
}

pub struct CentralAdminRpc {
	tally: Arc<Tally>,
}

#[async_trait]
impl CentralAdminApiServer for CentralAdminRpc {
	async fn snapshot(&self) -> RpcResult<BTreeMap<CandidateId, u64>> {
		Ok(self.tally.snapshot())
	}
}

pub struct CentralHandles {
	pub addr: std::net::SocketAddr,
	pub admin_addr: std::net::SocketAddr,
	pub shutdown: GracefulShutdown,
}

/// Boots the central tier: tally checkpoint load, received-log replay,
/// sequential committer, periodic checkpointer, RPC listeners.
pub async fn start(
	scope: &Scope<'_, anyhow::Error>,
	settings: CentralSettings,
) -> anyhow::Result<CentralHandles> {
	let tally = Arc::new(
		Tally::load(settings.node.data_dir.join("tally.checkpoint"), settings.tally.config())
			.context("Could not load tally checkpoint")?,
	);

	let (committer_tx, committer_rx) = mpsc::unbounded_channel();
	let (intake, replay_stats) =
		CentralIntake::open(&settings.node.data_dir, &tally, committer_tx)
			.context("Could not open received log")?;
	let intake = Arc::new(intake);
	if replay_stats != Default::default() {
		tracing::info!(
			"Received-log replay: {} re-applied, {} completed, {} violations",
			replay_stats.replayed,
			replay_stats.completed,
			replay_stats.violations
		);
	}

	scope.spawn(run_committer(tally.clone(), committer_rx));

	let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
	let (complete_tx, complete_rx) = mpsc::channel::<()>(1);

	// Periodic checkpointer; writes a final checkpoint on shutdown.
	{
		let tally = tally.clone();
		let checkpoint_interval = settings.tally.config().checkpoint_interval;
		let _shutdown_complete = complete_tx;
		scope.spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown_rx.changed() => break,
					_ = tokio::time::sleep(checkpoint_interval) => {
						if let Err(error) = tally.checkpoint() {
							tracing::error!("Periodic tally checkpoint failed: {error}");
						}
					},
				}
			}
			tally.checkpoint().context("Final tally checkpoint failed")?;
			tracing::info!("Tally checkpointed, shutting down");
			drop(_shutdown_complete);
			Ok(())
		});
	}

	let (addr, server_handle) = start_server(
		("0.0.0.0", settings.node.port),
		CentralRpc { intake }.into_rpc(),
	)
	.await
	.context("Could not start central RPC server")?;
	let (admin_addr, admin_handle) = start_server(
		("127.0.0.1", settings.node.admin_port),
		CentralAdminRpc { tally }.into_rpc(),
	)
	.await
	.context("Could not start central admin server")?;

	tracing::info!("Central {} listening on {addr} (admin {admin_addr})", settings.node.id);

	Ok(CentralHandles {
		addr,
		admin_addr,
		shutdown: GracefulShutdown {
			signal: shutdown_tx,
			complete: complete_rx,
			servers: vec![server_handle, admin_handle],
		},
	})
}
