//! The station tier: the voter-facing end of the pipeline.

pub mod authorizer;
pub mod outbox;
pub mod sender;

use std::sync::Arc;

use anyhow::Context;
use jsonrpsee::core::async_trait;
use tokio::sync::{mpsc, watch};

use vf_primitives::{BallotId, CandidateId, VoterId};
use vf_rpc_apis::{
	error as rpc_error, OutboxEntrySummary, RpcResult, StationAdminApiServer, StationApiServer,
};
use vf_utilities::task_scope::Scope;

use crate::{
	rpc::{start_server, BrokerConnection, GracefulShutdown},
	settings::StationSettings,
	station::{
		authorizer::{load_roll, RollAuthorizer},
		outbox::StationOutbox,
		sender::{run_confirmation_loop, run_send_loop, StationSender},
	},
};

pub struct StationRpc {
	sender: Arc<StationSender>,
}

#[async_trait]
impl StationApiServer for StationRpc {
	async fn cast(&self, candidate_id: CandidateId, voter_id: VoterId) -> RpcResult<BallotId> {
		self.sender.cast(candidate_id, voter_id).map_err(rpc_error::from_cast_error)
	}

	async fn probe(&self) -> RpcResult<()> {
		Ok(())
	}
}

pub struct StationAdminRpc {
	outbox: Arc<StationOutbox>,
}

#[async_trait]
impl StationAdminApiServer for StationAdminRpc {
	async fn dump_unconfirmed(&self) -> RpcResult<Vec<OutboxEntrySummary>> {
		Ok(self
			.outbox
			.scan_unconfirmed()
			.into_iter()
			.map(|entry| OutboxEntrySummary {
				ballot_id: entry.ballot_id,
				candidate_id: entry.candidate_id,
				state: entry.state,
				attempts: entry.attempts,
				timestamp: entry.timestamp,
			})
			.collect())
	}
}

pub struct StationHandles {
	pub addr: std::net::SocketAddr,
	pub admin_addr: std::net::SocketAddr,
	pub shutdown: GracefulShutdown,
}

/// Boots the station tier. Refuses to start (and thus to open for voting)
/// if the roll or the outbox journal cannot be read.
pub async fn start(
	scope: &Scope<'_, anyhow::Error>,
	settings: StationSettings,
) -> anyhow::Result<StationHandles> {
	let outbox = Arc::new(
		StationOutbox::open(&settings.node.data_dir)
			.context("Could not open outbox journal; refusing to open for voting")?,
	);

	let roll = load_roll(&settings.roll_file)?;
	tracing::info!("Eligibility roll loaded: {} voters", roll.len());
	let authorizer = RollAuthorizer::new(roll, outbox.voted_voters());

	let station_id = settings.node.station_id()?;
	let (sender, cast_rx) = StationSender::new(station_id.clone(), authorizer, outbox.clone());

	let broker = Arc::new(BrokerConnection::new(
		settings.broker.ws_endpoint.clone(),
		settings.broker.request_timeout(),
	));

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let (complete_tx, complete_rx) = mpsc::channel::<()>(1);

	scope.spawn(run_send_loop(
		outbox.clone(),
		broker.clone(),
		station_id.clone(),
		settings.sender.send_loop_config(),
		cast_rx,
		shutdown_rx.clone(),
		complete_tx.clone(),
	));
	scope.spawn(run_confirmation_loop(
		outbox.clone(),
		broker,
		station_id,
		settings.sender.reconnect_delay(),
		shutdown_rx,
		complete_tx,
	));

	let (addr, server_handle) = start_server(
		("0.0.0.0", settings.node.port),
		StationRpc { sender }.into_rpc(),
	)
	.await
	.context("Could not start station RPC server")?;
	let (admin_addr, admin_handle) = start_server(
		("127.0.0.1", settings.node.admin_port),
		StationAdminRpc { outbox }.into_rpc(),
	)
	.await
	.context("Could not start station admin server")?;

	tracing::info!("Station {} listening on {addr} (admin {admin_addr})", settings.node.id);

	Ok(StationHandles {
		addr,
		admin_addr,
		shutdown: GracefulShutdown {
			signal: shutdown_tx,
			complete: complete_rx,
			servers: vec![server_handle, admin_handle],
		},
	})
}
