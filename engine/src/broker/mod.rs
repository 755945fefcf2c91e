//! The broker tier: durable store-and-forward between stations and
//! central intake.

pub mod breaker;
pub mod log;
pub mod queue;
pub mod scheduler;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use anyhow::Context;
use jsonrpsee::{core::async_trait, PendingSubscriptionSink};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use vf_primitives::{BallotId, ConfirmStatus, DeliveryError, Priority, StationId};
use vf_rpc_apis::{
	error as rpc_error, BallotOffer, BrokerAdminApiServer, BrokerApiServer, Confirmation,
	DeliveryAck, PendingRecordSummary, RpcResult,
};
use vf_utilities::task_scope::Scope;

use crate::{
	broker::{
		breaker::CircuitBreaker,
		log::{BrokerLog, BrokerRecordState},
		queue::{BrokerQueue, QueuedDelivery},
		scheduler::{recover_into_queue, AdminCommand, RetryScheduler},
	},
	rpc::{pipe_from_stream, start_server, CentralConnection, GracefulShutdown},
	settings::BrokerSettings,
};

/// Fan-out of terminal confirmations to subscribed stations. Subscribers
/// that went away are pruned on the next publish; a station that missed a
/// confirmation recovers it by re-offering (the broker answers
/// `Duplicate`).
#[derive(Default)]
pub struct ConfirmationHub {
	subscribers: Mutex<HashMap<StationId, Vec<mpsc::UnboundedSender<Confirmation>>>>,
}

impl ConfirmationHub {
	pub fn register(&self, station_id: &StationId) -> mpsc::UnboundedReceiver<Confirmation> {
		let (sender, receiver) = mpsc::unbounded_channel();
		self.subscribers
			.lock()
			.expect("hub lock poisoned")
			.entry(station_id.clone())
			.or_default()
			.push(sender);
		receiver
	}

	pub fn publish(&self, station_id: &StationId, confirmation: Confirmation) {
		let mut subscribers = self.subscribers.lock().expect("hub lock poisoned");
		if let Some(senders) = subscribers.get_mut(station_id) {
			senders.retain(|sender| sender.send(confirmation.clone()).is_ok());
			if senders.is_empty() {
				subscribers.remove(station_id);
			}
		}
	}
}

pub struct BrokerRpc {
	log: Arc<BrokerLog>,
	queue: Arc<BrokerQueue>,
	hub: Arc<ConfirmationHub>,
}

#[async_trait]
impl BrokerApiServer for BrokerRpc {
	async fn transmit_ballot(&self, offer: BallotOffer) -> RpcResult<DeliveryAck> {
		let ballot = offer
			.into_ballot()
			.map_err(|error| rpc_error::validation(error.to_string()))?;
		if !ballot.verify_integrity() {
			return Err(rpc_error::validation(format!(
				"integrity hash mismatch for ballot {}",
				ballot.ballot_id
			)))
		}

		// Repeated offers are the sender's retry path, not an error.
		if let Some(record) = self.log.get(ballot.ballot_id) {
			let status = match record.state {
				// Central already confirmed this id; terminal for the sender.
				BrokerRecordState::Sent => ConfirmStatus::Duplicate,
				// Still ours to deliver (or held for an operator).
				BrokerRecordState::Pending | BrokerRecordState::Quarantined =>
					ConfirmStatus::Received,
			};
			return Ok(DeliveryAck { status })
		}

		let delivery = QueuedDelivery {
			ballot_id: ballot.ballot_id,
			priority: Priority::Normal,
			arrival_time: chrono::Utc::now(),
		};
		self.queue
			.enqueue_with(delivery, || {
				self.log
					.record(&ballot, Priority::Normal)
					.map(|_state| ())
					.map_err(|error| DeliveryError::Persistence(error.to_string()))
			})
			.map_err(|error| match error {
				DeliveryError::QueueFull => rpc_error::queue_full(),
				other => rpc_error::persistence(other.to_string()),
			})?;

		Ok(DeliveryAck { status: ConfirmStatus::Received })
	}

	async fn probe(&self) -> RpcResult<()> {
		Ok(())
	}

	async fn subscribe_confirmations(
		&self,
		pending_sink: PendingSubscriptionSink,
		station_id: StationId,
	) {
		let receiver = self.hub.register(&station_id);
		tokio::spawn(async move {
			pipe_from_stream(pending_sink, UnboundedReceiverStream::new(receiver)).await;
		});
	}
}

pub struct BrokerAdminRpc {
	log: Arc<BrokerLog>,
	admin_tx: mpsc::UnboundedSender<AdminCommand>,
}

impl BrokerAdminRpc {
	fn send(&self, command: AdminCommand) -> RpcResult<()> {
		self.admin_tx
			.send(command)
			.map_err(|_| rpc_error::persistence("scheduler is shutting down"))
	}
}

#[async_trait]
impl BrokerAdminApiServer for BrokerAdminRpc {
	async fn drain_queue(&self) -> RpcResult<u32> {
		let (reply, receiver) = oneshot::channel();
		self.send(AdminCommand::DrainQueue { reply })?;
		receiver
			.await
			.map_err(|_| rpc_error::persistence("scheduler dropped the drain request"))
	}

	async fn reset_breaker(&self, destination: String) -> RpcResult<()> {
		self.send(AdminCommand::ResetBreaker { destination })
	}

	async fn force_retry(&self, ballot_id: BallotId) -> RpcResult<()> {
		let (reply, receiver) = oneshot::channel();
		self.send(AdminCommand::ForceRetry { ballot_id, reply })?;
		if receiver
			.await
			.map_err(|_| rpc_error::persistence("scheduler dropped the retry request"))?
		{
			Ok(())
		} else {
			Err(rpc_error::validation(format!("ballot {ballot_id} is not quarantined")))
		}
	}

	async fn dump_pending(&self) -> RpcResult<Vec<PendingRecordSummary>> {
		Ok(self
			.log
			.dump()
			.into_iter()
			.map(|record| PendingRecordSummary {
				ballot_id: record.ballot_id,
				state: record.state.to_string(),
				priority: record.priority,
				attempts: record.attempts,
				arrival_time: record.arrival_time,
				last_error: record.last_error,
			})
			.collect())
	}
}

pub struct BrokerHandles {
	pub addr: std::net::SocketAddr,
	pub admin_addr: std::net::SocketAddr,
	pub shutdown: GracefulShutdown,
}

/// Boots the broker tier: durable log recovery, scheduler, public and
/// admin RPC listeners.
pub async fn start(
	scope: &Scope<'_, anyhow::Error>,
	settings: BrokerSettings,
) -> anyhow::Result<BrokerHandles> {
	let log = Arc::new(
		BrokerLog::open(&settings.node.data_dir)
			.context("Could not open broker pending log")?,
	);
	let queue = Arc::new(BrokerQueue::new(settings.queue.capacity));
	let hub = Arc::new(ConfirmationHub::default());

	let (breaker, mut breaker_transitions) = CircuitBreaker::new(settings.breaker.config());
	let breaker = Arc::new(breaker);
	{
		let log = log.clone();
		scope.spawn(async move {
			while let Some(transition) = breaker_transitions.recv().await {
				tracing::info!(
					"Circuit {} {} -> {}: {}",
					transition.destination,
					transition.from,
					transition.to,
					transition.detail
				);
				log.audit_write(
					"breaker",
					None,
					format!(
						"{} {} -> {} ({})",
						transition.destination, transition.from, transition.to,
						transition.detail
					),
				);
			}
			Ok(())
		});
	}

	let recovered = recover_into_queue(&log, &queue)?;
	if recovered > 0 {
		tracing::info!("Recovered {recovered} pending deliveries from the journal");
	}

	let central = Arc::new(CentralConnection::new(
		settings.central.ws_endpoint.clone(),
		settings.central.request_timeout(),
	));

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let (complete_tx, complete_rx) = mpsc::channel::<()>(1);
	let (admin_tx, admin_rx) = mpsc::unbounded_channel();

	let scheduler = RetryScheduler::new(
		settings.scheduler.config(),
		queue.clone(),
		log.clone(),
		breaker.clone(),
		central,
		hub.clone(),
	);
	scope.spawn(scheduler.run(admin_rx, shutdown_rx, complete_tx));

	let (addr, server_handle) = start_server(
		("0.0.0.0", settings.node.port),
		BrokerRpc { log: log.clone(), queue: queue.clone(), hub }.into_rpc(),
	)
	.await
	.context("Could not start broker RPC server")?;
	let (admin_addr, admin_handle) = start_server(
		("127.0.0.1", settings.node.admin_port),
		BrokerAdminRpc { log, admin_tx }.into_rpc(),
	)
	.await
	.context("Could not start broker admin server")?;

	tracing::info!("Broker {} listening on {addr} (admin {admin_addr})", settings.node.id);

	Ok(BrokerHandles {
		addr,
		admin_addr,
		shutdown: GracefulShutdown {
			signal: shutdown_tx,
			complete: complete_rx,
			servers: vec![server_handle, admin_handle],
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use vf_primitives::Ballot;

	fn broker_rpc(capacity: usize) -> (BrokerRpc, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let rpc = BrokerRpc {
			log: Arc::new(BrokerLog::open(dir.path()).unwrap()),
			queue: Arc::new(BrokerQueue::new(capacity)),
			hub: Arc::new(ConfirmationHub::default()),
		};
		(rpc, dir)
	}

	fn offer(seed: u8) -> BallotOffer {
		Ballot::from_parts(
			BallotId::from_bytes([seed; 16]),
			vf_primitives::CandidateId::new("1").unwrap(),
			StationId::new("M01").unwrap(),
			chrono::Utc::now(),
		)
		.into()
	}

	#[tokio::test]
	async fn accepts_and_journals_an_offer() {
		let (rpc, _dir) = broker_rpc(8);
		let ack = rpc.transmit_ballot(offer(1)).await.unwrap();
		assert_eq!(ack.status, ConfirmStatus::Received);
		assert_eq!(rpc.log.list_pending().len(), 1);
		assert_eq!(rpc.queue.len(), 1);
	}

	#[tokio::test]
	async fn repeated_offer_is_received_then_duplicate_after_sent() {
		let (rpc, _dir) = broker_rpc(8);
		let offer = offer(1);

		assert_eq!(
			rpc.transmit_ballot(offer.clone()).await.unwrap().status,
			ConfirmStatus::Received
		);
		// The sender retries before central confirmed.
		assert_eq!(
			rpc.transmit_ballot(offer.clone()).await.unwrap().status,
			ConfirmStatus::Received
		);
		assert_eq!(rpc.queue.len(), 1);

		rpc.log.mark_sent(offer.ballot_id).unwrap();
		assert_eq!(
			rpc.transmit_ballot(offer).await.unwrap().status,
			ConfirmStatus::Duplicate
		);
	}

	#[tokio::test]
	async fn full_queue_refuses_with_queue_full() {
		let (rpc, _dir) = broker_rpc(1);
		rpc.transmit_ballot(offer(1)).await.unwrap();

		let error = rpc.transmit_ballot(offer(2)).await.unwrap_err();
		assert_eq!(error.code(), rpc_error::QUEUE_FULL);
		// Refused, not journaled: log and queue still agree.
		assert_eq!(rpc.log.list_pending().len(), 1);
		assert_eq!(rpc.queue.len(), 1);
	}

	#[tokio::test]
	async fn tampered_offer_is_refused() {
		let (rpc, _dir) = broker_rpc(8);
		let mut offer = offer(1);
		offer.candidate_id = vf_primitives::CandidateId::new("2").unwrap();

		let error = rpc.transmit_ballot(offer).await.unwrap_err();
		assert_eq!(error.code(), rpc_error::VALIDATION);
		assert!(rpc.log.list_pending().is_empty());
	}

	#[test]
	fn hub_delivers_to_matching_station_only() {
		let hub = ConfirmationHub::default();
		let station_a = StationId::new("A").unwrap();
		let station_b = StationId::new("B").unwrap();

		let mut receiver_a = hub.register(&station_a);
		let mut receiver_b = hub.register(&station_b);

		let confirmation = Confirmation {
			ballot_id: BallotId::from_bytes([1; 16]),
			status: ConfirmStatus::Processed,
		};
		hub.publish(&station_a, confirmation.clone());

		assert_eq!(receiver_a.try_recv().unwrap(), confirmation);
		assert!(receiver_b.try_recv().is_err());
	}

	#[test]
	fn hub_prunes_dropped_subscribers() {
		let hub = ConfirmationHub::default();
		let station = StationId::new("A").unwrap();

		let receiver = hub.register(&station);
		drop(receiver);

		hub.publish(
			&station,
			Confirmation {
				ballot_id: BallotId::from_bytes([1; 16]),
				status: ConfirmStatus::Processed,
			},
		);
		assert!(hub.subscribers.lock().unwrap().is_empty());
	}
}
