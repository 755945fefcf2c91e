//! Retry scheduler: the sole consumer of the broker queue.
//!
//! Drains pending records in strict (priority, arrival) order, honoring
//! the circuit breaker, with a bounded number of in-flight sends and
//! exponential backoff per ballot. Backoff stage lives in the durable
//! broker log (the journaled attempt counter), not in the scheduler, so a
//! restart resumes where delivery left off.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use tokio::{
	sync::{mpsc, oneshot, watch},
	time::Instant,
};

use vf_primitives::{BallotId, ConfirmStatus, DeliveryError};
use vf_rpc_apis::{BallotOffer, Confirmation, DeliveryAck};
use vf_utilities::UnendingStream;

use crate::broker::{
	breaker::{Availability, CircuitBreaker},
	log::BrokerLog,
	queue::{BrokerQueue, QueuedDelivery},
	ConfirmationHub,
};

/// The broker's single downstream destination.
pub const CENTRAL_DESTINATION: &str = "central";

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
	/// Cadence of the periodic drain pass.
	pub interval: Duration,
	/// Per-call deadline towards central.
	pub request_timeout: Duration,
	pub base_delay: Duration,
	pub multiplier: u32,
	pub max_delay: Duration,
	/// Attempts after which a record is quarantined (operator-revivable).
	pub quarantine_after: u32,
	pub max_in_flight: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CentralClient: Send + Sync + 'static {
	async fn receive_ballot(&self, offer: BallotOffer) -> Result<DeliveryAck, DeliveryError>;
}

pub enum AdminCommand {
	DrainQueue { reply: oneshot::Sender<u32> },
	ResetBreaker { destination: String },
	ForceRetry { ballot_id: BallotId, reply: oneshot::Sender<bool> },
}

type SendOutcome = (BallotId, Result<DeliveryAck, DeliveryError>);

pub struct RetryScheduler<C> {
	config: SchedulerConfig,
	queue: Arc<BrokerQueue>,
	log: Arc<BrokerLog>,
	breaker: Arc<CircuitBreaker>,
	central: Arc<C>,
	hub: Arc<ConfirmationHub>,
}

impl<C: CentralClient> RetryScheduler<C> {
	pub fn new(
		config: SchedulerConfig,
		queue: Arc<BrokerQueue>,
		log: Arc<BrokerLog>,
		breaker: Arc<CircuitBreaker>,
		central: Arc<C>,
		hub: Arc<ConfirmationHub>,
	) -> Self {
		Self { config, queue, log, breaker, central, hub }
	}

	pub async fn run(
		self,
		mut admin_rx: mpsc::UnboundedReceiver<AdminCommand>,
		mut shutdown: watch::Receiver<bool>,
		_shutdown_complete: mpsc::Sender<()>,
	) -> anyhow::Result<()> {
		let mut in_flight: FuturesUnordered<BoxFuture<'static, SendOutcome>> =
			FuturesUnordered::new();
		let mut in_flight_ids: HashSet<BallotId> = HashSet::new();
		let mut backoff_until: HashMap<BallotId, Instant> = HashMap::new();

		let mut interval = tokio::time::interval(self.config.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = interval.tick() => {
					self.dispatch(&mut in_flight, &mut in_flight_ids, &backoff_until);
				},
				_ = self.queue.notified() => {
					self.dispatch(&mut in_flight, &mut in_flight_ids, &backoff_until);
				},
				Some(command) = admin_rx.recv() => match command {
					AdminCommand::DrainQueue { reply } => {
						let dispatched =
							self.dispatch(&mut in_flight, &mut in_flight_ids, &backoff_until);
						let _result = reply.send(dispatched);
					},
					AdminCommand::ResetBreaker { destination } => {
						self.breaker.reset(&destination);
					},
					AdminCommand::ForceRetry { ballot_id, reply } => {
						let revived = match self.log.reactivate(ballot_id) {
							Ok(Some(record)) => {
								backoff_until.remove(&ballot_id);
								self.queue.requeue(QueuedDelivery {
									ballot_id,
									priority: record.priority,
									arrival_time: record.arrival_time,
								});
								true
							},
							Ok(None) => false,
							Err(error) => {
								tracing::error!("Could not revive {ballot_id}: {error}");
								false
							},
						};
						let _result = reply.send(revived);
					},
				},
				(ballot_id, result) = in_flight.next_or_pending() => {
					self.handle_outcome(ballot_id, result, &mut in_flight_ids, &mut backoff_until);
					// A slot freed up; anything due can go immediately.
					self.dispatch(&mut in_flight, &mut in_flight_ids, &backoff_until);
				},
			}
		}

		// Graceful shutdown: no new dispatches, but every in-flight send is
		// resolved and journaled before exit.
		while let Some((ballot_id, result)) = in_flight.next().await {
			self.handle_outcome(ballot_id, result, &mut in_flight_ids, &mut backoff_until);
		}
		tracing::info!("Retry scheduler drained, shutting down");
		Ok(())
	}

	/// Takes due deliveries off the queue up to the in-flight limit and
	/// spawns their sends. Returns the number dispatched.
	fn dispatch(
		&self,
		in_flight: &mut FuturesUnordered<BoxFuture<'static, SendOutcome>>,
		in_flight_ids: &mut HashSet<BallotId>,
		backoff_until: &HashMap<BallotId, Instant>,
	) -> u32 {
		let slots = self.config.max_in_flight.saturating_sub(in_flight.len());
		let limit = match self.breaker.check(CENTRAL_DESTINATION) {
			Availability::Available => slots,
			// Exactly one probe while half-open.
			Availability::Probe => slots.min(1),
			Availability::Open => {
				if !self.queue.is_empty() {
					self.log.audit_write(
						"breaker-wait",
						None,
						format!("{} pending deliveries held back", self.queue.len()),
					);
				}
				return 0
			},
		};
		if limit == 0 {
			return 0
		}

		let now = Instant::now();
		let due = self.queue.take_where(|delivery| {
			!in_flight_ids.contains(&delivery.ballot_id) &&
				backoff_until
					.get(&delivery.ballot_id)
					.map(|until| *until <= now)
					.unwrap_or(true)
		});

		let mut dispatched = 0u32;
		for delivery in due {
			if dispatched as usize >= limit {
				self.queue.requeue(delivery);
				continue
			}

			let Some(record) = self.log.get(delivery.ballot_id) else {
				tracing::error!("Queued ballot {} missing from broker log", delivery.ballot_id);
				continue
			};
			let ballot = match record.ballot() {
				Ok(ballot) => ballot,
				Err(error) => {
					tracing::error!("{error}");
					let _result = self
						.log
						.mark_quarantined(delivery.ballot_id, "undecodable journal payload");
					continue
				},
			};

			let central = self.central.clone();
			let request_timeout = self.config.request_timeout;
			let ballot_id = delivery.ballot_id;
			in_flight_ids.insert(ballot_id);
			in_flight.push(Box::pin(async move {
				let result = match tokio::time::timeout(
					request_timeout,
					central.receive_ballot(BallotOffer::from(ballot)),
				)
				.await
				{
					Ok(result) => result,
					Err(_elapsed) => Err(DeliveryError::Timeout),
				};
				(ballot_id, result)
			}));
			dispatched += 1;
		}
		dispatched
	}

	fn handle_outcome(
		&self,
		ballot_id: BallotId,
		result: Result<DeliveryAck, DeliveryError>,
		in_flight_ids: &mut HashSet<BallotId>,
		backoff_until: &mut HashMap<BallotId, Instant>,
	) {
		in_flight_ids.remove(&ballot_id);

		match result {
			Ok(DeliveryAck { status: status @ (ConfirmStatus::Processed | ConfirmStatus::Duplicate) }) => {
				backoff_until.remove(&ballot_id);
				if let Err(error) = self.log.mark_sent(ballot_id) {
					// The ballot is safe at central; the next pass will
					// re-offer and central will answer Duplicate.
					tracing::error!("Could not journal SENT for {ballot_id}: {error}");
				}
				self.breaker.on_success(CENTRAL_DESTINATION);
				self.publish_confirmation(ballot_id, status);
			},
			Ok(DeliveryAck { status: ConfirmStatus::PermanentError }) |
			Err(DeliveryError::Permanent(_)) => {
				let reason = match &result {
					Err(DeliveryError::Permanent(reason)) => reason.clone(),
					_ => "permanent error from central".to_string(),
				};
				tracing::error!("Ballot {ballot_id} permanently refused: {reason}");
				backoff_until.remove(&ballot_id);
				// The destination answered; only the ballot is bad.
				self.breaker.on_success(CENTRAL_DESTINATION);
				if let Err(error) = self.log.mark_quarantined(ballot_id, &reason) {
					tracing::error!("Could not quarantine {ballot_id}: {error}");
				}
				self.publish_confirmation(ballot_id, ConfirmStatus::PermanentError);
			},
			Ok(DeliveryAck { status: ConfirmStatus::Received | ConfirmStatus::TransientError }) |
			Err(_) => {
				let detail = match &result {
					Ok(ack) => format!("central answered {}", ack.status),
					Err(error) => error.to_string(),
				};
				self.breaker.on_failure(CENTRAL_DESTINATION);
				match self.log.increment_attempts(ballot_id, &detail) {
					Ok(attempts) if attempts >= self.config.quarantine_after => {
						tracing::warn!(
							"Quarantining {ballot_id} after {attempts} attempts: {detail}"
						);
						backoff_until.remove(&ballot_id);
						if let Err(error) = self
							.log
							.mark_quarantined(ballot_id, &format!("{attempts} failed attempts"))
						{
							tracing::error!("Could not quarantine {ballot_id}: {error}");
						}
					},
					Ok(attempts) => {
						let delay = self.backoff_delay(attempts);
						tracing::warn!(
							"Delivery of {ballot_id} failed (attempt {attempts}): {detail}; \
							 next attempt in {}ms",
							delay.as_millis()
						);
						backoff_until.insert(ballot_id, Instant::now() + delay);
						if let Some(record) = self.log.get(ballot_id) {
							self.queue.requeue(QueuedDelivery {
								ballot_id,
								priority: record.priority,
								arrival_time: record.arrival_time,
							});
						}
					},
					Err(error) => {
						tracing::error!("Could not journal attempt for {ballot_id}: {error}");
					},
				}
			},
		}
	}

	fn backoff_delay(&self, attempts: u32) -> Duration {
		let capped = std::cmp::min(
			self.config.max_delay,
			self.config
				.base_delay
				.saturating_mul(self.config.multiplier.saturating_pow(attempts.min(16))),
		);
		// Jitter between half and the full delay, so a backlog of records
		// does not retry in lockstep.
		let half = capped / 2;
		if half.is_zero() {
			capped
		} else {
			half + rand::Rng::gen_range(&mut rand::thread_rng(), Duration::default()..=half)
		}
	}

	fn publish_confirmation(&self, ballot_id: BallotId, status: ConfirmStatus) {
		if let Some(station_id) =
			self.log.get(ballot_id).and_then(|record| record.station_id())
		{
			self.hub.publish(&station_id, Confirmation { ballot_id, status });
		}
	}
}

/// Recovery entry point: re-enqueues every non-SENT journal record at HIGH
/// priority. Called once at broker startup before the scheduler runs.
pub fn recover_into_queue(log: &BrokerLog, queue: &BrokerQueue) -> anyhow::Result<usize> {
	let recovered = log.recover_pending()?;
	let count = recovered.len();
	for record in recovered {
		queue.requeue(QueuedDelivery {
			ballot_id: record.ballot_id,
			priority: record.priority,
			arrival_time: record.arrival_time,
		});
	}
	Ok(count)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::broker::breaker::{BreakerConfig, CircuitState};
	use std::sync::Mutex;
	use vf_primitives::{Ballot, CandidateId, Priority, StationId};

	fn test_config() -> SchedulerConfig {
		SchedulerConfig {
			interval: Duration::from_millis(50),
			request_timeout: Duration::from_millis(500),
			base_delay: Duration::from_millis(20),
			multiplier: 2,
			max_delay: Duration::from_secs(5),
			quarantine_after: 5,
			max_in_flight: 4,
		}
	}

	fn breaker_config() -> BreakerConfig {
		BreakerConfig {
			failure_threshold: 3,
			open_timeout: Duration::from_secs(10),
			success_threshold: 1,
		}
	}

	struct Fixture {
		queue: Arc<BrokerQueue>,
		log: Arc<BrokerLog>,
		breaker: Arc<CircuitBreaker>,
		hub: Arc<ConfirmationHub>,
		_dir: tempfile::TempDir,
	}

	fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let (breaker, _transitions) = CircuitBreaker::new(breaker_config());
		Fixture {
			queue: Arc::new(BrokerQueue::new(64)),
			log: Arc::new(BrokerLog::open(dir.path()).unwrap()),
			breaker: Arc::new(breaker),
			hub: Arc::new(ConfirmationHub::default()),
			_dir: dir,
		}
	}

	fn ballot(seed: u8) -> Ballot {
		Ballot::from_parts(
			BallotId::from_bytes([seed; 16]),
			CandidateId::new("1").unwrap(),
			StationId::new("M01").unwrap(),
			chrono::Utc::now(),
		)
	}

	fn enqueue(fixture: &Fixture, ballot: &Ballot, priority: Priority) {
		let delivery = QueuedDelivery {
			ballot_id: ballot.ballot_id,
			priority,
			arrival_time: chrono::Utc::now(),
		};
		fixture
			.queue
			.enqueue_with(delivery, || {
				fixture.log.record(ballot, priority).map(|_| ()).map_err(|error| {
					DeliveryError::Persistence(error.to_string())
				})
			})
			.unwrap();
	}

	fn spawn_scheduler<C: CentralClient>(
		fixture: &Fixture,
		central: C,
	) -> (watch::Sender<bool>, mpsc::UnboundedSender<AdminCommand>) {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (admin_tx, admin_rx) = mpsc::unbounded_channel();
		let (complete_tx, _complete_rx) = mpsc::channel(1);
		let scheduler = RetryScheduler::new(
			test_config(),
			fixture.queue.clone(),
			fixture.log.clone(),
			fixture.breaker.clone(),
			Arc::new(central),
			fixture.hub.clone(),
		);
		tokio::spawn(scheduler.run(admin_rx, shutdown_rx, complete_tx));
		(shutdown_tx, admin_tx)
	}

	async fn wait_until(mut condition: impl FnMut() -> bool) {
		for _ in 0..1000 {
			if condition() {
				return
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("condition not reached");
	}

	/// Test double with a scripted response sequence; repeats the final
	/// response once the script is exhausted.
	struct ScriptedCentral {
		script: Mutex<Vec<Result<DeliveryAck, DeliveryError>>>,
		calls: Arc<Mutex<u32>>,
	}

	impl ScriptedCentral {
		fn new(script: Vec<Result<DeliveryAck, DeliveryError>>) -> (Self, Arc<Mutex<u32>>) {
			let calls = Arc::new(Mutex::new(0));
			(Self { script: Mutex::new(script), calls: calls.clone() }, calls)
		}
	}

	#[async_trait::async_trait]
	impl CentralClient for ScriptedCentral {
		async fn receive_ballot(
			&self,
			_offer: BallotOffer,
		) -> Result<DeliveryAck, DeliveryError> {
			*self.calls.lock().unwrap() += 1;
			let mut script = self.script.lock().unwrap();
			if script.len() > 1 {
				script.remove(0)
			} else {
				script[0].clone()
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn delivers_pending_and_confirms() {
		let fixture = fixture();
		let ballot = ballot(1);
		let mut confirmations = fixture.hub.register(&ballot.station_id);
		enqueue(&fixture, &ballot, Priority::Normal);

		let mut central = MockCentralClient::new();
		central
			.expect_receive_ballot()
			.times(1)
			.returning(|_| Ok(DeliveryAck { status: ConfirmStatus::Processed }));
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| record.state == crate::broker::log::BrokerRecordState::Sent)
				.unwrap_or(false)
		})
		.await;

		assert_eq!(
			confirmations.recv().await.unwrap(),
			Confirmation { ballot_id: ballot.ballot_id, status: ConfirmStatus::Processed }
		);
		assert!(fixture.queue.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_ack_is_terminal_success() {
		let fixture = fixture();
		let ballot = ballot(1);
		enqueue(&fixture, &ballot, Priority::Normal);

		let (central, _calls) =
			ScriptedCentral::new(vec![Ok(DeliveryAck { status: ConfirmStatus::Duplicate })]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| record.state == crate::broker::log::BrokerRecordState::Sent)
				.unwrap_or(false)
		})
		.await;
	}

	#[tokio::test(start_paused = true)]
	async fn retries_with_backoff_until_success() {
		let fixture = fixture();
		let ballot = ballot(1);
		enqueue(&fixture, &ballot, Priority::Normal);

		let (central, calls) = ScriptedCentral::new(vec![
			Err(DeliveryError::Transport("connection refused".to_string())),
			Err(DeliveryError::Transport("connection refused".to_string())),
			Ok(DeliveryAck { status: ConfirmStatus::Processed }),
		]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| record.state == crate::broker::log::BrokerRecordState::Sent)
				.unwrap_or(false)
		})
		.await;

		assert_eq!(*calls.lock().unwrap(), 3);
		// The attempt counter journaled both failures.
		assert_eq!(fixture.log.get(ballot.ballot_id).unwrap().attempts, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn consecutive_failures_open_the_breaker() {
		let fixture = fixture();
		for seed in 1..=3 {
			enqueue(&fixture, &ballot(seed), Priority::Normal);
		}

		let (central, _calls) = ScriptedCentral::new(vec![Err(DeliveryError::Transport(
			"connection refused".to_string(),
		))]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let breaker = fixture.breaker.clone();
		wait_until(move || breaker.state(CENTRAL_DESTINATION) == CircuitState::Open).await;

		// Held back, not lost: the records stay pending.
		assert_eq!(fixture.log.list_pending().len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn transient_error_status_counts_as_failure() {
		let fixture = fixture();
		for seed in 1..=3 {
			enqueue(&fixture, &ballot(seed), Priority::Normal);
		}

		let (central, _calls) = ScriptedCentral::new(vec![Ok(DeliveryAck {
			status: ConfirmStatus::TransientError,
		})]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let breaker = fixture.breaker.clone();
		wait_until(move || breaker.state(CENTRAL_DESTINATION) == CircuitState::Open).await;
	}

	#[tokio::test(start_paused = true)]
	async fn breaker_recovers_through_probe() {
		let fixture = fixture();
		for seed in 1..=3 {
			enqueue(&fixture, &ballot(seed), Priority::Normal);
		}

		// Three failures trip the breaker; afterwards everything succeeds.
		let (central, _calls) = ScriptedCentral::new(vec![
			Err(DeliveryError::Transport("down".to_string())),
			Err(DeliveryError::Transport("down".to_string())),
			Err(DeliveryError::Transport("down".to_string())),
			Ok(DeliveryAck { status: ConfirmStatus::Processed }),
		]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let breaker = fixture.breaker.clone();
		wait_until(move || breaker.state(CENTRAL_DESTINATION) == CircuitState::Open).await;

		// After the open timeout the probe goes through, closes the breaker
		// (success threshold 1) and the backlog drains.
		let log = fixture.log.clone();
		wait_until(move || log.list_pending().is_empty()).await;
		assert_eq!(fixture.breaker.state(CENTRAL_DESTINATION), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn permanent_error_quarantines_without_retry() {
		let fixture = fixture();
		let ballot = ballot(1);
		let mut confirmations = fixture.hub.register(&ballot.station_id);
		enqueue(&fixture, &ballot, Priority::Normal);

		let (central, calls) = ScriptedCentral::new(vec![Err(DeliveryError::Permanent(
			"ballot already applied to another candidate".to_string(),
		))]);
		let (_shutdown, _admin) = spawn_scheduler(&fixture, central);

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| {
					record.state == crate::broker::log::BrokerRecordState::Quarantined
				})
				.unwrap_or(false)
		})
		.await;

		assert_eq!(
			confirmations.recv().await.unwrap().status,
			ConfirmStatus::PermanentError
		);
		assert_eq!(*calls.lock().unwrap(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn quarantined_after_attempt_limit_and_revivable() {
		let mut config = test_config();
		config.quarantine_after = 2;
		let fixture = fixture();
		let ballot = ballot(1);
		enqueue(&fixture, &ballot, Priority::Normal);

		let (central, _calls) = ScriptedCentral::new(vec![
			Err(DeliveryError::Timeout),
			Err(DeliveryError::Timeout),
			Ok(DeliveryAck { status: ConfirmStatus::Processed }),
		]);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (admin_tx, admin_rx) = mpsc::unbounded_channel();
		let (complete_tx, _complete_rx) = mpsc::channel(1);
		let scheduler = RetryScheduler::new(
			config,
			fixture.queue.clone(),
			fixture.log.clone(),
			fixture.breaker.clone(),
			Arc::new(central),
			fixture.hub.clone(),
		);
		tokio::spawn(scheduler.run(admin_rx, shutdown_rx, complete_tx));

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| {
					record.state == crate::broker::log::BrokerRecordState::Quarantined
				})
				.unwrap_or(false)
		})
		.await;

		// Operator revival: force retry succeeds against the now-healthy
		// central.
		let (reply_tx, reply_rx) = oneshot::channel();
		admin_tx
			.send(AdminCommand::ForceRetry { ballot_id: ballot.ballot_id, reply: reply_tx })
			.unwrap();
		assert!(reply_rx.await.unwrap());

		let log = fixture.log.clone();
		wait_until(move || {
			log.get(ballot.ballot_id)
				.map(|record| record.state == crate::broker::log::BrokerRecordState::Sent)
				.unwrap_or(false)
		})
		.await;

		drop(shutdown_tx);
	}

	#[tokio::test(start_paused = true)]
	async fn recovery_requeues_pending_records() {
		let fixture = fixture();
		let first = ballot(1);
		let second = ballot(2);
		fixture.log.record(&first, Priority::Normal).unwrap();
		fixture.log.record(&second, Priority::Normal).unwrap();
		fixture.log.mark_sent(second.ballot_id).unwrap();

		let recovered = recover_into_queue(&fixture.log, &fixture.queue).unwrap();
		assert_eq!(recovered, 1);
		assert!(fixture.queue.contains(first.ballot_id));
		assert_eq!(fixture.log.get(first.ballot_id).unwrap().priority, Priority::High);
	}
}
