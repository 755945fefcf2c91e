//! Station-side sender: turns authorized votes into durable outbox
//! entries and keeps offering unconfirmed ballots to the broker until a
//! terminal confirmation arrives.
//!
//! Send attempts are safe to repeat arbitrarily: idempotence is carried by
//! the ballot id at the broker and at central intake.

use std::{collections::HashMap, sync::{Arc, Mutex}, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use vf_primitives::{
	Ballot, BallotId, BallotState, CandidateId, CastError, ConfirmStatus, DeliveryError,
	StationId, VoterId,
};
use vf_rpc_apis::BallotOffer;

use crate::{
	rpc::BrokerConnection,
	station::{
		authorizer::{AuthorizeOutcome, RollAuthorizer},
		outbox::{OutboxEntry, StationOutbox},
	},
};

#[derive(Clone, Debug)]
pub struct SendLoopConfig {
	/// Cadence of the rescan for unconfirmed entries.
	pub resend_interval: Duration,
	/// Entries younger than this are left to the in-flight first attempt.
	pub resend_delay: Duration,
	pub base_backoff: Duration,
	pub max_backoff: Duration,
}

pub struct StationSender {
	station_id: StationId,
	authorizer: RollAuthorizer,
	outbox: Arc<StationOutbox>,
	cast_tx: mpsc::UnboundedSender<BallotId>,
	last_timestamp: Mutex<DateTime<Utc>>,
}

impl StationSender {
	pub fn new(
		station_id: StationId,
		authorizer: RollAuthorizer,
		outbox: Arc<StationOutbox>,
	) -> (Arc<Self>, mpsc::UnboundedReceiver<BallotId>) {
		let (cast_tx, cast_rx) = mpsc::unbounded_channel();
		(
			Arc::new(Self {
				station_id,
				authorizer,
				outbox,
				cast_tx,
				last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
			}),
			cast_rx,
		)
	}

	/// The single user-visible outcome per cast attempt: a ballot id
	/// (durably queued, delivery asynchronous) or a refusal.
	pub fn cast(&self, candidate_id: CandidateId, voter_id: VoterId) -> Result<BallotId, CastError> {
		match self.authorizer.authorize(&voter_id) {
			AuthorizeOutcome::NotOnRoll => return Err(CastError::NotOnRoll),
			AuthorizeOutcome::AlreadyVoted => return Err(CastError::AlreadyVoted),
			AuthorizeOutcome::Authorized => {},
		}

		let ballot =
			Ballot::new(candidate_id, self.station_id.clone(), self.next_timestamp());
		let ballot_id = ballot.ballot_id;
		let entry = OutboxEntry {
			ballot_id,
			candidate_id: ballot.candidate_id,
			voter_id: voter_id.clone(),
			timestamp: ballot.timestamp,
			state: BallotState::Pending,
			attempts: 0,
		};

		match self.outbox.append(entry) {
			Ok(()) => {
				self.authorizer.mark_cast(&voter_id);
				// The loop also rescans, so a dropped notification only
				// delays the first attempt.
				let _result = self.cast_tx.send(ballot_id);
				tracing::info!("Ballot {ballot_id} accepted and queued");
				Ok(ballot_id)
			},
			Err(error) => {
				self.authorizer.abort_cast(&voter_id);
				tracing::error!("Refusing vote, outbox append failed: {error}");
				Err(CastError::Persistence(error.to_string()))
			},
		}
	}

	/// Within one station, ballot timestamps strictly increase, so ballot
	/// order and timestamp order agree.
	fn next_timestamp(&self) -> DateTime<Utc> {
		let mut last = self.last_timestamp.lock().expect("timestamp lock poisoned");
		let now = Utc::now();
		let timestamp = if now > *last {
			now
		} else {
			*last + chrono::Duration::microseconds(1)
		};
		*last = timestamp;
		timestamp
	}

	pub fn outbox(&self) -> &Arc<StationOutbox> {
		&self.outbox
	}
}

fn backoff_delay(config: &SendLoopConfig, attempts: u32) -> Duration {
	std::cmp::min(
		config.max_backoff,
		config.base_backoff.saturating_mul(2u32.saturating_pow(attempts.min(16))),
	)
}

/// Drives delivery of outbox entries to the broker. Exits cleanly on
/// shutdown with no send half-done: an in-flight offer is awaited and
/// journaled (SENT or left PENDING) before the loop returns.
pub async fn run_send_loop(
	outbox: Arc<StationOutbox>,
	broker: Arc<BrokerConnection>,
	station_id: StationId,
	config: SendLoopConfig,
	mut cast_rx: mpsc::UnboundedReceiver<BallotId>,
	mut shutdown: watch::Receiver<bool>,
	_shutdown_complete: mpsc::Sender<()>,
) -> anyhow::Result<()> {
	let mut backoff_until: HashMap<BallotId, tokio::time::Instant> = HashMap::new();
	let mut interval = tokio::time::interval(config.resend_interval);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			Some(ballot_id) = cast_rx.recv() => {
				send_one(&outbox, &broker, &station_id, &config, &mut backoff_until, ballot_id)
					.await;
			},
			_ = interval.tick() => {
				let now = Utc::now();
				let due: Vec<BallotId> = outbox
					.scan_unconfirmed()
					.into_iter()
					.filter(|entry| {
						now.signed_duration_since(entry.timestamp).to_std().unwrap_or_default() >=
							config.resend_delay
					})
					.map(|entry| entry.ballot_id)
					.collect();
				for ballot_id in due {
					if *shutdown.borrow() {
						break
					}
					send_one(&outbox, &broker, &station_id, &config, &mut backoff_until, ballot_id)
					.await;
				}
			},
		}
	}

	tracing::info!("Send loop drained, shutting down");
	Ok(())
}

async fn send_one(
	outbox: &StationOutbox,
	broker: &BrokerConnection,
	station_id: &StationId,
	config: &SendLoopConfig,
	backoff_until: &mut HashMap<BallotId, tokio::time::Instant>,
	ballot_id: BallotId,
) {
	if backoff_until
		.get(&ballot_id)
		.is_some_and(|until| *until > tokio::time::Instant::now())
	{
		return
	}

	let Some(entry) = outbox.get(ballot_id) else { return };
	if !matches!(entry.state, BallotState::Pending | BallotState::Sent) {
		backoff_until.remove(&ballot_id);
		return
	}

	// The outbox entry keeps the voter id but not the station id, which
	// is process-wide and re-injected here.
	let ballot = Ballot::from_parts(
		entry.ballot_id,
		entry.candidate_id.clone(),
		station_id.clone(),
		entry.timestamp,
	);

	match broker.transmit(BallotOffer::from(ballot)).await {
		Ok(ack) => {
			backoff_until.remove(&ballot_id);
			match ack.status {
				ConfirmStatus::Received => {
					if let Err(error) = outbox.mark_sent(ballot_id) {
						tracing::error!("Could not journal SENT for {ballot_id}: {error}");
					}
				},
				// The broker already holds a central confirmation for this id.
				ConfirmStatus::Processed | ConfirmStatus::Duplicate => {
					if let Err(error) = outbox.mark_confirmed(ballot_id) {
						tracing::error!("Could not journal CONFIRMED for {ballot_id}: {error}");
					}
				},
				ConfirmStatus::TransientError | ConfirmStatus::PermanentError => {
					tracing::warn!("Unexpected ack status {} for {ballot_id}", ack.status);
				},
			}
		},
		Err(DeliveryError::Permanent(reason)) => {
			tracing::error!("Ballot {ballot_id} permanently refused by broker: {reason}");
			backoff_until.remove(&ballot_id);
			if let Err(error) = outbox.mark_rejected(ballot_id) {
				tracing::error!("Could not journal REJECTED for {ballot_id}: {error}");
			}
		},
		Err(error) => {
			let attempts = outbox.increment_attempts(ballot_id).unwrap_or(0);
			let delay = backoff_delay(config, attempts);
			tracing::warn!(
				"Offer of {ballot_id} failed (attempt {attempts}): {error}; retrying in {}ms",
				delay.as_millis()
			);
			backoff_until.insert(ballot_id, tokio::time::Instant::now() + delay);
		},
	}
}

/// Consumes the broker's confirmation stream and collapses outbox state
/// forward. Reconnects with a flat delay; missed confirmations are
/// recovered by the resend path (the broker answers `Duplicate`).
pub async fn run_confirmation_loop(
	outbox: Arc<StationOutbox>,
	broker: Arc<BrokerConnection>,
	station_id: StationId,
	reconnect_delay: Duration,
	mut shutdown: watch::Receiver<bool>,
	_shutdown_complete: mpsc::Sender<()>,
) -> anyhow::Result<()> {
	loop {
		let mut subscription = tokio::select! {
			_ = shutdown.changed() => break,
			result = broker.subscribe_confirmations(station_id.clone()) => match result {
				Ok(subscription) => subscription,
				Err(error) => {
					tracing::warn!("Confirmation subscription failed: {error}");
					tokio::select! {
						_ = shutdown.changed() => break,
						_ = tokio::time::sleep(reconnect_delay) => continue,
					}
				},
			},
		};

		loop {
			tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				message = subscription.next() => match message {
					Some(Ok(confirmation)) => {
						apply_confirmation(&outbox, confirmation.ballot_id, confirmation.status);
					},
					Some(Err(error)) => {
						tracing::warn!("Undecodable confirmation: {error}");
					},
					None => break,
				},
			}
		}
	}
	Ok(())
}

fn apply_confirmation(outbox: &StationOutbox, ballot_id: BallotId, status: ConfirmStatus) {
	let result = match status {
		ConfirmStatus::Processed | ConfirmStatus::Duplicate => outbox.mark_confirmed(ballot_id),
		ConfirmStatus::PermanentError => outbox.mark_rejected(ballot_id),
		// RECEIVED is informational; transient errors leave the entry for
		// the broker's retry path.
		ConfirmStatus::Received | ConfirmStatus::TransientError => Ok(()),
	};
	if let Err(error) = result {
		tracing::error!("Could not journal confirmation {status} for {ballot_id}: {error}");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn sender(dir: &std::path::Path, roll: &[&str]) -> Arc<StationSender> {
		let outbox = Arc::new(StationOutbox::open(dir).unwrap());
		let roll: HashSet<VoterId> = roll.iter().map(|id| VoterId::new(*id).unwrap()).collect();
		let authorizer = RollAuthorizer::new(roll, outbox.voted_voters());
		let (sender, _cast_rx) =
			StationSender::new(StationId::new("M01").unwrap(), authorizer, outbox);
		sender
	}

	fn candidate(id: &str) -> CandidateId {
		CandidateId::new(id).unwrap()
	}

	fn voter(id: &str) -> VoterId {
		VoterId::new(id).unwrap()
	}

	#[test]
	fn cast_returns_id_only_after_durable_append() {
		let dir = tempfile::tempdir().unwrap();
		let sender = sender(dir.path(), &["1000000001"]);

		let ballot_id = sender.cast(candidate("3"), voter("1000000001")).unwrap();

		let entry = sender.outbox().get(ballot_id).unwrap();
		assert_eq!(entry.state, BallotState::Pending);
		assert_eq!(entry.voter_id, voter("1000000001"));

		// And it is on disk, not just in memory.
		let reopened = StationOutbox::open(dir.path()).unwrap();
		assert_eq!(reopened.get(ballot_id).unwrap().state, BallotState::Pending);
	}

	#[test]
	fn second_cast_by_the_same_voter_is_refused() {
		let dir = tempfile::tempdir().unwrap();
		let sender = sender(dir.path(), &["1000000001"]);

		sender.cast(candidate("3"), voter("1000000001")).unwrap();
		assert_eq!(
			sender.cast(candidate("4"), voter("1000000001")),
			Err(CastError::AlreadyVoted)
		);
		assert_eq!(sender.outbox().entries().len(), 1);
	}

	#[test]
	fn unknown_voter_is_refused_without_a_ballot() {
		let dir = tempfile::tempdir().unwrap();
		let sender = sender(dir.path(), &["1000000001"]);

		assert_eq!(sender.cast(candidate("3"), voter("42")), Err(CastError::NotOnRoll));
		assert!(sender.outbox().entries().is_empty());
	}

	#[test]
	fn timestamps_are_strictly_monotonic() {
		let dir = tempfile::tempdir().unwrap();
		let sender = sender(dir.path(), &[]);

		let mut previous = sender.next_timestamp();
		for _ in 0..1000 {
			let next = sender.next_timestamp();
			assert!(next > previous);
			previous = next;
		}
	}

	#[test]
	fn backoff_grows_and_caps() {
		let config = SendLoopConfig {
			resend_interval: Duration::from_millis(100),
			resend_delay: Duration::from_millis(100),
			base_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(60),
		};
		assert_eq!(backoff_delay(&config, 0), Duration::from_millis(500));
		assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
		assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
		assert_eq!(backoff_delay(&config, 30), Duration::from_secs(60));
	}

	#[test]
	fn terminal_confirmations_collapse_the_entry() {
		let dir = tempfile::tempdir().unwrap();
		let sender = sender(dir.path(), &["1000000001", "1000000002"]);

		let confirmed = sender.cast(candidate("3"), voter("1000000001")).unwrap();
		let rejected = sender.cast(candidate("3"), voter("1000000002")).unwrap();

		apply_confirmation(sender.outbox(), confirmed, ConfirmStatus::Duplicate);
		apply_confirmation(sender.outbox(), rejected, ConfirmStatus::PermanentError);
		// Transient errors change nothing.
		apply_confirmation(sender.outbox(), rejected, ConfirmStatus::TransientError);

		assert_eq!(
			sender.outbox().get(confirmed).unwrap().state,
			BallotState::Confirmed
		);
		assert_eq!(sender.outbox().get(rejected).unwrap().state, BallotState::Rejected);
	}
}
