//! Idempotent central intake: the last hop of the pipeline.
//!
//! Every accepted ballot is journaled RECEIVED before it reaches the
//! tally, and journaled PROCESSED before the confirmation goes out, so a
//! crash at any point between the two is healed by startup replay. The
//! processed set answering the dedup check is a projection of the journal,
//! maintained under the journal's single-writer lock.

use std::{path::Path, sync::Arc, sync::Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use vf_primitives::{
	Ballot, BallotId, CandidateId, ConfirmStatus, ProtocolViolation, StationId, StoreError,
};

use crate::{
	central::tally::Tally,
	store::{
		encode_timestamp, parse_timestamp, split_fields, AppendLog, AuditLog, LogRecord,
		FIELD_SEPARATOR,
	},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivedState {
	Received,
	Processed,
}

impl std::fmt::Display for ReceivedState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Self::Received => "RECEIVED",
			Self::Processed => "PROCESSED",
		})
	}
}

impl std::str::FromStr for ReceivedState {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"RECEIVED" => Ok(Self::Received),
			"PROCESSED" => Ok(Self::Processed),
			other => Err(format!("bad received state {other:?}")),
		}
	}
}

/// `ballot-id | candidate-id | station-id | iso-timestamp | state`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedRecord {
	pub ballot_id: BallotId,
	pub candidate_id: CandidateId,
	pub station_id: StationId,
	pub timestamp: DateTime<Utc>,
	pub state: ReceivedState,
}

impl LogRecord for ReceivedRecord {
	fn encode(&self) -> String {
		[
			self.ballot_id.to_string(),
			self.candidate_id.to_string(),
			self.station_id.to_string(),
			encode_timestamp(self.timestamp),
			self.state.to_string(),
		]
		.join(FIELD_SEPARATOR)
	}

	fn decode(line: &str) -> Result<Self, String> {
		let fields = split_fields(line);
		let [ballot_id, candidate_id, station_id, timestamp, state] = fields.as_slice() else {
			return Err(format!("expected 5 received fields, got {}", fields.len()))
		};
		Ok(Self {
			ballot_id: ballot_id.parse().map_err(|error| format!("{error}"))?,
			candidate_id: candidate_id.parse().map_err(|error| format!("{error}"))?,
			station_id: station_id.parse().map_err(|error| format!("{error}"))?,
			timestamp: parse_timestamp(timestamp)?,
			state: state.parse()?,
		})
	}
}

#[derive(Debug, Error)]
pub enum IntakeError {
	#[error("durable intake write failed: {0}")]
	Persistence(#[from] StoreError),
	#[error(transparent)]
	Violation(#[from] ProtocolViolation),
	#[error("invalid ballot: {0}")]
	Validation(String),
	#[error("tally committer unavailable")]
	CommitterGone,
}

pub struct CommitRequest {
	pub candidate_id: CandidateId,
	pub ballot_id: BallotId,
	pub seq: u64,
	pub reply: oneshot::Sender<Result<bool, ProtocolViolation>>,
}

/// Sequential committer: the tally's single writer, draining intake
/// requests in arrival order.
pub async fn run_committer(
	tally: Arc<Tally>,
	mut requests: mpsc::UnboundedReceiver<CommitRequest>,
) -> anyhow::Result<()> {
	while let Some(request) = requests.recv().await {
		let result = tally.apply(&request.candidate_id, request.ballot_id, request.seq);
		let _result = request.reply.send(result);
	}
	Ok(())
}

struct IntakeState {
	processed: std::collections::HashSet<BallotId>,
	next_seq: u64,
}

pub struct CentralIntake {
	log: AppendLog<ReceivedRecord>,
	audit: AuditLog,
	state: Mutex<IntakeState>,
	committer_tx: mpsc::UnboundedSender<CommitRequest>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
	pub replayed: usize,
	pub completed: usize,
	pub violations: usize,
}

impl CentralIntake {
	/// Opens the received log and replays it against the tally: records at
	/// or before the checkpoint cursor only rebuild the in-memory views,
	/// records past it are re-applied, and any RECEIVED entry without its
	/// PROCESSED marker is completed now.
	pub fn open(
		data_dir: &Path,
		tally: &Tally,
		committer_tx: mpsc::UnboundedSender<CommitRequest>,
	) -> Result<(Self, ReplayStats), StoreError> {
		let (log, journal) = AppendLog::<ReceivedRecord>::open(data_dir.join("received.log"))?;
		let audit = AuditLog::open(data_dir.join("audit.log"))?;

		let mut processed = std::collections::HashSet::new();
		let mut received: Vec<(u64, ReceivedRecord)> = Vec::new();
		let mut next_seq = 1u64;
		for record in journal {
			match record.state {
				ReceivedState::Received => {
					received.push((next_seq, record));
					next_seq += 1;
				},
				ReceivedState::Processed => {
					processed.insert(record.ballot_id);
				},
			}
		}

		let cursor = tally.last_applied_seq();
		let mut stats = ReplayStats::default();
		for (seq, record) in &received {
			if *seq <= cursor {
				tally.mark_replayed(&record.candidate_id, record.ballot_id);
				continue
			}
			match tally.apply(&record.candidate_id, record.ballot_id, *seq) {
				Ok(_applied) => {
					stats.replayed += 1;
					if !processed.contains(&record.ballot_id) {
						log.append(&ReceivedRecord {
							state: ReceivedState::Processed,
							..record.clone()
						})?;
						processed.insert(record.ballot_id);
						audit.write("replay", Some(record.ballot_id), "completed after restart");
						stats.completed += 1;
					}
				},
				Err(violation) => {
					// Refused, never overwritten; left unprocessed so it
					// stays visible on every restart.
					tracing::error!("Replay refused: {violation}");
					audit.write("protocol-violation", Some(record.ballot_id), violation.to_string());
					stats.violations += 1;
				},
			}
		}
		tally.checkpoint()?;

		Ok((
			Self {
				log,
				audit,
				state: Mutex::new(IntakeState { processed, next_seq }),
				committer_tx,
			},
			stats,
		))
	}

	/// Idempotent ingestion. `Duplicate` is the primary idempotence signal
	/// and a success; `Processed` is returned only after the ballot is
	/// durably journaled, counted, and durably marked processed.
	pub async fn receive(&self, ballot: Ballot) -> Result<ConfirmStatus, IntakeError> {
		if !ballot.verify_integrity() {
			return Err(IntakeError::Validation(format!(
				"integrity hash mismatch for ballot {}",
				ballot.ballot_id
			)))
		}

		let record = ReceivedRecord {
			ballot_id: ballot.ballot_id,
			candidate_id: ballot.candidate_id.clone(),
			station_id: ballot.station_id.clone(),
			timestamp: ballot.timestamp,
			state: ReceivedState::Received,
		};

		let seq = {
			let mut state = self.state.lock().expect("intake lock poisoned");
			if state.processed.contains(&ballot.ballot_id) {
				self.audit.write("duplicate", Some(ballot.ballot_id), "already processed");
				return Ok(ConfirmStatus::Duplicate)
			}
			let seq = state.next_seq;
			// Journal before the tally sees it: an error here aborts the
			// operation and the ballot stays pending at the broker.
			self.log.append(&record)?;
			state.next_seq += 1;
			seq
		};

		let (reply, receiver) = oneshot::channel();
		self.committer_tx
			.send(CommitRequest {
				candidate_id: ballot.candidate_id.clone(),
				ballot_id: ballot.ballot_id,
				seq,
				reply,
			})
			.map_err(|_| IntakeError::CommitterGone)?;
		receiver.await.map_err(|_| IntakeError::CommitterGone)??;

		{
			let mut state = self.state.lock().expect("intake lock poisoned");
			if !state.processed.contains(&ballot.ballot_id) {
				self.log
					.append(&ReceivedRecord { state: ReceivedState::Processed, ..record })?;
				state.processed.insert(ballot.ballot_id);
			}
		}
		self.audit.write("processed", Some(ballot.ballot_id), format!("candidate {}", ballot.candidate_id));
		Ok(ConfirmStatus::Processed)
	}

	pub fn processed_count(&self) -> usize {
		self.state.lock().expect("intake lock poisoned").processed.len()
	}
}
