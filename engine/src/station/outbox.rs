//! Durable station outbox: the journal every cast ballot enters before a
//! ballot id is ever shown to a voter.
//!
//! The file is an append-only journal of entry snapshots; the latest
//! snapshot per ballot wins on replay, with forward-only state transitions
//! enforced. Nothing is deleted until offline compaction, and compaction
//! only drops CONFIRMED entries (store-and-forward: an entry survives
//! until the next layer downstream has confirmed it).

use std::{
	collections::{HashMap, HashSet},
	path::Path,
	sync::Mutex,
};

use chrono::{DateTime, Utc};

use vf_primitives::{BallotId, BallotState, CandidateId, StoreError, VoterId};

use crate::store::{
	encode_timestamp, parse_timestamp, split_fields, AppendLog, AuditLog, LogRecord,
	FIELD_SEPARATOR,
};

/// `ballot-id | candidate-id | voter-id | iso-timestamp | state | attempts`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
	pub ballot_id: BallotId,
	pub candidate_id: CandidateId,
	pub voter_id: VoterId,
	pub timestamp: DateTime<Utc>,
	pub state: BallotState,
	pub attempts: u32,
}

impl LogRecord for OutboxEntry {
	fn encode(&self) -> String {
		[
			self.ballot_id.to_string(),
			self.candidate_id.to_string(),
			self.voter_id.to_string(),
			encode_timestamp(self.timestamp),
			self.state.to_string(),
			self.attempts.to_string(),
		]
		.join(FIELD_SEPARATOR)
	}

	fn decode(line: &str) -> Result<Self, String> {
		let fields = split_fields(line);
		let [ballot_id, candidate_id, voter_id, timestamp, state, attempts] = fields.as_slice()
		else {
			return Err(format!("expected 6 outbox fields, got {}", fields.len()))
		};
		Ok(Self {
			ballot_id: ballot_id.parse().map_err(|error| format!("{error}"))?,
			candidate_id: candidate_id.parse().map_err(|error| format!("{error}"))?,
			voter_id: voter_id.parse().map_err(|error| format!("{error}"))?,
			timestamp: parse_timestamp(timestamp)?,
			state: state.parse().map_err(|error| format!("{error}"))?,
			attempts: attempts.parse().map_err(|error| format!("{error}"))?,
		})
	}
}

pub struct StationOutbox {
	log: AppendLog<OutboxEntry>,
	audit: AuditLog,
	index: Mutex<HashMap<BallotId, OutboxEntry>>,
}

impl StationOutbox {
	pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
		let (log, journal) = AppendLog::<OutboxEntry>::open(data_dir.join("outbox.log"))?;
		let audit = AuditLog::open(data_dir.join("audit.log"))?;

		let mut index: HashMap<BallotId, OutboxEntry> = HashMap::new();
		for entry in journal {
			match index.get(&entry.ballot_id) {
				None => {
					index.insert(entry.ballot_id, entry);
				},
				Some(existing) => {
					if existing.state == entry.state ||
						existing.state.can_transition_to(entry.state)
					{
						index.insert(entry.ballot_id, entry);
					} else {
						return Err(StoreError::Corrupt {
							path: log.path().to_path_buf(),
							line: 0,
							reason: format!(
								"illegal journal transition {} -> {} for ballot {}",
								existing.state, entry.state, entry.ballot_id
							),
						})
					}
				},
			}
		}

		Ok(Self { log, audit, index: Mutex::new(index) })
	}

	/// Appends a fresh PENDING entry. Returns only after the entry is
	/// fsynced; on error the vote must be refused (the station never
	/// accepts a ballot it could not durably record).
	pub fn append(&self, entry: OutboxEntry) -> Result<(), StoreError> {
		debug_assert_eq!(entry.state, BallotState::Pending);
		let mut index = self.index.lock().expect("outbox lock poisoned");
		self.log.append(&entry)?;
		self.audit.write("cast", Some(entry.ballot_id), format!("voter {}", entry.voter_id));
		index.insert(entry.ballot_id, entry);
		Ok(())
	}

	pub fn mark_sent(&self, ballot_id: BallotId) -> Result<(), StoreError> {
		self.transition(ballot_id, BallotState::Sent, "sent")
	}

	pub fn mark_confirmed(&self, ballot_id: BallotId) -> Result<(), StoreError> {
		self.transition(ballot_id, BallotState::Confirmed, "confirmed")
	}

	pub fn mark_rejected(&self, ballot_id: BallotId) -> Result<(), StoreError> {
		self.transition(ballot_id, BallotState::Rejected, "rejected")
	}

	fn transition(
		&self,
		ballot_id: BallotId,
		next: BallotState,
		op: &str,
	) -> Result<(), StoreError> {
		let mut index = self.index.lock().expect("outbox lock poisoned");
		let Some(entry) = index.get(&ballot_id) else {
			tracing::warn!("Outbox {op} for unknown ballot {ballot_id}");
			return Ok(())
		};
		// Late or repeated confirmations are the normal case; forward-only
		// means they are simply ignored.
		if entry.state == next || !entry.state.can_transition_to(next) {
			return Ok(())
		}
		let updated = OutboxEntry { state: next, ..entry.clone() };
		self.log.append(&updated)?;
		self.audit.write(op, Some(ballot_id), format!("state {next}"));
		index.insert(ballot_id, updated);
		Ok(())
	}

	/// Bumps and journals the attempt counter so backoff progression
	/// survives restarts. Returns the new count.
	pub fn increment_attempts(&self, ballot_id: BallotId) -> Result<u32, StoreError> {
		let mut index = self.index.lock().expect("outbox lock poisoned");
		let Some(entry) = index.get(&ballot_id) else { return Ok(0) };
		let updated = OutboxEntry { attempts: entry.attempts + 1, ..entry.clone() };
		let attempts = updated.attempts;
		self.log.append(&updated)?;
		index.insert(ballot_id, updated);
		Ok(attempts)
	}

	/// All entries not yet confirmed (PENDING and SENT), oldest first.
	pub fn scan_unconfirmed(&self) -> Vec<OutboxEntry> {
		let index = self.index.lock().expect("outbox lock poisoned");
		let mut entries: Vec<_> = index
			.values()
			.filter(|entry| matches!(entry.state, BallotState::Pending | BallotState::Sent))
			.cloned()
			.collect();
		entries.sort_by_key(|entry| entry.timestamp);
		entries
	}

	pub fn get(&self, ballot_id: BallotId) -> Option<OutboxEntry> {
		self.index.lock().expect("outbox lock poisoned").get(&ballot_id).cloned()
	}

	pub fn entries(&self) -> Vec<OutboxEntry> {
		let index = self.index.lock().expect("outbox lock poisoned");
		let mut entries: Vec<_> = index.values().cloned().collect();
		entries.sort_by_key(|entry| entry.timestamp);
		entries
	}

	/// Offline compaction: collapses the journal to the latest snapshot per
	/// ballot. No ballot is ever dropped, whatever its state: the
	/// already-voted view is rebuilt from this file and must cover the full
	/// history.
	pub fn compact(&self) -> Result<(), StoreError> {
		let index = self.index.lock().expect("outbox lock poisoned");
		self.log.compact(|record| {
			index.get(&record.ballot_id).is_some_and(|latest| latest == record)
		})
	}

	/// Voters with an entry contributing to "already voted": anything the
	/// station durably accepted, whatever its delivery progress.
	pub fn voted_voters(&self) -> HashSet<VoterId> {
		self.index
			.lock()
			.expect("outbox lock poisoned")
			.values()
			.filter(|entry| {
				matches!(
					entry.state,
					BallotState::Pending | BallotState::Sent | BallotState::Confirmed
				)
			})
			.map(|entry| entry.voter_id.clone())
			.collect()
	}
}
