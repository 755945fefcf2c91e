//! Durable broker log: the append-only journal backing the in-memory
//! queue, plus the broker's audit trail.
//!
//! A record enters the journal before its id is ever queued, moves to SENT
//! only after central acknowledges, and is never deleted before that
//! (store-and-forward). Priority and the attempt counter are journaled so
//! a restart resumes the same backoff stage; quarantine is a journaled
//! state an operator can revive.

use std::{
	collections::HashMap,
	path::Path,
	sync::Mutex,
};

use chrono::{DateTime, Utc};

use vf_primitives::{Ballot, BallotId, Priority, StationId, StoreError};

use crate::store::{
	encode_timestamp, parse_timestamp, split_fields, AppendLog, AuditLog, LogRecord,
	FIELD_SEPARATOR,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerRecordState {
	Pending,
	Sent,
	Quarantined,
}

impl BrokerRecordState {
	fn can_transition_to(self, next: Self) -> bool {
		use BrokerRecordState::*;
		matches!(
			(self, next),
			(Pending, Sent) | (Pending, Quarantined) | (Quarantined, Pending) |
				(Quarantined, Sent)
		)
	}
}

impl std::fmt::Display for BrokerRecordState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::Pending => "PENDING",
			Self::Sent => "SENT",
			Self::Quarantined => "QUARANTINED",
		};
		f.write_str(s)
	}
}

impl std::str::FromStr for BrokerRecordState {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(Self::Pending),
			"SENT" => Ok(Self::Sent),
			"QUARANTINED" => Ok(Self::Quarantined),
			other => Err(format!("bad broker record state {other:?}")),
		}
	}
}

/// `ballot-id | payload-json | arrival-iso | state | priority | attempts`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
	pub ballot_id: BallotId,
	/// Serialized [`Ballot`] exactly as offered (never carries a voter id).
	pub payload: String,
	pub arrival_time: DateTime<Utc>,
	pub state: BrokerRecordState,
	pub priority: Priority,
	pub attempts: u32,
	/// In-memory only; the durable trace of failures is the audit log.
	pub last_error: Option<String>,
}

impl BrokerRecord {
	pub fn ballot(&self) -> Result<Ballot, StoreError> {
		serde_json::from_str(&self.payload).map_err(|error| StoreError::Corrupt {
			path: Default::default(),
			line: 0,
			reason: format!("undecodable payload for {}: {error}", self.ballot_id),
		})
	}

	pub fn station_id(&self) -> Option<StationId> {
		self.ballot().ok().map(|ballot| ballot.station_id)
	}
}

impl LogRecord for BrokerRecord {
	fn encode(&self) -> String {
		[
			self.ballot_id.to_string(),
			self.payload.clone(),
			encode_timestamp(self.arrival_time),
			self.state.to_string(),
			self.priority.to_string(),
			self.attempts.to_string(),
		]
		.join(FIELD_SEPARATOR)
	}

	fn decode(line: &str) -> Result<Self, String> {
		let fields = split_fields(line);
		let [ballot_id, payload, arrival, state, priority, attempts] = fields.as_slice() else {
			return Err(format!("expected 6 broker record fields, got {}", fields.len()))
		};
		Ok(Self {
			ballot_id: ballot_id.parse().map_err(|error| format!("{error}"))?,
			payload: payload.to_string(),
			arrival_time: parse_timestamp(arrival)?,
			state: state.parse()?,
			priority: priority.parse().map_err(|error| format!("{error}"))?,
			attempts: attempts.parse().map_err(|error| format!("{error}"))?,
			last_error: None,
		})
	}
}

pub struct BrokerLog {
	log: AppendLog<BrokerRecord>,
	audit: AuditLog,
	index: Mutex<HashMap<BallotId, BrokerRecord>>,
}

impl BrokerLog {
	pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
		let (log, journal) = AppendLog::<BrokerRecord>::open(data_dir.join("pending.log"))?;
		let audit = AuditLog::open(data_dir.join("audit.log"))?;

		let mut index: HashMap<BallotId, BrokerRecord> = HashMap::new();
		for record in journal {
			match index.get(&record.ballot_id) {
				None => {
					index.insert(record.ballot_id, record);
				},
				Some(existing) => {
					if existing.state == record.state ||
						existing.state.can_transition_to(record.state)
					{
						index.insert(record.ballot_id, record);
					} else {
						return Err(StoreError::Corrupt {
							path: log.path().to_path_buf(),
							line: 0,
							reason: format!(
								"illegal journal transition {} -> {} for ballot {}",
								existing.state, record.state, record.ballot_id
							),
						})
					}
				},
			}
		}

		Ok(Self { log, audit, index: Mutex::new(index) })
	}

	/// Journals a freshly offered ballot. Idempotent by ballot id: a
	/// repeated offer refreshes the priority (upwards only) but never adds
	/// a second record. Returns the sender-visible state of the record.
	pub fn record(&self, ballot: &Ballot, priority: Priority) -> Result<BrokerRecordState, StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		if let Some(existing) = index.get(&ballot.ballot_id) {
			let state = existing.state;
			if state == BrokerRecordState::Pending && priority > existing.priority {
				let updated = BrokerRecord { priority, ..existing.clone() };
				self.log.append(&updated)?;
				index.insert(ballot.ballot_id, updated);
			}
			return Ok(state)
		}

		let record = BrokerRecord {
			ballot_id: ballot.ballot_id,
			payload: serde_json::to_string(ballot).expect("ballot serialization is infallible"),
			arrival_time: Utc::now(),
			state: BrokerRecordState::Pending,
			priority,
			attempts: 0,
			last_error: None,
		};
		self.log.append(&record)?;
		self.audit.write("accept", Some(ballot.ballot_id), format!("priority {priority}"));
		index.insert(ballot.ballot_id, record);
		Ok(BrokerRecordState::Pending)
	}

	pub fn mark_sent(&self, ballot_id: BallotId) -> Result<(), StoreError> {
		self.transition(ballot_id, BrokerRecordState::Sent, "sent", None)
	}

	pub fn mark_quarantined(&self, ballot_id: BallotId, reason: &str) -> Result<(), StoreError> {
		self.transition(
			ballot_id,
			BrokerRecordState::Quarantined,
			"quarantine",
			Some(reason.to_string()),
		)
	}

	/// Operator revival of a quarantined record: back to PENDING at HIGH
	/// priority with the attempt counter reset. Returns false if the
	/// record is unknown or not quarantined.
	pub fn reactivate(&self, ballot_id: BallotId) -> Result<Option<BrokerRecord>, StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		let Some(record) = index.get(&ballot_id) else { return Ok(None) };
		if record.state != BrokerRecordState::Quarantined {
			return Ok(None)
		}
		let revived = BrokerRecord {
			state: BrokerRecordState::Pending,
			priority: Priority::High,
			attempts: 0,
			last_error: None,
			..record.clone()
		};
		self.log.append(&revived)?;
		self.audit.write("force-retry", Some(ballot_id), "revived by operator");
		index.insert(ballot_id, revived.clone());
		Ok(Some(revived))
	}

	fn transition(
		&self,
		ballot_id: BallotId,
		next: BrokerRecordState,
		op: &str,
		last_error: Option<String>,
	) -> Result<(), StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		let Some(record) = index.get(&ballot_id) else {
			tracing::warn!("Broker log {op} for unknown ballot {ballot_id}");
			return Ok(())
		};
		if record.state == next || !record.state.can_transition_to(next) {
			return Ok(())
		}
		let updated = BrokerRecord { state: next, last_error, ..record.clone() };
		self.log.append(&updated)?;
		self.audit.write(op, Some(ballot_id), format!("state {next}"));
		index.insert(ballot_id, updated);
		Ok(())
	}

	/// Bumps and journals the attempt counter; backoff progression
	/// survives restarts.
	pub fn increment_attempts(
		&self,
		ballot_id: BallotId,
		error: &str,
	) -> Result<u32, StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		let Some(record) = index.get(&ballot_id) else { return Ok(0) };
		let updated = BrokerRecord {
			attempts: record.attempts + 1,
			last_error: Some(error.to_string()),
			..record.clone()
		};
		let attempts = updated.attempts;
		self.log.append(&updated)?;
		index.insert(ballot_id, updated);
		Ok(attempts)
	}

	pub fn get(&self, ballot_id: BallotId) -> Option<BrokerRecord> {
		self.index.lock().expect("broker log lock poisoned").get(&ballot_id).cloned()
	}

	/// Every record still awaiting central acknowledgement, in strict
	/// (priority, arrival) order.
	pub fn list_pending(&self) -> Vec<BrokerRecord> {
		let index = self.index.lock().expect("broker log lock poisoned");
		let mut pending: Vec<_> = index
			.values()
			.filter(|record| record.state == BrokerRecordState::Pending)
			.cloned()
			.collect();
		pending.sort_by(|a, b| {
			b.priority.cmp(&a.priority).then_with(|| a.arrival_time.cmp(&b.arrival_time))
		});
		pending
	}

	pub fn dump(&self) -> Vec<BrokerRecord> {
		let mut records: Vec<_> =
			self.index.lock().expect("broker log lock poisoned").values().cloned().collect();
		records.sort_by_key(|record| record.arrival_time);
		records
	}

	/// Crash recovery: every record not yet SENT is journaled back to HIGH
	/// priority and returned for re-enqueueing.
	pub fn recover_pending(&self) -> Result<Vec<BrokerRecord>, StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		let pending_ids: Vec<BallotId> = index
			.values()
			.filter(|record| record.state == BrokerRecordState::Pending)
			.map(|record| record.ballot_id)
			.collect();

		let mut recovered = Vec::new();
		for ballot_id in pending_ids {
			let record = index.get(&ballot_id).expect("id taken from index");
			let boosted = if record.priority < Priority::High {
				let boosted = BrokerRecord { priority: Priority::High, ..record.clone() };
				self.log.append(&boosted)?;
				index.insert(ballot_id, boosted.clone());
				boosted
			} else {
				record.clone()
			};
			self.audit.write("recover", Some(ballot_id), "re-enqueued after restart");
			recovered.push(boosted);
		}
		recovered.sort_by(|a, b| {
			b.priority.cmp(&a.priority).then_with(|| a.arrival_time.cmp(&b.arrival_time))
		});
		Ok(recovered)
	}

	pub fn audit_write(&self, op: &str, ballot_id: Option<BallotId>, detail: impl Into<String>) {
		self.audit.write(op, ballot_id, detail);
	}

	/// Offline compaction after a retention window: SENT records are
	/// purged (central holds them durably and answers `Duplicate` to any
	/// late re-offer) and the survivors collapse to their latest snapshot.
	pub fn compact(&self) -> Result<usize, StoreError> {
		let mut index = self.index.lock().expect("broker log lock poisoned");
		let purged = index
			.values()
			.filter(|record| record.state == BrokerRecordState::Sent)
			.count();
		self.log.compact(|record| {
			index.get(&record.ballot_id).is_some_and(|latest| {
				latest.state != BrokerRecordState::Sent &&
					latest.ballot_id == record.ballot_id &&
					latest.state == record.state &&
					latest.priority == record.priority &&
					latest.attempts == record.attempts
			})
		})?;
		index.retain(|_, record| record.state != BrokerRecordState::Sent);
		self.audit.write("compact", None, format!("{purged} sent records purged"));
		Ok(purged)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use vf_primitives::CandidateId;

	fn ballot(seed: u8) -> Ballot {
		Ballot::from_parts(
			BallotId::from_bytes([seed; 16]),
			CandidateId::new("1").unwrap(),
			StationId::new("M01").unwrap(),
			Utc::now(),
		)
	}

	#[test]
	fn record_line_round_trip() {
		let ballot = ballot(9);
		let record = BrokerRecord {
			ballot_id: ballot.ballot_id,
			payload: serde_json::to_string(&ballot).unwrap(),
			arrival_time: Utc::now(),
			state: BrokerRecordState::Pending,
			priority: Priority::Normal,
			attempts: 3,
			last_error: None,
		};
		let decoded = BrokerRecord::decode(&record.encode()).unwrap();
		assert_eq!(decoded.ballot_id, record.ballot_id);
		assert_eq!(decoded.state, record.state);
		assert_eq!(decoded.priority, record.priority);
		assert_eq!(decoded.attempts, record.attempts);
		assert_eq!(decoded.ballot().unwrap(), ballot);
	}

	#[test]
	fn record_is_idempotent_by_ballot_id() {
		let dir = tempfile::tempdir().unwrap();
		let log = BrokerLog::open(dir.path()).unwrap();

		let ballot = ballot(1);
		assert_eq!(log.record(&ballot, Priority::Normal).unwrap(), BrokerRecordState::Pending);
		assert_eq!(log.record(&ballot, Priority::Normal).unwrap(), BrokerRecordState::Pending);
		assert_eq!(log.list_pending().len(), 1);

		log.mark_sent(ballot.ballot_id).unwrap();
		assert_eq!(log.record(&ballot, Priority::Normal).unwrap(), BrokerRecordState::Sent);
		assert!(log.list_pending().is_empty());
	}

	#[test]
	fn repeated_offer_only_raises_priority() {
		let dir = tempfile::tempdir().unwrap();
		let log = BrokerLog::open(dir.path()).unwrap();

		let ballot = ballot(1);
		log.record(&ballot, Priority::High).unwrap();
		log.record(&ballot, Priority::Low).unwrap();
		assert_eq!(log.get(ballot.ballot_id).unwrap().priority, Priority::High);
		log.record(&ballot, Priority::Critical).unwrap();
		assert_eq!(log.get(ballot.ballot_id).unwrap().priority, Priority::Critical);
	}

	#[test]
	fn recovery_boosts_pending_to_high() {
		let dir = tempfile::tempdir().unwrap();

		let sent = ballot(1);
		let pending = ballot(2);
		{
			let log = BrokerLog::open(dir.path()).unwrap();
			log.record(&sent, Priority::Normal).unwrap();
			log.record(&pending, Priority::Low).unwrap();
			log.mark_sent(sent.ballot_id).unwrap();
		}

		let log = BrokerLog::open(dir.path()).unwrap();
		let recovered = log.recover_pending().unwrap();
		assert_eq!(recovered.len(), 1);
		assert_eq!(recovered[0].ballot_id, pending.ballot_id);
		assert_eq!(recovered[0].priority, Priority::High);
		// The boost is itself journaled.
		drop(log);
		let log = BrokerLog::open(dir.path()).unwrap();
		assert_eq!(log.get(pending.ballot_id).unwrap().priority, Priority::High);
	}

	#[test]
	fn attempts_survive_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let ballot = ballot(1);
		{
			let log = BrokerLog::open(dir.path()).unwrap();
			log.record(&ballot, Priority::Normal).unwrap();
			assert_eq!(log.increment_attempts(ballot.ballot_id, "timeout").unwrap(), 1);
			assert_eq!(log.increment_attempts(ballot.ballot_id, "timeout").unwrap(), 2);
		}
		let log = BrokerLog::open(dir.path()).unwrap();
		assert_eq!(log.get(ballot.ballot_id).unwrap().attempts, 2);
	}

	#[test]
	fn quarantine_and_revival() {
		let dir = tempfile::tempdir().unwrap();
		let log = BrokerLog::open(dir.path()).unwrap();

		let ballot = ballot(1);
		log.record(&ballot, Priority::Normal).unwrap();
		log.increment_attempts(ballot.ballot_id, "refused").unwrap();
		log.mark_quarantined(ballot.ballot_id, "permanently refused").unwrap();
		assert!(log.list_pending().is_empty());

		// A SENT record cannot be revived.
		assert!(log.reactivate(BallotId::from_bytes([9; 16])).unwrap().is_none());

		let revived = log.reactivate(ballot.ballot_id).unwrap().unwrap();
		assert_eq!(revived.state, BrokerRecordState::Pending);
		assert_eq!(revived.priority, Priority::High);
		assert_eq!(revived.attempts, 0);
		assert_eq!(log.list_pending().len(), 1);
	}

	#[test]
	fn sent_is_terminal() {
		let dir = tempfile::tempdir().unwrap();
		let log = BrokerLog::open(dir.path()).unwrap();

		let ballot = ballot(1);
		log.record(&ballot, Priority::Normal).unwrap();
		log.mark_sent(ballot.ballot_id).unwrap();
		log.mark_quarantined(ballot.ballot_id, "late failure").unwrap();
		assert_eq!(log.get(ballot.ballot_id).unwrap().state, BrokerRecordState::Sent);
	}

	#[test]
	fn compaction_purges_sent_and_collapses_the_rest() {
		let dir = tempfile::tempdir().unwrap();

		let sent = ballot(1);
		let pending = ballot(2);
		{
			let log = BrokerLog::open(dir.path()).unwrap();
			log.record(&sent, Priority::Normal).unwrap();
			log.record(&pending, Priority::Normal).unwrap();
			log.mark_sent(sent.ballot_id).unwrap();
			log.increment_attempts(pending.ballot_id, "timeout").unwrap();
			assert_eq!(log.compact().unwrap(), 1);
			assert!(log.get(sent.ballot_id).is_none());
		}

		let log = BrokerLog::open(dir.path()).unwrap();
		assert!(log.get(sent.ballot_id).is_none());
		let survivor = log.get(pending.ballot_id).unwrap();
		assert_eq!(survivor.state, BrokerRecordState::Pending);
		assert_eq!(survivor.attempts, 1);

		// A late re-offer of the purged ballot is simply re-accepted; the
		// idempotence point is central intake.
		assert_eq!(log.record(&sent, Priority::Normal).unwrap(), BrokerRecordState::Pending);
	}

	#[test]
	fn pending_order_is_priority_then_arrival() {
		let dir = tempfile::tempdir().unwrap();
		let log = BrokerLog::open(dir.path()).unwrap();

		let first = ballot(1);
		let second = ballot(2);
		let third = ballot(3);
		log.record(&first, Priority::Normal).unwrap();
		log.record(&second, Priority::Critical).unwrap();
		log.record(&third, Priority::Normal).unwrap();

		let order: Vec<BallotId> =
			log.list_pending().into_iter().map(|record| record.ballot_id).collect();
		assert_eq!(order, vec![second.ballot_id, first.ballot_id, third.ballot_id]);
	}
}
