//! Per-candidate monotonic counters with a durable checkpoint.
//!
//! The received log is the source of truth; the checkpoint file only
//! bounds how much of it replay has to re-apply. Counts never decrease,
//! and a ballot id is counted for exactly one candidate, ever.

use std::{
	collections::{BTreeMap, HashMap},
	fs,
	fs::File,
	io::Write,
	path::PathBuf,
	sync::Mutex,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use vf_primitives::{BallotId, CandidateId, ProtocolViolation, StoreError};

#[derive(Clone, Debug)]
pub struct TallyConfig {
	/// Checkpoint at least every this many applies...
	pub checkpoint_every: u32,
	/// ...or after this long, whichever comes first.
	pub checkpoint_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
	pub count: u64,
	/// Kept so crash replay of the received-log tail is idempotent at the
	/// checkpoint boundary.
	pub last_ballot_id: Option<BallotId>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
	/// Sequence number (received-log ordinal) of the last record folded
	/// into these counts.
	last_applied_seq: u64,
	entries: BTreeMap<CandidateId, TallyEntry>,
}

struct TallyState {
	entries: BTreeMap<CandidateId, TallyEntry>,
	/// Every ballot id ever counted, and for which candidate. Rebuilt from
	/// the full received log on startup; guards the one-candidate-per-id
	/// protocol rule.
	applied: HashMap<BallotId, CandidateId>,
	last_applied_seq: u64,
	applies_since_checkpoint: u32,
	last_checkpoint: Instant,
}

pub struct Tally {
	path: PathBuf,
	config: TallyConfig,
	state: Mutex<TallyState>,
}

impl Tally {
	pub fn load(path: impl Into<PathBuf>, config: TallyConfig) -> Result<Self, StoreError> {
		let path = path.into();
		let (entries, last_applied_seq) = if path.exists() {
			let contents = fs::read_to_string(&path)?;
			let checkpoint: CheckpointFile =
				serde_json::from_str(&contents).map_err(|error| StoreError::Corrupt {
					path: path.clone(),
					line: 0,
					reason: format!("undecodable checkpoint: {error}"),
				})?;
			(checkpoint.entries, checkpoint.last_applied_seq)
		} else {
			(BTreeMap::new(), 0)
		};

		Ok(Self {
			path,
			config,
			state: Mutex::new(TallyState {
				entries,
				applied: HashMap::new(),
				last_applied_seq,
				applies_since_checkpoint: 0,
				last_checkpoint: Instant::now(),
			}),
		})
	}

	/// Counts `ballot_id` for `candidate_id` exactly once. Re-applying is
	/// a no-op (`Ok(false)`); the same id for a different candidate is a
	/// protocol violation, refused without touching the existing entry.
	pub fn apply(
		&self,
		candidate_id: &CandidateId,
		ballot_id: BallotId,
		seq: u64,
	) -> Result<bool, ProtocolViolation> {
		let mut state = self.state.lock().expect("tally lock poisoned");

		if let Some(applied_candidate) = state.applied.get(&ballot_id) {
			return if applied_candidate == candidate_id {
				Ok(false)
			} else {
				Err(ProtocolViolation {
					ballot_id,
					applied: applied_candidate.clone(),
					requested: candidate_id.clone(),
				})
			}
		}

		// Replay straddling the checkpoint boundary: the checkpointed
		// entry already counts this ballot even though the applied map
		// (rebuilt from the pre-cursor scan) has not seen it.
		if state
			.entries
			.get(candidate_id)
			.is_some_and(|entry| entry.last_ballot_id == Some(ballot_id))
		{
			state.applied.insert(ballot_id, candidate_id.clone());
			return Ok(false)
		}

		let entry = state
			.entries
			.entry(candidate_id.clone())
			.or_insert(TallyEntry { count: 0, last_ballot_id: None });
		entry.count += 1;
		entry.last_ballot_id = Some(ballot_id);
		state.applied.insert(ballot_id, candidate_id.clone());
		state.last_applied_seq = state.last_applied_seq.max(seq);
		state.applies_since_checkpoint += 1;

		if state.applies_since_checkpoint >= self.config.checkpoint_every ||
			state.last_checkpoint.elapsed() >= self.config.checkpoint_interval
		{
			// The received log remains the source of truth; a failed
			// checkpoint only lengthens the next replay.
			if let Err(error) = self.write_checkpoint(&mut state) {
				tracing::error!("Tally checkpoint failed: {error}");
			}
		}

		Ok(true)
	}

	/// Registers a ballot counted before the checkpoint cursor, so the
	/// one-candidate-per-id rule covers the full history.
	pub fn mark_replayed(&self, candidate_id: &CandidateId, ballot_id: BallotId) {
		let mut state = self.state.lock().expect("tally lock poisoned");
		state.applied.insert(ballot_id, candidate_id.clone());
	}

	pub fn snapshot(&self) -> BTreeMap<CandidateId, u64> {
		self.state
			.lock()
			.expect("tally lock poisoned")
			.entries
			.iter()
			.map(|(candidate_id, entry)| (candidate_id.clone(), entry.count))
			.collect()
	}

	pub fn entry(&self, candidate_id: &CandidateId) -> Option<TallyEntry> {
		self.state.lock().expect("tally lock poisoned").entries.get(candidate_id).cloned()
	}

	pub fn last_applied_seq(&self) -> u64 {
		self.state.lock().expect("tally lock poisoned").last_applied_seq
	}

	/// Forces a durable checkpoint now (periodic flusher and shutdown).
	pub fn checkpoint(&self) -> Result<(), StoreError> {
		let mut state = self.state.lock().expect("tally lock poisoned");
		self.write_checkpoint(&mut state)
	}

	fn write_checkpoint(&self, state: &mut TallyState) -> Result<(), StoreError> {
		let checkpoint = CheckpointFile {
			last_applied_seq: state.last_applied_seq,
			entries: state.entries.clone(),
		};
		let json = serde_json::to_string_pretty(&checkpoint)
			.expect("checkpoint serialization is infallible");

		if let Some(dir) = self.path.parent() {
			fs::create_dir_all(dir)?;
		}
		let tmp_path = self.path.with_extension("tmp");
		{
			let mut tmp = File::create(&tmp_path)?;
			tmp.write_all(json.as_bytes())?;
			tmp.sync_all()?;
		}
		fs::rename(&tmp_path, &self.path)?;

		state.applies_since_checkpoint = 0;
		state.last_checkpoint = Instant::now();
		Ok(())
	}
}
