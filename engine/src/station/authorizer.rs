//! Eligibility gate for the cast path: one vote per voter, ever.
//!
//! The roll is immutable after startup. The "already voted" view is a
//! projection of the durable outbox journal, rebuilt on restart and then
//! maintained under this lock; it is never the source of truth. If the
//! outbox cannot be scanned the station refuses to open for voting.

use std::{
	collections::HashSet,
	fs,
	path::Path,
	sync::Mutex,
};

use anyhow::Context;

use vf_primitives::VoterId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizeOutcome {
	Authorized,
	NotOnRoll,
	AlreadyVoted,
}

#[derive(Default)]
struct AuthorizerState {
	/// Voters with a durable outbox entry in PENDING, SENT or CONFIRMED.
	voted: HashSet<VoterId>,
	/// Voters whose cast is in flight between authorize and the durable
	/// append. At most one cast per voter can hold a reservation.
	reserved: HashSet<VoterId>,
}

pub struct RollAuthorizer {
	roll: HashSet<VoterId>,
	state: Mutex<AuthorizerState>,
}

impl RollAuthorizer {
	pub fn new(roll: HashSet<VoterId>, already_voted: HashSet<VoterId>) -> Self {
		Self {
			roll,
			state: Mutex::new(AuthorizerState { voted: already_voted, reserved: HashSet::new() }),
		}
	}

	/// Serializable per voter: of any number of concurrent calls for the
	/// same voter, at most one observes `Authorized`. The winner holds a
	/// reservation that must be resolved with [`Self::mark_cast`] or
	/// [`Self::abort_cast`].
	pub fn authorize(&self, voter_id: &VoterId) -> AuthorizeOutcome {
		if !self.roll.contains(voter_id) {
			return AuthorizeOutcome::NotOnRoll
		}
		let mut state = self.state.lock().expect("authorizer lock poisoned");
		if state.voted.contains(voter_id) || state.reserved.contains(voter_id) {
			AuthorizeOutcome::AlreadyVoted
		} else {
			state.reserved.insert(voter_id.clone());
			AuthorizeOutcome::Authorized
		}
	}

	/// Called by the outbox path once the entry is durably written; from
	/// here on the voter is "voted" across restarts via the journal scan.
	pub fn mark_cast(&self, voter_id: &VoterId) {
		let mut state = self.state.lock().expect("authorizer lock poisoned");
		state.reserved.remove(voter_id);
		state.voted.insert(voter_id.clone());
	}

	/// Releases a reservation after a failed durable write. The voter may
	/// try again.
	pub fn abort_cast(&self, voter_id: &VoterId) {
		let mut state = self.state.lock().expect("authorizer lock poisoned");
		state.reserved.remove(voter_id);
	}
}

/// Loads the eligibility roll: one voter id per line, blank lines and
/// `#` comments ignored.
pub fn load_roll(path: &Path) -> anyhow::Result<HashSet<VoterId>> {
	let contents = fs::read_to_string(path)
		.with_context(|| format!("Could not read eligibility roll at {}", path.display()))?;
	contents
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.map(|line| {
			VoterId::new(line).with_context(|| format!("Invalid voter id in roll: {line:?}"))
		})
		.collect()
}
