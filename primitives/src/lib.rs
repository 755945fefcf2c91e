//! Common primitive types used across the Voteflow delivery pipeline.
//!
//! Everything here is shared by at least two tiers. Types that belong to a
//! single tier (outbox entries, broker records, tally entries) live next to
//! the component that owns them.

pub mod error;

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use error::{CastError, DeliveryError, InvalidId, ProtocolViolation, StoreError};

/// Globally unique 128-bit ballot identifier, generated at the casting
/// station. The primary identity for every idempotence decision in the
/// pipeline: never reused, never mutated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BallotId([u8; 16]);

impl BallotId {
	pub fn generate() -> Self {
		Self(rand::random())
	}

	pub fn from_bytes(bytes: [u8; 16]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 16] {
		&self.0
	}
}

impl fmt::Display for BallotId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl fmt::Debug for BallotId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "BallotId({self})")
	}
}

impl FromStr for BallotId {
	type Err = InvalidId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bytes = hex::decode(s).map_err(|_| InvalidId::ballot_id(s))?;
		Ok(Self(<[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| InvalidId::ballot_id(s))?))
	}
}

impl Serialize for BallotId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for BallotId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

macro_rules! string_id {
	($name:ident, $kind:literal) => {
		#[doc = concat!("Opaque non-empty ", $kind, " identifier.")]
		#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);

		impl $name {
			pub fn new(id: impl Into<String>) -> Result<Self, InvalidId> {
				let id = id.into();
				if id.is_empty() || id.contains('|') || id.contains('\n') {
					Err(InvalidId { kind: $kind, value: id })
				} else {
					Ok(Self(id))
				}
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl TryFrom<String> for $name {
			type Error = InvalidId;

			fn try_from(s: String) -> Result<Self, Self::Error> {
				Self::new(s)
			}
		}

		impl From<$name> for String {
			fn from(id: $name) -> String {
				id.0
			}
		}

		impl FromStr for $name {
			type Err = InvalidId;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, concat!(stringify!($name), "({})"), self.0)
			}
		}
	};
}

string_id!(CandidateId, "candidate");
string_id!(StationId, "station");
string_id!(VoterId, "voter");

/// The unit of vote. Immutable once created; `ballot_id` identifies it at
/// every hop. The voter identity is deliberately absent: it never leaves
/// the station.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
	pub ballot_id: BallotId,
	pub candidate_id: CandidateId,
	pub station_id: StationId,
	pub timestamp: DateTime<Utc>,
	/// Opaque integrity octets carried end to end, SHA-256 over the
	/// canonical field encoding.
	#[serde(with = "serde_hex")]
	pub integrity_hash: Vec<u8>,
}

impl Ballot {
	pub fn new(
		candidate_id: CandidateId,
		station_id: StationId,
		timestamp: DateTime<Utc>,
	) -> Self {
		Self::from_parts(BallotId::generate(), candidate_id, station_id, timestamp)
	}

	/// Rebuilds a ballot from its identifying fields, recomputing the
	/// integrity hash. Used when re-offering a journaled ballot after a
	/// restart.
	pub fn from_parts(
		ballot_id: BallotId,
		candidate_id: CandidateId,
		station_id: StationId,
		timestamp: DateTime<Utc>,
	) -> Self {
		let integrity_hash = integrity_hash(&ballot_id, &candidate_id, &station_id, timestamp);
		Self { ballot_id, candidate_id, station_id, timestamp, integrity_hash }
	}

	pub fn verify_integrity(&self) -> bool {
		self.integrity_hash ==
			integrity_hash(&self.ballot_id, &self.candidate_id, &self.station_id, self.timestamp)
	}
}

fn integrity_hash(
	ballot_id: &BallotId,
	candidate_id: &CandidateId,
	station_id: &StationId,
	timestamp: DateTime<Utc>,
) -> Vec<u8> {
	let mut hasher = Sha256::new();
	hasher.update(ballot_id.as_bytes());
	hasher.update(candidate_id.as_str().as_bytes());
	hasher.update(station_id.as_str().as_bytes());
	hasher.update(timestamp.to_rfc3339().as_bytes());
	hasher.finalize().to_vec()
}

mod serde_hex {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&hex::encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		hex::decode(s).map_err(serde::de::Error::custom)
	}
}

/// Per-ballot, per-layer delivery state. Transitions are forward-only: a
/// ballot never moves back to an earlier state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BallotState {
	Pending,
	Sent,
	Confirmed,
	Rejected,
}

impl BallotState {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Confirmed | Self::Rejected)
	}

	/// Confirmations may race broker acceptance, so Pending -> Confirmed is
	/// a legal shortcut; everything else moves strictly rightwards.
	pub fn can_transition_to(self, next: Self) -> bool {
		use BallotState::*;
		matches!(
			(self, next),
			(Pending, Sent) | (Pending, Confirmed) | (Pending, Rejected) |
				(Sent, Confirmed) | (Sent, Rejected)
		)
	}
}

impl fmt::Display for BallotState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Pending => "PENDING",
			Self::Sent => "SENT",
			Self::Confirmed => "CONFIRMED",
			Self::Rejected => "REJECTED",
		};
		f.write_str(s)
	}
}

impl FromStr for BallotState {
	type Err = InvalidId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(Self::Pending),
			"SENT" => Ok(Self::Sent),
			"CONFIRMED" => Ok(Self::Confirmed),
			"REJECTED" => Ok(Self::Rejected),
			other => Err(InvalidId { kind: "ballot state", value: other.to_string() }),
		}
	}
}

/// Delivery priority at the broker. `Ord` ranks `Critical` highest so the
/// queue can be a max-heap over `(priority, arrival)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
	Low,
	Normal,
	High,
	Critical,
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Critical => "CRITICAL",
			Self::High => "HIGH",
			Self::Normal => "NORMAL",
			Self::Low => "LOW",
		};
		f.write_str(s)
	}
}

impl FromStr for Priority {
	type Err = InvalidId;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"CRITICAL" => Ok(Self::Critical),
			"HIGH" => Ok(Self::High),
			"NORMAL" => Ok(Self::Normal),
			"LOW" => Ok(Self::Low),
			other => Err(InvalidId { kind: "priority", value: other.to_string() }),
		}
	}
}

/// Status carried by a confirmation, keyed by ballot id. `Processed` and
/// `Duplicate` are terminal for the sender and treated identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmStatus {
	Received,
	Processed,
	Duplicate,
	TransientError,
	PermanentError,
}

impl ConfirmStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Processed | Self::Duplicate)
	}
}

impl fmt::Display for ConfirmStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Received => "RECEIVED",
			Self::Processed => "PROCESSED",
			Self::Duplicate => "DUPLICATE",
			Self::TransientError => "TRANSIENT_ERROR",
			Self::PermanentError => "PERMANENT_ERROR",
		};
		f.write_str(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ballot_id_hex_round_trip() {
		let id = BallotId::generate();
		assert_eq!(id, id.to_string().parse().unwrap());
		assert_eq!(id.to_string().len(), 32);
	}

	#[test]
	fn ballot_id_rejects_bad_input() {
		assert!("not-hex".parse::<BallotId>().is_err());
		assert!("abcd".parse::<BallotId>().is_err());
	}

	#[test]
	fn string_ids_reject_empty_and_separator() {
		assert!(CandidateId::new("").is_err());
		assert!(VoterId::new("a|b").is_err());
		assert!(StationId::new("M01").is_ok());
	}

	#[test]
	fn ballot_integrity_hash_is_stable() {
		let ballot = Ballot::new(
			CandidateId::new("3").unwrap(),
			StationId::new("M01").unwrap(),
			Utc::now(),
		);
		assert!(ballot.verify_integrity());

		let mut tampered = ballot.clone();
		tampered.candidate_id = CandidateId::new("4").unwrap();
		assert!(!tampered.verify_integrity());
	}

	#[test]
	fn ballot_serde_round_trip() {
		let ballot = Ballot::new(
			CandidateId::new("C7").unwrap(),
			StationId::new("M02").unwrap(),
			Utc::now(),
		);
		let json = serde_json::to_string(&ballot).unwrap();
		assert_eq!(ballot, serde_json::from_str(&json).unwrap());
	}

	#[test]
	fn state_transitions_are_forward_only() {
		use BallotState::*;
		assert!(Pending.can_transition_to(Sent));
		assert!(Pending.can_transition_to(Confirmed));
		assert!(Sent.can_transition_to(Confirmed));
		assert!(!Sent.can_transition_to(Pending));
		assert!(!Confirmed.can_transition_to(Sent));
		assert!(!Confirmed.can_transition_to(Pending));
		assert!(!Rejected.can_transition_to(Confirmed));
	}

	#[test]
	fn priority_orders_critical_first() {
		assert!(Priority::Critical > Priority::High);
		assert!(Priority::High > Priority::Normal);
		assert!(Priority::Normal > Priority::Low);
	}

	#[test]
	fn terminal_statuses() {
		assert!(ConfirmStatus::Processed.is_terminal());
		assert!(ConfirmStatus::Duplicate.is_terminal());
		assert!(!ConfirmStatus::Received.is_terminal());
		assert!(!ConfirmStatus::TransientError.is_terminal());
	}
}
