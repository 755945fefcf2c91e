//! Typed errors shared across the pipeline tiers.

use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BallotId, CandidateId};

/// An identifier failed validation on construction or parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} identifier: {value:?}")]
pub struct InvalidId {
	pub kind: &'static str,
	pub value: String,
}

impl InvalidId {
	pub fn ballot_id(value: &str) -> Self {
		Self { kind: "ballot", value: value.to_string() }
	}
}

/// Outcome of a refused cast attempt. Exactly one of these (or a ballot id)
/// is ever shown to the station UI per attempt; there is no "maybe".
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CastError {
	#[error("voter is not on the eligibility roll")]
	NotOnRoll,
	#[error("voter has already cast a ballot")]
	AlreadyVoted,
	#[error("invalid cast request: {0}")]
	Validation(String),
	/// The ballot could not be durably recorded. The station must refuse
	/// the vote: accepting it would break the at-most-one-per-voter and
	/// store-and-forward invariants.
	#[error("ballot could not be durably recorded: {0}")]
	Persistence(String),
}

/// Failures on the forwarding path between tiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
	#[error("transport failure: {0}")]
	Transport(String),
	#[error("request deadline expired")]
	Timeout,
	/// The circuit to the destination is open; the ballot stays durably
	/// pending and will be retried.
	#[error("circuit open for destination")]
	CircuitOpen,
	#[error("broker queue is at capacity")]
	QueueFull,
	#[error("durable write failed: {0}")]
	Persistence(String),
	#[error("permanently refused: {0}")]
	Permanent(String),
}

impl DeliveryError {
	/// Transport-class failures are recovered locally with backoff under
	/// breaker control; the rest surface upward.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Transport(_) | Self::Timeout | Self::CircuitOpen | Self::QueueFull)
	}
}

/// Failures of the durable append-log layer.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("failed to open log at {path}: {source}")]
	Open { path: PathBuf, source: io::Error },
	#[error("log io error: {0}")]
	Io(#[from] io::Error),
	#[error("malformed record at {path}:{line}: {reason}")]
	Corrupt { path: PathBuf, line: usize, reason: String },
}

/// The same ballot id was presented for two different candidates. Logged
/// and refused; an accepted tally entry is never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ballot {ballot_id} already applied to candidate {applied}; refusing apply for {requested}")]
pub struct ProtocolViolation {
	pub ballot_id: BallotId,
	pub applied: CandidateId,
	pub requested: CandidateId,
}
