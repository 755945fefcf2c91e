//! RPC surfaces of the three Voteflow tiers.
//!
//! All inter-tier traffic is jsonrpsee over WebSocket: synchronous
//! request/response for ballot offers, server-streamed subscriptions for
//! confirmations flowing back towards the stations. There are no live
//! callback references across the wire; every message is correlated by
//! ballot id.

pub mod error;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};

use vf_primitives::{
	Ballot, BallotId, BallotState, CandidateId, ConfirmStatus, Priority, StationId, VoterId,
};

pub use jsonrpsee::core::RpcResult;

/// A ballot offered to the next hop. Station identity is always
/// sender-supplied; receivers never infer it from the connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotOffer {
	pub ballot_id: BallotId,
	pub candidate_id: CandidateId,
	pub station_id: StationId,
	pub timestamp: DateTime<Utc>,
	pub integrity_hash: String,
}

impl From<Ballot> for BallotOffer {
	fn from(ballot: Ballot) -> Self {
		Self {
			ballot_id: ballot.ballot_id,
			candidate_id: ballot.candidate_id,
			station_id: ballot.station_id,
			timestamp: ballot.timestamp,
			integrity_hash: hex::encode(&ballot.integrity_hash),
		}
	}
}

impl BallotOffer {
	pub fn into_ballot(self) -> Result<Ballot, vf_primitives::InvalidId> {
		let integrity_hash = hex::decode(&self.integrity_hash).map_err(|_| {
			vf_primitives::InvalidId { kind: "integrity hash", value: self.integrity_hash.clone() }
		})?;
		Ok(Ballot {
			ballot_id: self.ballot_id,
			candidate_id: self.candidate_id,
			station_id: self.station_id,
			timestamp: self.timestamp,
			integrity_hash,
		})
	}
}

/// Answer to a ballot offer. `Duplicate` is a success: the ballot is
/// already durably accepted downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
	pub status: ConfirmStatus,
}

/// A confirmation streamed back towards the sender, keyed by ballot id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
	pub ballot_id: BallotId,
	pub status: ConfirmStatus,
}

/// Summary of an outbox entry, as reported by the station admin surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntrySummary {
	pub ballot_id: BallotId,
	pub candidate_id: CandidateId,
	pub state: BallotState,
	pub attempts: u32,
	pub timestamp: DateTime<Utc>,
}

/// Summary of a pending broker record, as reported by the admin surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecordSummary {
	pub ballot_id: BallotId,
	pub state: String,
	pub priority: Priority,
	pub attempts: u32,
	pub arrival_time: DateTime<Utc>,
	pub last_error: Option<String>,
}

/// Public surface of a polling station, consumed by the console UI
/// collaborator. Returning a ballot id implies the ballot is durably
/// recorded in the outbox; delivery is asynchronous from there.
#[rpc(server, client, namespace = "station")]
pub trait StationApi {
	#[method(name = "cast")]
	async fn cast(&self, candidate_id: CandidateId, voter_id: VoterId) -> RpcResult<BallotId>;

	#[method(name = "probe")]
	async fn probe(&self) -> RpcResult<()>;
}

#[rpc(server, client, namespace = "station_admin")]
pub trait StationAdminApi {
	#[method(name = "dump_unconfirmed")]
	async fn dump_unconfirmed(&self) -> RpcResult<Vec<OutboxEntrySummary>>;
}

/// Broker surface, consumed by station senders.
#[rpc(server, client, namespace = "broker")]
pub trait BrokerApi {
	/// Offer a ballot for forwarding. `Received` means the broker has it
	/// durably; terminal confirmation arrives on the subscription.
	#[method(name = "transmit_ballot")]
	async fn transmit_ballot(&self, offer: BallotOffer) -> RpcResult<DeliveryAck>;

	#[method(name = "probe")]
	async fn probe(&self) -> RpcResult<()>;

	/// Stream of terminal confirmations for ballots originating at the
	/// given station.
	#[subscription(name = "subscribe_confirmations", item = Confirmation)]
	async fn subscribe_confirmations(&self, station_id: StationId);
}

#[rpc(server, client, namespace = "broker_admin")]
pub trait BrokerAdminApi {
	/// Trigger an immediate scheduler pass; returns the number of records
	/// dispatched.
	#[method(name = "drain_queue")]
	async fn drain_queue(&self) -> RpcResult<u32>;

	#[method(name = "reset_breaker")]
	async fn reset_breaker(&self, destination: String) -> RpcResult<()>;

	/// Revive a quarantined ballot for another round of delivery attempts.
	#[method(name = "force_retry")]
	async fn force_retry(&self, ballot_id: BallotId) -> RpcResult<()>;

	#[method(name = "dump_pending")]
	async fn dump_pending(&self) -> RpcResult<Vec<PendingRecordSummary>>;
}

/// Central intake surface, consumed by the broker's retry scheduler. The
/// ack status to `receive_ballot` is itself the confirmation: `Processed`
/// and `Duplicate` are terminal.
#[rpc(server, client, namespace = "central")]
pub trait CentralApi {
	#[method(name = "receive_ballot")]
	async fn receive_ballot(&self, offer: BallotOffer) -> RpcResult<DeliveryAck>;

	#[method(name = "probe")]
	async fn probe(&self) -> RpcResult<()>;
}

#[rpc(server, client, namespace = "central_admin")]
pub trait CentralAdminApi {
	#[method(name = "snapshot")]
	async fn snapshot(&self) -> RpcResult<BTreeMap<CandidateId, u64>>;
}
