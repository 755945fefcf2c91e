//! Bounded in-memory priority queue of pending deliveries.
//!
//! The queue is only ever a view over the durable pending log: the log is
//! written before an id enters the heap, and capacity overflow is a
//! refusal surfaced to the caller, never a drop. The retry scheduler is
//! the sole consumer.

use std::{
	cmp::Ordering,
	collections::{BinaryHeap, HashSet},
	sync::Mutex,
};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use vf_primitives::{BallotId, DeliveryError, Priority};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedDelivery {
	pub ballot_id: BallotId,
	pub priority: Priority,
	pub arrival_time: DateTime<Utc>,
}

/// Max-heap order: priority first, then FIFO by arrival within a
/// priority, ballot id as the final tie-break for a total order.
impl Ord for QueuedDelivery {
	fn cmp(&self, other: &Self) -> Ordering {
		self.priority
			.cmp(&other.priority)
			.then_with(|| other.arrival_time.cmp(&self.arrival_time))
			.then_with(|| other.ballot_id.cmp(&self.ballot_id))
	}
}

impl PartialOrd for QueuedDelivery {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Default)]
struct QueueState {
	heap: BinaryHeap<QueuedDelivery>,
	members: HashSet<BallotId>,
}

pub struct BrokerQueue {
	state: Mutex<QueueState>,
	capacity: usize,
	enqueued: Notify,
}

impl BrokerQueue {
	pub fn new(capacity: usize) -> Self {
		Self { state: Mutex::new(QueueState::default()), capacity, enqueued: Notify::new() }
	}

	/// Inserts a delivery, journaling it first via `record`: the durable
	/// log and the heap must never disagree on membership, so the log
	/// write happens under the queue lock, before the insert. Re-offering
	/// an id already queued is a no-op success (`record` still runs so the
	/// journal can refresh priority and attempt fields).
	pub fn enqueue_with(
		&self,
		delivery: QueuedDelivery,
		record: impl FnOnce() -> Result<(), DeliveryError>,
	) -> Result<(), DeliveryError> {
		let mut state = self.state.lock().expect("queue lock poisoned");
		if state.members.contains(&delivery.ballot_id) {
			record()?;
			return Ok(())
		}
		if state.heap.len() >= self.capacity {
			return Err(DeliveryError::QueueFull)
		}
		record()?;
		state.members.insert(delivery.ballot_id);
		state.heap.push(delivery);
		drop(state);
		self.enqueued.notify_one();
		Ok(())
	}

	/// Re-inserts a delivery the scheduler took out but could not complete.
	/// Bypasses the capacity check: the record is already durable and
	/// refusing it here would amount to a drop.
	pub fn requeue(&self, delivery: QueuedDelivery) {
		let mut state = self.state.lock().expect("queue lock poisoned");
		if state.members.insert(delivery.ballot_id) {
			state.heap.push(delivery);
		}
	}

	/// Removes and returns every queued delivery the predicate accepts, in
	/// strict (priority, arrival) order. Rejected deliveries stay queued.
	pub fn take_where(&self, is_due: impl Fn(&QueuedDelivery) -> bool) -> Vec<QueuedDelivery> {
		let mut state = self.state.lock().expect("queue lock poisoned");
		let mut due = Vec::new();
		let mut kept = Vec::new();
		while let Some(delivery) = state.heap.pop() {
			if is_due(&delivery) {
				state.members.remove(&delivery.ballot_id);
				due.push(delivery);
			} else {
				kept.push(delivery);
			}
		}
		for delivery in kept {
			state.heap.push(delivery);
		}
		due
	}

	pub fn contains(&self, ballot_id: BallotId) -> bool {
		self.state.lock().expect("queue lock poisoned").members.contains(&ballot_id)
	}

	pub fn len(&self) -> usize {
		self.state.lock().expect("queue lock poisoned").heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Resolves on the next enqueue after the call.
	pub async fn notified(&self) {
		self.enqueued.notified().await
	}
}
