//! Per-destination circuit breaker gating the broker's outbound sends.
//!
//! CLOSED counts consecutive failures up to the threshold, OPEN refuses
//! everything until the probe window elapses, HALF_OPEN admits exactly one
//! probe at a time and closes again after enough consecutive successes.
//! Transitions are reported on a channel the owner drains into the audit
//! log.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::{sync::mpsc, time::Instant};

#[derive(Clone, Debug)]
pub struct BreakerConfig {
	/// Consecutive failures in CLOSED that trip the breaker (F).
	pub failure_threshold: u32,
	/// Time in OPEN before a probe is allowed (T).
	pub open_timeout: Duration,
	/// Consecutive probe successes that close the breaker again (S).
	pub success_threshold: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl std::fmt::Display for CircuitState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Self::Closed => "CLOSED",
			Self::Open => "OPEN",
			Self::HalfOpen => "HALF_OPEN",
		};
		f.write_str(s)
	}
}

/// What a caller holding a ballot to send is allowed to do right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
	Available,
	/// The single permitted HALF_OPEN probe; the caller owns its outcome.
	Probe,
	Open,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerTransition {
	pub destination: String,
	pub from: CircuitState,
	pub to: CircuitState,
	pub detail: String,
}

struct DestinationState {
	state: CircuitState,
	consecutive_failures: u32,
	consecutive_successes: u32,
	opened_at: Option<Instant>,
	probe_in_flight: bool,
}

impl Default for DestinationState {
	fn default() -> Self {
		Self {
			state: CircuitState::Closed,
			consecutive_failures: 0,
			consecutive_successes: 0,
			opened_at: None,
			probe_in_flight: false,
		}
	}
}

pub struct CircuitBreaker {
	config: BreakerConfig,
	destinations: Mutex<HashMap<String, DestinationState>>,
	transitions: mpsc::UnboundedSender<BreakerTransition>,
}

impl CircuitBreaker {
	pub fn new(config: BreakerConfig) -> (Self, mpsc::UnboundedReceiver<BreakerTransition>) {
		let (transitions, transition_receiver) = mpsc::unbounded_channel();
		(
			Self { config, destinations: Mutex::new(HashMap::new()), transitions },
			transition_receiver,
		)
	}

	/// Must be consulted before every send. In OPEN, callers must not
	/// attempt; `Probe` is handed to exactly one caller per OPEN →
	/// HALF_OPEN window (and per in-flight probe thereafter).
	pub fn check(&self, destination: &str) -> Availability {
		let mut destinations = self.destinations.lock().expect("breaker lock poisoned");
		let entry = destinations.entry(destination.to_string()).or_default();
		match entry.state {
			CircuitState::Closed => Availability::Available,
			CircuitState::Open => {
				let elapsed = entry
					.opened_at
					.map(|opened_at| opened_at.elapsed())
					.unwrap_or(Duration::MAX);
				if elapsed >= self.config.open_timeout {
					let from = entry.state;
					entry.state = CircuitState::HalfOpen;
					entry.consecutive_successes = 0;
					entry.probe_in_flight = true;
					self.report(destination, from, entry.state, "probe window elapsed");
					Availability::Probe
				} else {
					Availability::Open
				}
			},
			CircuitState::HalfOpen =>
				if entry.probe_in_flight {
					Availability::Open
				} else {
					entry.probe_in_flight = true;
					Availability::Probe
				},
		}
	}

	pub fn is_open(&self, destination: &str) -> bool {
		!matches!(self.check(destination), Availability::Available | Availability::Probe)
	}

	pub fn on_success(&self, destination: &str) {
		let mut destinations = self.destinations.lock().expect("breaker lock poisoned");
		let entry = destinations.entry(destination.to_string()).or_default();
		match entry.state {
			CircuitState::Closed => {
				entry.consecutive_failures = 0;
			},
			CircuitState::HalfOpen => {
				entry.probe_in_flight = false;
				entry.consecutive_successes += 1;
				if entry.consecutive_successes >= self.config.success_threshold {
					let from = entry.state;
					*entry = DestinationState::default();
					self.report(destination, from, CircuitState::Closed, "probe successes reached threshold");
				}
			},
			// No sends are attempted in OPEN; a straggler result from
			// before the trip changes nothing.
			CircuitState::Open => {},
		}
	}

	pub fn on_failure(&self, destination: &str) {
		let mut destinations = self.destinations.lock().expect("breaker lock poisoned");
		let entry = destinations.entry(destination.to_string()).or_default();
		match entry.state {
			CircuitState::Closed => {
				entry.consecutive_failures += 1;
				if entry.consecutive_failures >= self.config.failure_threshold {
					let from = entry.state;
					entry.state = CircuitState::Open;
					entry.opened_at = Some(Instant::now());
					self.report(
						destination,
						from,
						entry.state,
						&format!("{} consecutive failures", entry.consecutive_failures),
					);
				}
			},
			CircuitState::HalfOpen => {
				let from = entry.state;
				entry.state = CircuitState::Open;
				entry.opened_at = Some(Instant::now());
				entry.probe_in_flight = false;
				entry.consecutive_successes = 0;
				self.report(destination, from, entry.state, "probe failed");
			},
			CircuitState::Open => {},
		}
	}

	/// Operator reset to a fresh CLOSED state.
	pub fn reset(&self, destination: &str) {
		let mut destinations = self.destinations.lock().expect("breaker lock poisoned");
		let entry = destinations.entry(destination.to_string()).or_default();
		let from = entry.state;
		*entry = DestinationState::default();
		self.report(destination, from, CircuitState::Closed, "reset by operator");
	}

	pub fn state(&self, destination: &str) -> CircuitState {
		self.destinations
			.lock()
			.expect("breaker lock poisoned")
			.get(destination)
			.map(|entry| entry.state)
			.unwrap_or(CircuitState::Closed)
	}

	fn report(&self, destination: &str, from: CircuitState, to: CircuitState, detail: &str) {
		let _result = self.transitions.send(BreakerTransition {
			destination: destination.to_string(),
			from,
			to,
			detail: detail.to_string(),
		});
	}
}
