//! Wire error codes and the mappings between typed pipeline errors and
//! jsonrpsee error objects.
//!
//! `Duplicate` is deliberately absent: it is never an error on the wire,
//! it is a success `DeliveryAck`.

use jsonrpsee::types::{ErrorObject, ErrorObjectOwned};

use vf_primitives::{CastError, DeliveryError};

pub const VALIDATION: i32 = -32010;
pub const PERSISTENCE: i32 = -32011;
pub const QUEUE_FULL: i32 = -32012;
pub const CIRCUIT_OPEN: i32 = -32013;
pub const NOT_ON_ROLL: i32 = -32014;
pub const ALREADY_VOTED: i32 = -32015;
pub const PROTOCOL_VIOLATION: i32 = -32016;

pub fn validation(message: impl Into<String>) -> ErrorObjectOwned {
	ErrorObject::owned(VALIDATION, message.into(), None::<()>)
}

pub fn persistence(message: impl Into<String>) -> ErrorObjectOwned {
	ErrorObject::owned(PERSISTENCE, message.into(), None::<()>)
}

pub fn queue_full() -> ErrorObjectOwned {
	ErrorObject::owned(QUEUE_FULL, "broker queue is at capacity", None::<()>)
}

pub fn circuit_open() -> ErrorObjectOwned {
	ErrorObject::owned(CIRCUIT_OPEN, "destination circuit is open; queued for retry", None::<()>)
}

pub fn protocol_violation(message: impl Into<String>) -> ErrorObjectOwned {
	ErrorObject::owned(PROTOCOL_VIOLATION, message.into(), None::<()>)
}

pub fn from_cast_error(error: CastError) -> ErrorObjectOwned {
	match &error {
		CastError::NotOnRoll => ErrorObject::owned(NOT_ON_ROLL, error.to_string(), None::<()>),
		CastError::AlreadyVoted => ErrorObject::owned(ALREADY_VOTED, error.to_string(), None::<()>),
		CastError::Validation(_) => validation(error.to_string()),
		CastError::Persistence(_) => persistence(error.to_string()),
	}
}

/// Client-side mapping of an RPC failure into the pipeline's delivery
/// error taxonomy, so retry policy is decided in one place.
pub fn to_delivery_error(error: jsonrpsee::core::client::Error) -> DeliveryError {
	use jsonrpsee::core::client::Error as ClientError;
	match error {
		ClientError::Call(object) => match object.code() {
			QUEUE_FULL => DeliveryError::QueueFull,
			CIRCUIT_OPEN => DeliveryError::CircuitOpen,
			PERSISTENCE => DeliveryError::Persistence(object.message().to_string()),
			VALIDATION | PROTOCOL_VIOLATION =>
				DeliveryError::Permanent(object.message().to_string()),
			_ => DeliveryError::Transport(object.message().to_string()),
		},
		ClientError::RequestTimeout => DeliveryError::Timeout,
		other => DeliveryError::Transport(other.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cast_errors_map_to_stable_codes() {
		assert_eq!(from_cast_error(CastError::NotOnRoll).code(), NOT_ON_ROLL);
		assert_eq!(from_cast_error(CastError::AlreadyVoted).code(), ALREADY_VOTED);
		assert_eq!(from_cast_error(CastError::Validation("x".into())).code(), VALIDATION);
		assert_eq!(from_cast_error(CastError::Persistence("x".into())).code(), PERSISTENCE);
	}

	#[test]
	fn call_errors_map_to_delivery_errors() {
		assert_eq!(
			to_delivery_error(jsonrpsee::core::client::Error::Call(queue_full())),
			DeliveryError::QueueFull
		);
		assert_eq!(
			to_delivery_error(jsonrpsee::core::client::Error::Call(circuit_open())),
			DeliveryError::CircuitOpen
		);
		assert_eq!(
			to_delivery_error(jsonrpsee::core::client::Error::RequestTimeout),
			DeliveryError::Timeout
		);
		assert!(matches!(
			to_delivery_error(jsonrpsee::core::client::Error::Call(validation("bad"))),
			DeliveryError::Permanent(_)
		));
	}
}
