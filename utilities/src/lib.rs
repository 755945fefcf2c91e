pub mod health;
pub mod logging;
pub mod task_scope;

use std::pin::Pin;

use futures::{
	task::{Context, Poll},
	Future, Stream,
};

/// Extension for consumer loops over streams that are logically unending,
/// such as a `FuturesUnordered` of in-flight submissions: instead of
/// yielding `None` when currently empty, the returned future pends until an
/// item arrives.
pub trait UnendingStream: Stream + Unpin {
	fn next_or_pending(&mut self) -> NextOrPending<'_, Self> {
		NextOrPending { stream: self }
	}
}

impl<S: Stream + Unpin> UnendingStream for S {}

pub struct NextOrPending<'a, S: ?Sized> {
	stream: &'a mut S,
}

impl<S: Stream + Unpin + ?Sized> Future for NextOrPending<'_, S> {
	type Output = S::Item;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut *self.stream).poll_next(cx) {
			Poll::Ready(Some(item)) => Poll::Ready(item),
			Poll::Ready(None) | Poll::Pending => Poll::Pending,
		}
	}
}
