//! Structured concurrency for daemon tasks.
//!
//! A scope owns every task spawned on it. The first task to fail cancels
//! the whole scope and its error is returned from [`task_scope`]; a panic
//! in any task resurfaces on the scope's caller. When the top-level future
//! finishes, tasks still running are cancelled.

use std::{
	marker::PhantomData,
	sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, stream::FuturesUnordered, Future, StreamExt};
use tokio::{
	sync::mpsc,
	task::{AbortHandle, JoinHandle},
};

pub struct Scope<'env, Error: Send + 'static> {
	spawner: mpsc::UnboundedSender<JoinHandle<Result<(), Error>>>,
	/// Invariant over 'env, mirroring the borrow the top-level closure has.
	_phantom: PhantomData<&'env mut &'env ()>,
}

impl<Error: Send + 'static> Scope<'_, Error> {
	pub fn spawn(&self, task: impl Future<Output = Result<(), Error>> + Send + 'static) {
		// The receiver only drops once the scope is exiting, at which point
		// the handle is aborted by the exit guard anyway.
		let _result = self.spawner.send(tokio::spawn(task));
	}
}

/// Runs `top_level_task` with a [`Scope`] to spawn background tasks onto.
///
/// ```ignore
/// task_scope(|scope| async move {
///     scope.spawn(some_worker());
///     main_loop().await
/// }.boxed()).await
/// ```
pub async fn task_scope<'env, T, Error, C>(top_level_task: C) -> Result<T, Error>
where
	Error: Send + 'static,
	C: for<'scope> FnOnce(&'scope Scope<'env, Error>) -> BoxFuture<'scope, Result<T, Error>>,
{
	let (spawner, mut handle_receiver) = mpsc::unbounded_channel();
	let scope = Scope { spawner, _phantom: PhantomData };

	let abort_handles: Arc<Mutex<Vec<AbortHandle>>> = Default::default();
	// Cancel everything still running on any exit path, including drop of
	// the scope future itself.
	let _abort_guard = scopeguard::guard(abort_handles.clone(), |handles| {
		for handle in handles.lock().expect("abort handle lock poisoned").drain(..) {
			handle.abort();
		}
	});

	let mut running = FuturesUnordered::new();
	let top_level = top_level_task(&scope);
	futures::pin_mut!(top_level);

	loop {
		tokio::select! {
			result = &mut top_level => {
				// Tasks spawned but not yet registered must still be
				// cancelled by the exit guard.
				while let Ok(handle) = handle_receiver.try_recv() {
					abort_handles
						.lock()
						.expect("abort handle lock poisoned")
						.push(handle.abort_handle());
				}
				return result
			},
			Some(handle) = handle_receiver.recv() => {
				abort_handles.lock().expect("abort handle lock poisoned").push(handle.abort_handle());
				running.push(handle);
			},
			Some(join_result) = running.next() => {
				match join_result {
					Ok(Ok(())) => {},
					Ok(Err(error)) => {
						while let Ok(handle) = handle_receiver.try_recv() {
							abort_handles
								.lock()
								.expect("abort handle lock poisoned")
								.push(handle.abort_handle());
						}
						return Err(error)
					},
					Err(join_error) => {
						if join_error.is_panic() {
							std::panic::resume_unwind(join_error.into_panic());
						}
						// Cancelled tasks only occur during scope teardown.
					},
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::FutureExt;
	use std::time::Duration;

	#[tokio::test]
	async fn top_level_result_is_returned() {
		let result: Result<u32, anyhow::Error> =
			task_scope(|_scope| async move { Ok(42) }.boxed()).await;
		assert_eq!(result.unwrap(), 42);
	}

	#[tokio::test]
	async fn task_error_cancels_scope() {
		let result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async { Err(anyhow::anyhow!("worker failed")) });
				futures::future::pending().await
			}
			.boxed()
		})
		.await;
		assert_eq!(result.unwrap_err().to_string(), "worker failed");
	}

	#[tokio::test]
	#[should_panic(expected = "worker panicked")]
	async fn task_panic_propagates() {
		let _result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async { panic!("worker panicked") });
				futures::future::pending().await
			}
			.boxed()
		})
		.await;
	}

	#[tokio::test]
	async fn background_tasks_are_cancelled_on_exit() {
		let (sender, mut receiver) = mpsc::unbounded_channel::<()>();
		let result: Result<(), anyhow::Error> = task_scope(|scope| {
			async move {
				scope.spawn(async move {
					// Held, never sent on: drops only when the task is cancelled.
					let _sender = sender;
					futures::future::pending().await
				});
				tokio::time::sleep(Duration::from_millis(10)).await;
				Ok(())
			}
			.boxed()
		})
		.await;
		assert!(result.is_ok());
		// Channel closes once the spawned task is aborted.
		assert_eq!(receiver.recv().await, None);
	}
}
