//! jsonrpsee plumbing shared by the tiers: server startup, lazy
//! reconnecting clients, and subscription piping.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use futures::{Stream, StreamExt};
use jsonrpsee::{
	core::{client::Subscription, server::Methods},
	server::{ServerBuilder, ServerHandle, SubscriptionMessage},
	ws_client::{WsClient, WsClientBuilder},
	PendingSubscriptionSink,
};
use serde::Serialize;
use tokio::net::ToSocketAddrs;

use vf_primitives::{DeliveryError, StationId};
use vf_rpc_apis::{
	error::to_delivery_error, BallotOffer, BrokerApiClient, CentralApiClient, Confirmation,
	DeliveryAck,
};

/// Builds and starts a WebSocket server for the given methods. Returns the
/// bound address (so callers can bind port 0) and a handle for stopping.
pub async fn start_server(
	addr: impl ToSocketAddrs,
	methods: impl Into<Methods>,
) -> anyhow::Result<(SocketAddr, ServerHandle)> {
	let server = ServerBuilder::default()
		.build(addr)
		.await
		.context("Could not bind RPC listener")?;
	let addr = server.local_addr().context("No local address for RPC listener")?;
	Ok((addr, server.start(methods)))
}

/// Forwards a stream into a subscription sink until either side closes.
pub async fn pipe_from_stream<S, T>(pending: PendingSubscriptionSink, mut stream: S)
where
	S: Stream<Item = T> + Unpin + Send,
	T: Serialize + Send,
{
	let Ok(sink) = pending.accept().await else { return };

	loop {
		tokio::select! {
			_ = sink.closed() => break,
			maybe_item = stream.next() => {
				let Some(item) = maybe_item else { break };
				let message = match SubscriptionMessage::from_json(&item) {
					Ok(message) => message,
					Err(error) => {
						tracing::error!("Could not serialize subscription item: {error}");
						break
					},
				};
				if sink.send(message).await.is_err() {
					break
				}
			},
		}
	}
}

/// Shutdown choreography for a tier: stop accepting work, then give the
/// worker loops a bounded grace period to drain in-flight work and flush
/// durable writes.
pub struct GracefulShutdown {
	pub signal: tokio::sync::watch::Sender<bool>,
	/// Closes once every worker holding the paired sender has exited.
	pub complete: tokio::sync::mpsc::Receiver<()>,
	pub servers: Vec<ServerHandle>,
}

impl GracefulShutdown {
	pub async fn shutdown(mut self, grace: Duration) {
		let _result = self.signal.send(true);
		for server in &self.servers {
			let _result = server.stop();
		}
		if tokio::time::timeout(grace, self.complete.recv()).await.is_err() {
			tracing::warn!("Workers did not drain within {}ms", grace.as_millis());
		}
		for server in &self.servers {
			server.clone().stopped().await;
		}
	}
}

/// A lazily connected WebSocket client that is re-established after
/// transport failures. Call-level errors leave the connection alone.
pub struct RpcConnection {
	url: String,
	request_timeout: Duration,
	client: tokio::sync::Mutex<Option<Arc<WsClient>>>,
}

impl RpcConnection {
	pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
		Self { url: url.into(), request_timeout, client: tokio::sync::Mutex::new(None) }
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	async fn client(&self) -> Result<Arc<WsClient>, DeliveryError> {
		let mut guard = self.client.lock().await;
		if let Some(client) = guard.as_ref() {
			if client.is_connected() {
				return Ok(client.clone())
			}
			*guard = None;
		}
		let client = WsClientBuilder::default()
			.request_timeout(self.request_timeout)
			.build(&self.url)
			.await
			.map_err(|error| DeliveryError::Transport(error.to_string()))?;
		let client = Arc::new(client);
		*guard = Some(client.clone());
		Ok(client)
	}

	async fn invalidate(&self) {
		*self.client.lock().await = None;
	}

	async fn call<T, F, Fut>(&self, call: F) -> Result<T, DeliveryError>
	where
		F: FnOnce(Arc<WsClient>) -> Fut,
		Fut: std::future::Future<Output = Result<T, jsonrpsee::core::client::Error>>,
	{
		let client = self.client().await?;
		match call(client).await {
			Ok(value) => Ok(value),
			Err(error) => {
				// Anything that is not a call-level error means the
				// connection can no longer be trusted.
				if !matches!(error, jsonrpsee::core::client::Error::Call(_)) {
					self.invalidate().await;
				}
				Err(to_delivery_error(error))
			},
		}
	}
}

/// Station-side handle to the broker.
pub struct BrokerConnection {
	connection: RpcConnection,
}

impl BrokerConnection {
	pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
		Self { connection: RpcConnection::new(url, request_timeout) }
	}

	pub async fn transmit(&self, offer: BallotOffer) -> Result<DeliveryAck, DeliveryError> {
		self.connection.call(|client| async move { client.transmit_ballot(offer).await }).await
	}

	pub async fn subscribe_confirmations(
		&self,
		station_id: StationId,
	) -> Result<Subscription<Confirmation>, DeliveryError> {
		self.connection
			.call(|client| async move { client.subscribe_confirmations(station_id).await })
			.await
	}
}

/// Broker-side handle to central intake, behind the trait the scheduler is
/// tested against.
pub struct CentralConnection {
	connection: RpcConnection,
}

impl CentralConnection {
	pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
		Self { connection: RpcConnection::new(url, request_timeout) }
	}
}

#[async_trait::async_trait]
impl crate::broker::scheduler::CentralClient for CentralConnection {
	async fn receive_ballot(&self, offer: BallotOffer) -> Result<DeliveryAck, DeliveryError> {
		self.connection.call(|client| async move { client.receive_ballot(offer).await }).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use jsonrpsee::{core::async_trait, proc_macros::rpc};

	#[rpc(server, client, namespace = "echo")]
	pub trait EchoApi {
		#[method(name = "echo")]
		async fn echo(&self, value: u32) -> jsonrpsee::core::RpcResult<u32>;
	}

	struct EchoServer;

	#[async_trait]
	impl EchoApiServer for EchoServer {
		async fn echo(&self, value: u32) -> jsonrpsee::core::RpcResult<u32> {
			Ok(value)
		}
	}

	#[tokio::test]
	async fn connection_recovers_after_server_restart() {
		let (addr, handle) = start_server("127.0.0.1:0", EchoServer.into_rpc()).await.unwrap();
		let connection =
			RpcConnection::new(format!("ws://{addr}"), Duration::from_millis(500));

		assert_eq!(
			connection.call(|client| async move { client.echo(1).await }).await.unwrap(),
			1
		);

		handle.stop().unwrap();
		handle.stopped().await;
		assert!(connection
			.call(|client| async move { client.echo(2).await })
			.await
			.is_err());

		// Same port, fresh server: the next call reconnects.
		let (_addr, _handle) = start_server(addr, EchoServer.into_rpc()).await.unwrap();
		assert_eq!(
			connection.call(|client| async move { client.echo(3).await }).await.unwrap(),
			3
		);
	}
}
