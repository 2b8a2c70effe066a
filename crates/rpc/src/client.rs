//! Client side call orchestration.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use zrpc_wire::{Value, names};
use zrpc_worker::TaskClass;

use crate::buffered::BufferedChannel;
use crate::channel::{ChannelMultiplexer, EventChannel};
use crate::config::RpcConfig;
use crate::events::Events;
use crate::heartbeat::HeartBeatOnChannel;
use crate::hooks::Context;
use crate::pattern::{Pattern, Reply, ReplyStream};
use crate::transport::Transport;
use crate::{Error, Result};

struct ClientInner {
	mux: ChannelMultiplexer,
	context: Arc<Context>,
	config: RpcConfig,
}

/// Calls remote methods over one socket, usually a dealer.
///
/// Cheap to clone; clones share the socket and its conversations.
#[derive(Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("events", self.inner.mux.events())
			.field("config", &self.inner.config)
			.finish_non_exhaustive()
	}
}

impl Client {
	/// Creates a client over `transport`.
	pub fn new(transport: Arc<dyn Transport>, context: Arc<Context>, config: RpcConfig) -> Self {
		let events = Events::new(transport, Arc::clone(context.ids()));
		Self {
			inner: Arc::new(ClientInner {
				mux: ChannelMultiplexer::new(events, true),
				context,
				config,
			}),
		}
	}

	/// The configuration this client was built with.
	pub fn config(&self) -> &RpcConfig {
		&self.inner.config
	}

	/// Number of calls with an open channel.
	pub fn active_channels(&self) -> usize {
		self.inner.mux.active_channels()
	}

	/// Calls `method` with the configured timeout.
	pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply> {
		self.call_with_timeout(method, args, self.inner.config.timeout()).await
	}

	/// Calls a request/reply method and returns its value.
	pub async fn call_value(&self, method: &str, args: Vec<Value>) -> Result<Value> {
		match self.call(method, args).await? {
			Reply::Value(value) => Ok(value),
			Reply::Stream(_) => Err(Error::Protocol(format!("{method} answered with a stream"))),
		}
	}

	/// Calls a streaming method and returns its items.
	pub async fn call_stream(&self, method: &str, args: Vec<Value>) -> Result<ReplyStream> {
		match self.call(method, args).await? {
			Reply::Stream(stream) => Ok(stream),
			Reply::Value(_) => Err(Error::Protocol(format!("{method} answered with a single value"))),
		}
	}

	/// Calls `method`, failing with [`Error::Timeout`] if no reply arrives
	/// within `timeout`.
	///
	/// The timeout bounds the wait for the first reply only; items of a
	/// streamed answer are bounded by heartbeat liveness.
	pub async fn call_with_timeout(&self, method: &str, args: Vec<Value>, timeout: Duration) -> Result<Reply> {
		let inner = &self.inner;
		let channel = HeartBeatOnChannel::new(
			inner.mux.channel(None),
			inner.config.heartbeat(),
			inner.config.passive_heartbeat,
		);
		let channel = BufferedChannel::new(channel, inner.config.inqueue_size);
		channel.set_close_if(|event| event.name() == names::STREAM_DONE);

		let request = channel.create_event(method, args, Some(inner.context.task_context()));
		inner.context.client_before_request(&request)?;
		tracing::debug!(method, message_id = request.message_id().unwrap_or_default(), "client.call");
		channel.emit_event(request.clone()).await?;

		let reply = match channel.recv(Some(timeout)).await {
			Ok(reply) => reply,
			Err(err) => {
				channel.close();
				let err = if err.is_timeout() {
					Error::timeout(timeout, format!("calling remote method {method}"))
				} else {
					err
				};
				tracing::warn!(method, error = %err, "client.call_failed");
				inner.context.client_after_request(&request, None, Some(&err))?;
				return Err(err);
			}
		};

		let Some(pattern) = Pattern::select(&reply) else {
			channel.close();
			let err = Error::Protocol(format!("unable to find a pattern for: {reply}"));
			tracing::warn!(method, error = %err, "client.call_failed");
			inner.context.client_after_request(&request, Some(&reply), Some(&err))?;
			return Err(err);
		};
		pattern.process_answer(Arc::clone(&inner.context), channel, request, reply).await
	}

	/// Starts a call in the background.
	pub fn spawn_call(&self, method: impl Into<String>, args: Vec<Value>) -> PendingCall {
		let client = self.clone();
		let method = method.into();
		let handle = zrpc_worker::spawn(TaskClass::Call, async move { client.call(&method, args).await });
		PendingCall { handle }
	}

	/// Stops routing replies and closes the socket. Pending calls fail.
	pub fn close(&self) {
		self.inner.mux.close();
		self.inner.mux.events().close();
	}
}

/// A call started with [`Client::spawn_call`].
#[derive(Debug)]
pub struct PendingCall {
	handle: JoinHandle<Result<Reply>>,
}

impl PendingCall {
	/// Returns true once the call has completed.
	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Waits for the call's outcome.
	pub async fn join(self) -> Result<Reply> {
		match self.handle.await {
			Ok(result) => result,
			Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
			Err(_) => Err(Error::Closed),
		}
	}
}
