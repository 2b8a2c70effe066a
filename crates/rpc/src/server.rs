//! Server side call orchestration.
//!
//! [`Server::run`] accepts one call per inbound opening envelope and serves
//! it in its own task over a heartbeat-monitored, flow-controlled channel.
//! Whatever happens inside a handler, including a panic, is reported to the
//! caller as an `ERR` reply and never takes the accept loop down.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zrpc_wire::{Compat, Envelope, names};
use zrpc_worker::{TaskClass, WorkerJoinSet};

use crate::buffered::BufferedChannel;
use crate::channel::{Channel, ChannelMultiplexer, EventChannel};
use crate::config::RpcConfig;
use crate::events::Events;
use crate::heartbeat::{HeartBeatOnChannel, wait_lost};
use crate::hooks::Context;
use crate::methods::Methods;
use crate::pattern::{self, CallChannel};
use crate::transport::Transport;
use crate::{Error, RemoteError, Result};

struct ServerInner {
	mux: ChannelMultiplexer,
	methods: Methods,
	context: Arc<Context>,
	config: RpcConfig,
}

/// Serves [`Methods`] over one socket, usually a router.
pub struct Server {
	inner: Arc<ServerInner>,
	stop: CancellationToken,
}

impl std::fmt::Debug for Server {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Server")
			.field("events", self.inner.mux.events())
			.field("methods", &self.inner.methods.len())
			.field("stopped", &self.stop.is_cancelled())
			.finish_non_exhaustive()
	}
}

impl Server {
	/// Creates a server over `transport`.
	pub fn new(transport: Arc<dyn Transport>, methods: Methods, context: Arc<Context>, config: RpcConfig) -> Self {
		let events = Events::new(transport, Arc::clone(context.ids()));
		Self {
			inner: Arc::new(ServerInner {
				mux: ChannelMultiplexer::new(events, false),
				methods,
				context,
				config,
			}),
			stop: CancellationToken::new(),
		}
	}

	/// Token cancelled by [`Server::stop`].
	pub fn stop_token(&self) -> CancellationToken {
		self.stop.clone()
	}

	/// Makes [`Server::run`] stop accepting calls and return.
	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Runs [`Server::run`] in a background task.
	pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
		let server = Arc::clone(self);
		zrpc_worker::spawn(TaskClass::Acceptor, async move { server.run().await })
	}

	/// Accepts and serves calls until stopped or the socket fails.
	///
	/// In-flight calls are awaited before returning.
	pub async fn run(&self) -> Result<()> {
		let pool = self.inner.config.pool_size.map(|size| Arc::new(Semaphore::new(size)));
		let mut calls = WorkerJoinSet::new(TaskClass::Call);
		tracing::debug!(pool_size = ?self.inner.config.pool_size, "server.run");

		let result = loop {
			calls.reap();
			let request = tokio::select! {
				biased;
				_ = self.stop.cancelled() => break Ok(()),
				request = self.inner.mux.recv() => request,
			};
			let request = match request {
				Ok(request) => request,
				Err(e) => {
					tracing::error!(error = %e, "server.accept_failed");
					break Err(e);
				}
			};

			if names::is_reserved(request.name()) {
				tracing::warn!(event = %request, "server.stray_control");
				continue;
			}
			let compat = Compat::detect(request.header());
			let Some(channel) = self.inner.mux.accept(request) else {
				continue;
			};
			let inner = Arc::clone(&self.inner);
			let pool = pool.clone();
			calls.spawn(async move { serve_call(&inner, channel, compat, pool).await });
		};

		tracing::debug!(in_flight = calls.len(), "server.draining");
		calls.drain().await;
		result
	}
}

/// Serves one call. With a pool, the handler only runs once a slot is free;
/// until then the channel stack keeps answering heartbeats.
async fn serve_call(inner: &ServerInner, channel: Channel, compat: Compat, pool: Option<Arc<Semaphore>>) {
	let passive = inner.config.passive_heartbeat || compat.single_arg_errors;
	let channel = HeartBeatOnChannel::new(channel, inner.config.heartbeat(), passive);
	let channel: CallChannel = BufferedChannel::new(channel, inner.config.inqueue_size);

	let request = match channel.recv(None).await {
		Ok(request) => request,
		Err(e) => {
			tracing::warn!(error = %e, "server.request_lost");
			channel.close();
			return;
		}
	};

	let _permit = match pool {
		Some(pool) => pool.acquire_owned().await.ok(),
		None => None,
	};
	let call = AssertUnwindSafe(dispatch(inner, &channel, &request)).catch_unwind();
	let outcome = tokio::select! {
		biased;
		err = wait_lost(channel.liveness()) => Err(err),
		res = call => res.unwrap_or_else(|panic| Err(RemoteError::new("Panic", panic_message(&*panic)).into())),
	};

	match outcome {
		Ok(()) => {}
		Err(err) if err.is_remote_lost() => {
			tracing::warn!(method = request.name(), error = %err, "server.remote_lost");
		}
		Err(err) => {
			let remote = into_remote_error(err);
			tracing::debug!(method = request.name(), error = %remote, "server.call_failed");
			let reply = channel.create_event(names::ERR, remote.to_args(compat), Some(inner.context.task_context()));
			match inner.context.server_inspect_exception(Some(&request), Some(&reply), &remote) {
				Err(e) => tracing::error!(method = request.name(), error = %e, "server.inspect_failed"),
				Ok(()) => {
					if let Err(e) = channel.emit_event(reply).await {
						tracing::warn!(method = request.name(), error = %e, "server.reply_failed");
					}
				}
			}
		}
	}
	channel.close();
}

async fn dispatch<C: EventChannel>(inner: &ServerInner, channel: &C, request: &Envelope) -> Result<()> {
	inner.context.load_task_context(request.header())?;
	let Some(method) = inner.methods.get(request.name()) else {
		return Err(RemoteError::new("NameError", format!("No such method: {}", request.name())).into());
	};
	pattern::process_call(&inner.context, channel, request, method).await
}

/// Maps a failed call to the error reported to the caller.
fn into_remote_error(err: Error) -> RemoteError {
	match err {
		Error::Remote(remote) => remote,
		other => {
			let name = match &other {
				Error::Timeout { .. } => "TimeoutExpired",
				Error::Protocol(_) => "ProtocolError",
				Error::Hook(_) => "HookError",
				_ => "InternalError",
			};
			RemoteError::new(name, other.to_string())
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(msg) = panic.downcast_ref::<&str>() {
		(*msg).to_owned()
	} else if let Some(msg) = panic.downcast_ref::<String>() {
		msg.clone()
	} else {
		"handler panicked".to_owned()
	}
}
