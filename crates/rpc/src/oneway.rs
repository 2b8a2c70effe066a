//! Fire-and-forget endpoints for push/pull and pub/sub sockets.
//!
//! These never reply, so they need neither channels nor a dispatcher: a
//! [`Publisher`] emits envelopes straight onto its socket and a
//! [`Subscriber`] reads them straight off its own.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use zrpc_wire::{Envelope, Value};

use crate::channel::ChannelMultiplexer;
use crate::events::Events;
use crate::hooks::Context;
use crate::methods::{Method, Methods};
use crate::transport::Transport;
use crate::{Error, Result};

/// Emits one-way calls.
#[derive(Debug, Clone)]
pub struct Publisher {
	events: Events,
	context: Arc<Context>,
}

/// Emitting side of a push/pull pair.
pub type Pusher = Publisher;

impl Publisher {
	/// Creates a publisher over `transport`.
	pub fn new(transport: Arc<dyn Transport>, context: Arc<Context>) -> Self {
		Self {
			events: Events::new(transport, Arc::clone(context.ids())),
			context,
		}
	}

	/// Emits `name(args)` to whoever listens.
	pub async fn emit(&self, name: &str, args: Vec<Value>) -> Result<()> {
		self.events.emit(name, args, Some(self.context.task_context())).await
	}

	/// Closes the socket.
	pub fn close(&self) {
		self.events.close();
	}
}

/// Runs request/reply handlers for one-way calls, discarding their results.
#[derive(Debug)]
pub struct Subscriber {
	mux: ChannelMultiplexer,
	methods: Methods,
	context: Arc<Context>,
	stop: CancellationToken,
}

/// Receiving side of a push/pull pair.
pub type Puller = Subscriber;

impl Subscriber {
	/// Creates a subscriber over `transport`.
	pub fn new(transport: Arc<dyn Transport>, methods: Methods, context: Arc<Context>) -> Self {
		let events = Events::new(transport, Arc::clone(context.ids()));
		Self {
			mux: ChannelMultiplexer::new(events, true),
			methods,
			context,
			stop: CancellationToken::new(),
		}
	}

	/// Token cancelled by [`Subscriber::stop`].
	pub fn stop_token(&self) -> CancellationToken {
		self.stop.clone()
	}

	/// Makes [`Subscriber::run`] return.
	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Handles inbound envelopes one at a time until stopped or the socket
	/// fails.
	///
	/// Handler failures and unknown names are logged and skipped.
	pub async fn run(&self) -> Result<()> {
		loop {
			let event = tokio::select! {
				biased;
				_ = self.stop.cancelled() => return Ok(()),
				event = self.mux.recv() => event,
			};
			match event {
				Ok(event) => self.handle(event).await,
				Err(e @ (Error::Wire(_) | Error::Protocol(_))) => tracing::warn!(error = %e, "oneway.undecodable"),
				Err(e) => {
					tracing::error!(error = %e, "oneway.recv_failed");
					return Err(e);
				}
			}
		}
	}

	async fn handle(&self, event: Envelope) {
		if let Err(e) = self.context.load_task_context(event.header()) {
			tracing::warn!(method = event.name(), error = %e, "oneway.hook_failed");
			return;
		}
		let handler = match self.methods.get(event.name()) {
			Some(Method::Unary(handler)) => handler,
			Some(Method::Stream(_)) => {
				tracing::warn!(method = event.name(), "oneway.stream_method");
				return;
			}
			None => {
				tracing::warn!(method = event.name(), "oneway.unknown_method");
				return;
			}
		};
		let call = AssertUnwindSafe(handler(event.args().to_vec())).catch_unwind();
		match call.await {
			Ok(Ok(_)) => tracing::trace!(method = event.name(), "oneway.handled"),
			Ok(Err(e)) => tracing::warn!(method = event.name(), error = %e, "oneway.handler_failed"),
			Err(_) => tracing::error!(method = event.name(), "oneway.handler_panicked"),
		}
	}
}
