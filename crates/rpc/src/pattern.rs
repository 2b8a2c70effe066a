//! Call conventions.
//!
//! * [`Pattern::ReqRep`]: one request, one `OK` or `ERR` reply.
//! * [`Pattern::ReqStream`]: one request, any number of `STREAM` items, then
//!   one `STREAM_DONE` or `ERR`.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use zrpc_wire::{Envelope, Value, names};

use crate::buffered::BufferedChannel;
use crate::channel::{Channel, EventChannel};
use crate::heartbeat::HeartBeatOnChannel;
use crate::hooks::Context;
use crate::methods::Method;
use crate::{Error, Result};

/// Decorator stack one call runs over.
pub(crate) type CallChannel = BufferedChannel<HeartBeatOnChannel<Channel>>;

/// How a request maps to replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
	/// Request/reply.
	ReqRep,
	/// Request/stream.
	ReqStream,
}

impl Pattern {
	/// Returns true if `reply` may open an answer of this pattern.
	pub fn accepts(self, reply: &Envelope) -> bool {
		match self {
			Self::ReqStream => matches!(reply.name(), names::STREAM | names::STREAM_DONE),
			Self::ReqRep => matches!(reply.name(), names::OK | names::ERR),
		}
	}

	/// Picks the pattern of an answer from its first reply.
	pub fn select(reply: &Envelope) -> Option<Self> {
		[Self::ReqStream, Self::ReqRep].into_iter().find(|pattern| pattern.accepts(reply))
	}

	/// Client side: turns the first reply into the call's outcome.
	pub(crate) async fn process_answer(
		self,
		context: Arc<Context>,
		channel: CallChannel,
		request: Envelope,
		reply: Envelope,
	) -> Result<Reply> {
		match self {
			Self::ReqRep => {
				channel.close();
				if reply.name() == names::ERR {
					let err = Error::Remote(context.client_handle_remote_error(&reply));
					context.client_after_request(&request, Some(&reply), Some(&err))?;
					return Err(err);
				}
				context.client_after_request(&request, Some(&reply), None)?;
				Ok(Reply::Value(first_arg(reply)))
			}
			Self::ReqStream => Ok(Reply::Stream(ReplyStream {
				state: Some(StreamState {
					context,
					channel,
					request,
					pending: Some(reply),
				}),
			})),
		}
	}
}

/// Server side: runs `method` for `request` and sends its terminal reply.
///
/// Handler failures come back as [`Error::Remote`]; the caller turns them
/// into an `ERR` reply.
pub(crate) async fn process_call<C: EventChannel>(
	context: &Context,
	channel: &C,
	request: &Envelope,
	method: &Method,
) -> Result<()> {
	context.server_before_exec(request)?;
	let header = context.task_context();
	let args = request.args().to_vec();
	let reply = match method {
		Method::Unary(handler) => {
			let value = handler(args).await?;
			channel.create_event(names::OK, vec![value], Some(header))
		}
		Method::Stream(handler) => {
			let mut items = handler(args);
			let mut sent = 0usize;
			while let Some(item) = items.next().await {
				channel.emit(names::STREAM, vec![item?], Some(header.clone())).await?;
				sent += 1;
			}
			tracing::debug!(method = request.name(), items = sent, "pattern.stream_done");
			channel.create_event(names::STREAM_DONE, Vec::new(), Some(header))
		}
	};
	context.server_after_exec(request, Some(&reply))?;
	channel.emit_event(reply).await
}

fn first_arg(reply: Envelope) -> Value {
	reply.into_args().into_iter().next().unwrap_or(Value::Nil)
}

/// Outcome of a successful call.
#[derive(Debug)]
pub enum Reply {
	/// A request/reply answer.
	Value(Value),
	/// A streamed answer, pulled lazily.
	Stream(ReplyStream),
}

struct StreamState {
	context: Arc<Context>,
	channel: CallChannel,
	request: Envelope,
	pending: Option<Envelope>,
}

/// Lazily pulled items of a streamed answer.
///
/// Finite and not restartable. The call's channel is closed once the
/// terminal reply has been read or the stream is dropped.
pub struct ReplyStream {
	state: Option<StreamState>,
}

impl std::fmt::Debug for ReplyStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReplyStream")
			.field("finished", &self.state.is_none())
			.finish()
	}
}

impl ReplyStream {
	/// Returns true once the terminal reply has been consumed.
	pub fn is_finished(&self) -> bool {
		self.state.is_none()
	}

	/// Pulls the next item.
	///
	/// Returns `None` after `STREAM_DONE`; an `ERR` terminal or a channel
	/// failure is returned once as `Some(Err(_))`.
	pub async fn next(&mut self) -> Option<Result<Value>> {
		let state = self.state.as_mut()?;
		let received = match state.pending.take() {
			Some(event) => Ok(event),
			None => state.channel.recv(None).await,
		};
		let event = match received {
			Ok(event) => event,
			Err(err) => {
				let state = self.finish()?;
				if let Err(hook_err) = state.context.client_after_request(&state.request, None, Some(&err)) {
					return Some(Err(hook_err));
				}
				return Some(Err(err));
			}
		};

		match event.name() {
			names::STREAM => Some(Ok(first_arg(event))),
			names::STREAM_DONE => {
				let state = self.finish()?;
				state
					.context
					.client_after_request(&state.request, Some(&event), None)
					.err()
					.map(Err)
			}
			names::ERR => {
				let state = self.finish()?;
				let err = Error::Remote(state.context.client_handle_remote_error(&event));
				if let Err(hook_err) = state.context.client_after_request(&state.request, Some(&event), Some(&err)) {
					return Some(Err(hook_err));
				}
				Some(Err(err))
			}
			other => {
				let err = Error::Protocol(format!("unexpected {other} in a stream answer"));
				self.finish();
				Some(Err(err))
			}
		}
	}

	fn finish(&mut self) -> Option<StreamState> {
		let state = self.state.take()?;
		state.channel.close();
		Some(state)
	}

	/// Adapts to a [`futures::Stream`].
	pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
		futures::stream::unfold(self, |mut stream| async move {
			let item = stream.next().await?;
			Some((item, stream))
		})
	}
}
