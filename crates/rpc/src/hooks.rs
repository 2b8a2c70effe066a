//! Middleware hook points and the per-endpoint [`Context`].
//!
//! Each hook point is its own trait. A collaborator implements the points it
//! cares about and exposes them through [`Middleware`]; registering it stores
//! one handle per satisfied point.
//!
//! ```ignore
//! struct Tracer;
//!
//! impl ClientBeforeRequest for Tracer {
//!     fn client_before_request(&self, request: &Envelope) -> Result<()> {
//!         tracing::info!(method = request.name(), "call");
//!         Ok(())
//!     }
//! }
//!
//! impl Middleware for Tracer {
//!     fn client_before_request(self: Arc<Self>) -> Option<Arc<dyn ClientBeforeRequest>> {
//!         Some(self)
//!     }
//! }
//! ```

use std::sync::Arc;

use zrpc_wire::{CounterIdGen, Envelope, Header, MessageIds};

use crate::{Error, RemoteError, Result};

/// Reads pass-through keys from an inbound request header.
pub trait LoadTaskContext: Send + Sync {
	/// Called on the server before the handler is looked up.
	fn load_task_context(&self, header: &Header) -> Result<()>;
}

/// Supplies pass-through keys merged into every header the core creates.
pub trait TaskContext: Send + Sync {
	/// Header entries to attach, such as a trace id.
	fn task_context(&self) -> Header;
}

/// Runs before a client request is sent.
pub trait ClientBeforeRequest: Send + Sync {
	/// Inspects the request envelope.
	fn client_before_request(&self, request: &Envelope) -> Result<()>;
}

/// Runs once a client call completes, whatever the outcome.
pub trait ClientAfterRequest: Send + Sync {
	/// `reply` is the terminal reply, absent on timeout or loss.
	fn client_after_request(&self, request: &Envelope, reply: Option<&Envelope>, error: Option<&Error>) -> Result<()>;
}

/// Translates an `ERR` reply into a [`RemoteError`].
pub trait ClientHandleRemoteError: Send + Sync {
	/// Returns `None` to defer to the next hook or the default decoding.
	fn client_handle_remote_error(&self, reply: &Envelope) -> Option<RemoteError>;
}

/// Runs on the server before the handler executes.
pub trait ServerBeforeExec: Send + Sync {
	/// Inspects the request envelope.
	fn server_before_exec(&self, request: &Envelope) -> Result<()>;
}

/// Runs on the server after the handler produced its terminal reply.
pub trait ServerAfterExec: Send + Sync {
	/// `reply` is the `OK` or `STREAM_DONE` envelope about to be sent.
	fn server_after_exec(&self, request: &Envelope, reply: Option<&Envelope>) -> Result<()>;
}

/// Runs on the server when a handler failed, before the `ERR` reply is sent.
///
/// If the hook fails, the call ends without a reply and the caller observes
/// a timeout or the loss of the server.
pub trait ServerInspectException: Send + Sync {
	/// `request` is absent when the failure happened before one was read.
	fn server_inspect_exception(
		&self,
		request: Option<&Envelope>,
		reply: Option<&Envelope>,
		error: &RemoteError,
	) -> Result<()>;
}

/// A collaborator exposing any subset of the hook points.
///
/// Every accessor defaults to `None`; implement the ones the type supports
/// with `Some(self)`.
pub trait Middleware: Send + Sync + 'static {
	/// Access to [`LoadTaskContext`] (optional).
	fn load_task_context(self: Arc<Self>) -> Option<Arc<dyn LoadTaskContext>> {
		None
	}

	/// Access to [`TaskContext`] (optional).
	fn task_context(self: Arc<Self>) -> Option<Arc<dyn TaskContext>> {
		None
	}

	/// Access to [`ClientBeforeRequest`] (optional).
	fn client_before_request(self: Arc<Self>) -> Option<Arc<dyn ClientBeforeRequest>> {
		None
	}

	/// Access to [`ClientAfterRequest`] (optional).
	fn client_after_request(self: Arc<Self>) -> Option<Arc<dyn ClientAfterRequest>> {
		None
	}

	/// Access to [`ClientHandleRemoteError`] (optional).
	fn client_handle_remote_error(self: Arc<Self>) -> Option<Arc<dyn ClientHandleRemoteError>> {
		None
	}

	/// Access to [`ServerBeforeExec`] (optional).
	fn server_before_exec(self: Arc<Self>) -> Option<Arc<dyn ServerBeforeExec>> {
		None
	}

	/// Access to [`ServerAfterExec`] (optional).
	fn server_after_exec(self: Arc<Self>) -> Option<Arc<dyn ServerAfterExec>> {
		None
	}

	/// Access to [`ServerInspectException`] (optional).
	fn server_inspect_exception(self: Arc<Self>) -> Option<Arc<dyn ServerInspectException>> {
		None
	}
}

/// Registered collaborators, per hook point, in registration order.
#[derive(Default, Clone)]
pub struct HookRegistry {
	load_task_context: Vec<Arc<dyn LoadTaskContext>>,
	task_context: Vec<Arc<dyn TaskContext>>,
	client_before_request: Vec<Arc<dyn ClientBeforeRequest>>,
	client_after_request: Vec<Arc<dyn ClientAfterRequest>>,
	client_handle_remote_error: Vec<Arc<dyn ClientHandleRemoteError>>,
	server_before_exec: Vec<Arc<dyn ServerBeforeExec>>,
	server_after_exec: Vec<Arc<dyn ServerAfterExec>>,
	server_inspect_exception: Vec<Arc<dyn ServerInspectException>>,
}

fn push<T: ?Sized>(slot: &mut Vec<Arc<T>>, hook: Option<Arc<T>>) -> usize {
	match hook {
		Some(hook) => {
			slot.push(hook);
			1
		}
		None => 0,
	}
}

impl HookRegistry {
	/// Stores `middleware` under every hook point it satisfies.
	///
	/// Returns the number of hook points registered.
	pub fn register<M: Middleware>(&mut self, middleware: Arc<M>) -> usize {
		let mut count = 0;
		count += push(&mut self.load_task_context, Arc::clone(&middleware).load_task_context());
		count += push(&mut self.task_context, Arc::clone(&middleware).task_context());
		count += push(&mut self.client_before_request, Arc::clone(&middleware).client_before_request());
		count += push(&mut self.client_after_request, Arc::clone(&middleware).client_after_request());
		count += push(
			&mut self.client_handle_remote_error,
			Arc::clone(&middleware).client_handle_remote_error(),
		);
		count += push(&mut self.server_before_exec, Arc::clone(&middleware).server_before_exec());
		count += push(&mut self.server_after_exec, Arc::clone(&middleware).server_after_exec());
		count += push(&mut self.server_inspect_exception, middleware.server_inspect_exception());
		tracing::debug!(hook_points = count, "hooks.register");
		count
	}

	/// Returns true if no collaborator is registered.
	pub fn is_empty(&self) -> bool {
		self.load_task_context.is_empty()
			&& self.task_context.is_empty()
			&& self.client_before_request.is_empty()
			&& self.client_after_request.is_empty()
			&& self.client_handle_remote_error.is_empty()
			&& self.server_before_exec.is_empty()
			&& self.server_after_exec.is_empty()
			&& self.server_inspect_exception.is_empty()
	}
}

/// Message-id supplier plus hooks, shared by every endpoint built from it.
#[derive(Clone)]
pub struct Context {
	ids: Arc<dyn MessageIds>,
	hooks: HookRegistry,
}

impl Default for Context {
	fn default() -> Self {
		Self::new(Arc::new(CounterIdGen::new()))
	}
}

impl Context {
	/// Creates a context drawing message ids from `ids`.
	pub fn new(ids: Arc<dyn MessageIds>) -> Self {
		Self {
			ids,
			hooks: HookRegistry::default(),
		}
	}

	/// Registers `middleware`; see [`HookRegistry::register`].
	pub fn register<M: Middleware>(&mut self, middleware: Arc<M>) -> usize {
		self.hooks.register(middleware)
	}

	/// The message-id supplier.
	pub fn ids(&self) -> &Arc<dyn MessageIds> {
		&self.ids
	}

	/// The registered hooks.
	pub fn hooks(&self) -> &HookRegistry {
		&self.hooks
	}

	/// Header entries contributed by every [`TaskContext`] hook.
	pub fn task_context(&self) -> Header {
		let mut header = Header::new();
		for hook in &self.hooks.task_context {
			header.merge(hook.task_context());
		}
		header
	}

	pub(crate) fn load_task_context(&self, header: &Header) -> Result<()> {
		self.hooks
			.load_task_context
			.iter()
			.try_for_each(|hook| hook.load_task_context(header))
	}

	pub(crate) fn client_before_request(&self, request: &Envelope) -> Result<()> {
		self.hooks
			.client_before_request
			.iter()
			.try_for_each(|hook| hook.client_before_request(request))
	}

	pub(crate) fn client_after_request(
		&self,
		request: &Envelope,
		reply: Option<&Envelope>,
		error: Option<&Error>,
	) -> Result<()> {
		self.hooks
			.client_after_request
			.iter()
			.try_for_each(|hook| hook.client_after_request(request, reply, error))
	}

	/// First hook translation wins; otherwise the reply is decoded as is.
	pub(crate) fn client_handle_remote_error(&self, reply: &Envelope) -> RemoteError {
		self.hooks
			.client_handle_remote_error
			.iter()
			.find_map(|hook| hook.client_handle_remote_error(reply))
			.unwrap_or_else(|| RemoteError::from_reply(reply))
	}

	pub(crate) fn server_before_exec(&self, request: &Envelope) -> Result<()> {
		self.hooks
			.server_before_exec
			.iter()
			.try_for_each(|hook| hook.server_before_exec(request))
	}

	pub(crate) fn server_after_exec(&self, request: &Envelope, reply: Option<&Envelope>) -> Result<()> {
		self.hooks
			.server_after_exec
			.iter()
			.try_for_each(|hook| hook.server_after_exec(request, reply))
	}

	pub(crate) fn server_inspect_exception(
		&self,
		request: Option<&Envelope>,
		reply: Option<&Envelope>,
		error: &RemoteError,
	) -> Result<()> {
		self.hooks
			.server_inspect_exception
			.iter()
			.try_for_each(|hook| hook.server_inspect_exception(request, reply, error))
	}
}

impl std::fmt::Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Context")
			.field("hooks_registered", &!self.hooks.is_empty())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use zrpc_wire::Value;

	use super::*;

	#[derive(Default)]
	struct Counting {
		before: AtomicUsize,
	}

	impl ClientBeforeRequest for Counting {
		fn client_before_request(&self, _request: &Envelope) -> Result<()> {
			self.before.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	impl TaskContext for Counting {
		fn task_context(&self) -> Header {
			[("trace_id".to_owned(), Value::from("t-1"))].into_iter().collect()
		}
	}

	impl Middleware for Counting {
		fn client_before_request(self: Arc<Self>) -> Option<Arc<dyn ClientBeforeRequest>> {
			Some(self)
		}

		fn task_context(self: Arc<Self>) -> Option<Arc<dyn TaskContext>> {
			Some(self)
		}
	}

	struct Refusing;

	impl ServerBeforeExec for Refusing {
		fn server_before_exec(&self, request: &Envelope) -> Result<()> {
			Err(Error::Hook(format!("refused {}", request.name())))
		}
	}

	impl Middleware for Refusing {
		fn server_before_exec(self: Arc<Self>) -> Option<Arc<dyn ServerBeforeExec>> {
			Some(self)
		}
	}

	struct Nothing;

	impl Middleware for Nothing {}

	fn request(context: &Context) -> Envelope {
		Envelope::create(context.ids().as_ref(), "add", vec![Value::from(1)], None)
	}

	#[test]
	fn register_counts_satisfied_hook_points() {
		let mut context = Context::default();
		assert_eq!(context.register(Arc::new(Nothing)), 0);
		assert!(context.hooks().is_empty());
		assert_eq!(context.register(Arc::new(Counting::default())), 2);
		assert_eq!(context.register(Arc::new(Refusing)), 1);
		assert!(!context.hooks().is_empty());
	}

	#[test]
	fn hooks_are_called_and_errors_propagate() {
		let mut context = Context::default();
		let counting = Arc::new(Counting::default());
		context.register(Arc::clone(&counting));
		context.register(Arc::new(Refusing));

		let req = request(&context);
		context.client_before_request(&req).unwrap();
		context.client_before_request(&req).unwrap();
		assert_eq!(counting.before.load(Ordering::SeqCst), 2);

		let err = context.server_before_exec(&req).unwrap_err();
		assert!(matches!(err, Error::Hook(ref m) if m == "refused add"));
	}

	#[test]
	fn task_context_merges_contributions() {
		let mut context = Context::default();
		assert!(context.task_context().is_empty());
		context.register(Arc::new(Counting::default()));
		let header = context.task_context();
		assert_eq!(header.get("trace_id").and_then(Value::as_str), Some("t-1"));
	}

	#[test]
	fn remote_error_defaults_to_reply_decoding() {
		let context = Context::default();
		let reply = Envelope::create(
			context.ids().as_ref(),
			zrpc_wire::names::ERR,
			vec![Value::from("RuntimeError"), Value::from("boom"), Value::from("trace")],
			None,
		);
		let err = context.client_handle_remote_error(&reply);
		assert_eq!(err.name, "RuntimeError");
		assert_eq!(err.message, "boom");
	}
}
