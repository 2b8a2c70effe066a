//! Handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use zrpc_wire::{Value, names};

use crate::RemoteError;
use crate::pattern::Pattern;

/// Future returned by a request/reply handler.
pub type UnaryReply = BoxFuture<'static, Result<Value, RemoteError>>;

/// Item stream returned by a streaming handler.
pub type StreamReply = BoxStream<'static, Result<Value, RemoteError>>;

type UnaryFn = dyn Fn(Vec<Value>) -> UnaryReply + Send + Sync;
type StreamFn = dyn Fn(Vec<Value>) -> StreamReply + Send + Sync;

/// A registered handler.
#[derive(Clone)]
pub enum Method {
	/// Answers with exactly one value.
	Unary(Arc<UnaryFn>),
	/// Answers with a finite sequence of values.
	Stream(Arc<StreamFn>),
}

impl Method {
	/// The call convention this handler answers with.
	pub fn pattern(&self) -> Pattern {
		match self {
			Self::Unary(_) => Pattern::ReqRep,
			Self::Stream(_) => Pattern::ReqStream,
		}
	}
}

impl std::fmt::Debug for Method {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Method").field(&self.pattern()).finish()
	}
}

/// Handlers keyed by method name.
///
/// ```ignore
/// let methods = Methods::new()
///     .unary("add", |args| async move { ... })
///     .stream("range", |args| futures::stream::iter(...));
/// ```
#[derive(Clone, Default, Debug)]
pub struct Methods {
	methods: HashMap<String, Method>,
}

impl Methods {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a request/reply handler.
	///
	/// # Panics
	///
	/// Panics if `name` is a reserved control message name.
	pub fn unary<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
	{
		self.insert(name.into(), Method::Unary(Arc::new(move |args| handler(args).boxed())))
	}

	/// Registers a streaming handler.
	///
	/// # Panics
	///
	/// Panics if `name` is a reserved control message name.
	pub fn stream<F, S>(self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Vec<Value>) -> S + Send + Sync + 'static,
		S: Stream<Item = Result<Value, RemoteError>> + Send + 'static,
	{
		self.insert(name.into(), Method::Stream(Arc::new(move |args| handler(args).boxed())))
	}

	fn insert(mut self, name: String, method: Method) -> Self {
		assert!(!names::is_reserved(&name), "method name {name:?} is reserved");
		self.methods.insert(name, method);
		self
	}

	/// Looks up a handler.
	pub fn get(&self, name: &str) -> Option<&Method> {
		self.methods.get(name)
	}

	/// Registered method names, in no particular order.
	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.methods.keys().map(String::as_str)
	}

	/// Number of registered handlers.
	pub fn len(&self) -> usize {
		self.methods.len()
	}

	/// Returns true if no handler is registered.
	pub fn is_empty(&self) -> bool {
		self.methods.is_empty()
	}
}
