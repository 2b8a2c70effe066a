//! Logical conversations multiplexed over one socket.
//!
//! A [`ChannelMultiplexer`] owns an [`Events`] socket and runs a dispatcher
//! that routes each inbound envelope to the [`Channel`] whose id matches the
//! envelope's `response_to` header, or to a broadcast queue for envelopes
//! that open a new conversation.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use zrpc_wire::{Envelope, Header, Value};
use zrpc_worker::{OwnedTask, TaskClass};

use crate::events::Events;
use crate::heartbeat::Liveness;
use crate::{Error, Result};

/// Common surface of [`Channel`] and the decorators stacked on top of it.
#[async_trait]
pub trait EventChannel: Send + Sync + 'static {
	/// Builds an envelope belonging to this conversation.
	fn create_event(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Envelope;

	/// Sends an envelope created by [`EventChannel::create_event`].
	async fn emit_event(&self, event: Envelope) -> Result<()>;

	/// Builds and sends an envelope.
	async fn emit(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Result<()> {
		let event = self.create_event(name, args, header);
		self.emit_event(event).await
	}

	/// Waits for the next envelope of this conversation.
	///
	/// Fails with [`Error::Timeout`] if nothing arrives within `timeout`.
	async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope>;

	/// Tears the conversation down. Idempotent.
	fn close(&self);

	/// Liveness signal of the peer, when a heartbeat layer is present.
	fn liveness(&self) -> Option<Liveness> {
		None
	}
}

/// Runs `fut`, failing with [`Error::Timeout`] after `timeout`.
pub(crate) async fn with_timeout<F: Future>(timeout: Option<Duration>, when: &str, fut: F) -> Result<F::Output> {
	match timeout {
		None => Ok(fut.await),
		Some(limit) => tokio::time::timeout(limit, fut)
			.await
			.map_err(|_| Error::timeout(limit, when)),
	}
}

/// Routing table key: the peer identity (addressed sockets only) and the
/// conversation id.
type RouteKey = (Option<Vec<Bytes>>, String);

struct Route {
	token: u64,
	tx: mpsc::Sender<Envelope>,
}

enum Registration {
	Routed(u64),
	Duplicate,
	Failed,
}

struct MuxShared {
	channels: Mutex<HashMap<RouteKey, Route>>,
	next_token: AtomicU64,
	failure: Mutex<Option<String>>,
}

impl MuxShared {
	fn register(&self, key: RouteKey, tx: mpsc::Sender<Envelope>) -> Registration {
		// Channels opened after a socket failure observe it on first recv.
		if self.failure.lock().is_some() {
			return Registration::Failed;
		}
		match self.channels.lock().entry(key) {
			Entry::Occupied(entry) => {
				tracing::warn!(id = %entry.key().1, "mux.duplicate_id");
				Registration::Duplicate
			}
			Entry::Vacant(entry) => {
				let token = self.next_token.fetch_add(1, Ordering::Relaxed);
				entry.insert(Route { token, tx });
				Registration::Routed(token)
			}
		}
	}

	/// Removes `key` if it is still routed to the registration `token`.
	fn deregister(&self, key: &RouteKey, token: u64) {
		let mut channels = self.channels.lock();
		if channels.get(key).is_some_and(|route| route.token == token) {
			channels.remove(key);
		}
	}

	fn lookup(&self, identity: Option<&[Bytes]>, id: &str) -> Option<mpsc::Sender<Envelope>> {
		let key = (identity.map(<[Bytes]>::to_vec), id.to_owned());
		self.channels.lock().get(&key).map(|route| route.tx.clone())
	}

	/// Records a fatal socket failure and wakes every channel.
	fn fail(&self, reason: String) {
		*self.failure.lock() = Some(reason);
		self.channels.lock().clear();
	}

	fn closed_error(&self) -> Error {
		match self.failure.lock().as_ref() {
			Some(reason) => Error::Transport(io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone())),
			None => Error::Closed,
		}
	}
}

/// Routes inbound envelopes of one socket to per-conversation channels.
pub struct ChannelMultiplexer {
	events: Events,
	shared: Arc<MuxShared>,
	dispatcher: Mutex<Option<OwnedTask>>,
	broadcast: Option<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
}

impl ChannelMultiplexer {
	/// Creates a multiplexer over `events`.
	///
	/// Unless `ignore_broadcast` is set, a socket able to receive unsolicited
	/// messages gets a dispatcher right away, feeding uncorrelated envelopes to
	/// [`ChannelMultiplexer::recv`]. Otherwise the dispatcher starts with the
	/// first [`ChannelMultiplexer::channel`] call.
	pub fn new(events: Events, ignore_broadcast: bool) -> Self {
		let shared = Arc::new(MuxShared {
			channels: Mutex::new(HashMap::new()),
			next_token: AtomicU64::new(0),
			failure: Mutex::new(None),
		});
		let mut this = Self {
			events,
			shared,
			dispatcher: Mutex::new(None),
			broadcast: None,
		};
		if this.events.can_recv() && !ignore_broadcast {
			let (tx, rx) = mpsc::channel(1);
			this.broadcast = Some(tokio::sync::Mutex::new(rx));
			this.start_dispatcher(Some(tx));
		}
		this
	}

	fn start_dispatcher(&self, broadcast: Option<mpsc::Sender<Envelope>>) {
		let mut dispatcher = self.dispatcher.lock();
		if dispatcher.is_some() || !self.events.can_recv() {
			return;
		}
		*dispatcher = Some(OwnedTask::spawn(
			TaskClass::Dispatcher,
			"mux.dispatch",
			dispatch(self.events.clone(), Arc::clone(&self.shared), broadcast),
		));
	}

	/// The socket this multiplexer reads from.
	pub fn events(&self) -> &Events {
		&self.events
	}

	/// Opens a channel.
	///
	/// With `from_event`, the channel answers that envelope: its id is the
	/// envelope's `message_id` and the envelope is its first delivered item.
	/// Otherwise the id is taken from the first envelope the channel creates.
	/// A channel whose id is already routed gets no inbound traffic beyond
	/// `from_event`.
	pub fn channel(&self, from_event: Option<Envelope>) -> Channel {
		self.open(from_event).0
	}

	/// Opens the channel answering `event`, unless a live channel of the same
	/// peer already uses its id.
	pub fn accept(&self, event: Envelope) -> Option<Channel> {
		match self.open(Some(event)) {
			(_, Some(Registration::Duplicate)) => None,
			(channel, _) => Some(channel),
		}
	}

	fn open(&self, from_event: Option<Envelope>) -> (Channel, Option<Registration>) {
		self.start_dispatcher(None);
		let (tx, rx) = mpsc::channel(1);
		let identity = from_event.as_ref().and_then(|e| e.identity().map(<[Bytes]>::to_vec));
		let channel = Channel {
			events: self.events.clone(),
			shared: Arc::clone(&self.shared),
			id: Mutex::new(None),
			token: Mutex::new(None),
			identity,
			pending_tx: Mutex::new(None),
			rx: tokio::sync::Mutex::new(rx),
			closed: AtomicBool::new(false),
		};
		let registration = match from_event.as_ref().and_then(|e| e.message_id().map(str::to_owned)) {
			Some(id) => {
				let registration = self.shared.register((channel.identity.clone(), id.clone()), tx.clone());
				if let Registration::Routed(token) = registration {
					*channel.token.lock() = Some(token);
				}
				*channel.id.lock() = Some(id);
				Some(registration)
			}
			None => {
				*channel.pending_tx.lock() = Some(tx.clone());
				None
			}
		};
		if let Some(event) = from_event {
			// Fresh single-slot queue, cannot be full.
			let _ = tx.try_send(event);
		}
		(channel, registration)
	}

	/// Number of channels currently registered.
	pub fn active_channels(&self) -> usize {
		self.shared.channels.lock().len()
	}

	/// Next envelope that does not belong to any conversation.
	///
	/// Without a broadcast queue this reads the socket directly.
	pub async fn recv(&self) -> Result<Envelope> {
		match &self.broadcast {
			Some(rx) => rx.lock().await.recv().await.ok_or_else(|| self.shared.closed_error()),
			None => self.events.recv().await,
		}
	}

	/// Stops the dispatcher. The socket stays open.
	pub fn close(&self) {
		if let Some(task) = self.dispatcher.lock().take() {
			task.abort();
		}
	}
}

impl std::fmt::Debug for ChannelMultiplexer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelMultiplexer")
			.field("events", &self.events)
			.field("active_channels", &self.active_channels())
			.field("broadcast", &self.broadcast.is_some())
			.finish()
	}
}

impl Drop for ChannelMultiplexer {
	fn drop(&mut self) {
		self.close();
	}
}

async fn dispatch(events: Events, shared: Arc<MuxShared>, broadcast: Option<mpsc::Sender<Envelope>>) {
	loop {
		let event = match events.recv().await {
			Ok(event) => event,
			Err(e @ (Error::Wire(_) | Error::Protocol(_))) => {
				tracing::warn!(error = %e, "mux.undecodable");
				continue;
			}
			Err(e) => {
				if !matches!(e, Error::Closed) {
					tracing::error!(error = %e, "mux.recv_failed");
				}
				shared.fail(e.to_string());
				break;
			}
		};

		let target = match event.header().response_to() {
			Some(id) => shared.lookup(event.identity(), id),
			None => broadcast.clone(),
		};
		let Some(target) = target else {
			tracing::warn!(event = %event, "mux.unroutable");
			continue;
		};
		if target.send(event).await.is_err() {
			tracing::debug!("mux.channel_gone");
		}
	}
}

/// One logical conversation.
pub struct Channel {
	events: Events,
	shared: Arc<MuxShared>,
	id: Mutex<Option<String>>,
	/// Registration token, while routed.
	token: Mutex<Option<u64>>,
	identity: Option<Vec<Bytes>>,
	/// Sender registered on first [`EventChannel::create_event`].
	pending_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
	rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
	closed: AtomicBool,
}

impl Channel {
	/// Correlation id, once assigned.
	pub fn id(&self) -> Option<String> {
		self.id.lock().clone()
	}

	/// Returns true once closed.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

#[async_trait]
impl EventChannel for Channel {
	fn create_event(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Envelope {
		let mut event = self.events.create_event(name, args, header);
		let mut id = self.id.lock();
		match id.as_ref() {
			Some(id) => event.header_mut().set_response_to(id.clone()),
			None => {
				if let (Some(message_id), Some(tx)) = (event.message_id().map(str::to_owned), self.pending_tx.lock().take()) {
					if !self.is_closed() {
						let key = (self.identity.clone(), message_id.clone());
						if let Registration::Routed(token) = self.shared.register(key, tx) {
							*self.token.lock() = Some(token);
						}
					}
					*id = Some(message_id);
				}
			}
		}
		event.set_identity(self.identity.clone());
		event
	}

	async fn emit_event(&self, event: Envelope) -> Result<()> {
		if self.is_closed() {
			return Err(Error::Closed);
		}
		self.events.emit_event(&event).await
	}

	async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope> {
		if self.is_closed() {
			return Err(Error::Closed);
		}
		let mut rx = self.rx.lock().await;
		match with_timeout(timeout, "waiting on a channel", rx.recv()).await? {
			Some(event) => Ok(event),
			None => Err(self.shared.closed_error()),
		}
	}

	fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.pending_tx.lock().take();
		let token = self.token.lock().take();
		if let (Some(id), Some(token)) = (self.id.lock().clone(), token) {
			self.shared.deregister(&(self.identity.clone(), id), token);
		}
	}
}

impl Drop for Channel {
	fn drop(&mut self) {
		self.close();
	}
}
