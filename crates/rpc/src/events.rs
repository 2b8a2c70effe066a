//! Asynchronous socket wrapper.
//!
//! [`Events`] owns one [`Transport`] and drives it from two background pumps:
//! the send pump drains an unbounded queue of outgoing multipart messages,
//! the receive pump hands complete inbound messages over a single-slot queue.
//! Envelopes are encoded and decoded here, and routing identity frames are
//! split off or re-attached for addressed socket patterns.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use zrpc_wire::{Envelope, Header, MessageIds, Value};
use zrpc_worker::{OwnedTask, TaskClass};

use crate::transport::{SocketPattern, Transport};
use crate::{Error, Result};

struct Outgoing {
	parts: Vec<Bytes>,
	done: oneshot::Sender<io::Result<()>>,
}

struct EventsInner {
	transport: Arc<dyn Transport>,
	pattern: SocketPattern,
	ids: Arc<dyn MessageIds>,
	send_tx: Option<mpsc::UnboundedSender<Outgoing>>,
	recv_rx: Option<tokio::sync::Mutex<mpsc::Receiver<io::Result<Vec<Bytes>>>>>,
	pumps: Mutex<Vec<OwnedTask>>,
	closed: AtomicBool,
}

/// Envelope-level send/receive over a message socket.
///
/// Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Events {
	inner: Arc<EventsInner>,
}

impl std::fmt::Debug for Events {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Events")
			.field("pattern", &self.inner.pattern)
			.field("closed", &self.inner.closed.load(Ordering::Acquire))
			.finish()
	}
}

impl Events {
	/// Wraps `transport`, spawning the pumps its pattern needs.
	///
	/// Must be called from within a tokio runtime.
	pub fn new(transport: Arc<dyn Transport>, ids: Arc<dyn MessageIds>) -> Self {
		let pattern = transport.pattern();
		let mut pumps = Vec::with_capacity(2);

		let send_tx = pattern.can_send().then(|| {
			let (tx, rx) = mpsc::unbounded_channel();
			pumps.push(OwnedTask::spawn(
				TaskClass::SocketPump,
				"events.send",
				send_pump(Arc::clone(&transport), rx),
			));
			tx
		});

		let recv_rx = pattern.can_recv().then(|| {
			let (tx, rx) = mpsc::channel(1);
			pumps.push(OwnedTask::spawn(
				TaskClass::SocketPump,
				"events.recv",
				recv_pump(Arc::clone(&transport), tx),
			));
			tokio::sync::Mutex::new(rx)
		});

		tracing::debug!(pattern = pattern.as_str(), "events.open");
		Self {
			inner: Arc::new(EventsInner {
				transport,
				pattern,
				ids,
				send_tx,
				recv_rx,
				pumps: Mutex::new(pumps),
				closed: AtomicBool::new(false),
			}),
		}
	}

	/// Messaging pattern of the wrapped socket.
	pub fn pattern(&self) -> SocketPattern {
		self.inner.pattern
	}

	/// Whether this socket can receive unsolicited messages.
	pub fn can_recv(&self) -> bool {
		self.inner.pattern.can_recv()
	}

	/// Message id supplier used for new envelopes.
	pub fn ids(&self) -> &Arc<dyn MessageIds> {
		&self.inner.ids
	}

	/// Returns true once [`Events::close`] was called.
	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	/// Queues one multipart message and waits for the send pump to write it.
	pub async fn send(&self, parts: Vec<Bytes>) -> Result<()> {
		if self.is_closed() {
			return Err(Error::Closed);
		}
		let Some(send_tx) = &self.inner.send_tx else {
			return Err(Error::Transport(io::Error::new(
				io::ErrorKind::Unsupported,
				format!("{} sockets cannot send", self.inner.pattern.as_str()),
			)));
		};
		let (done, wait) = oneshot::channel();
		send_tx.send(Outgoing { parts, done }).map_err(|_| Error::Closed)?;
		match wait.await {
			Ok(res) => res.map_err(Error::Transport),
			Err(_) => Err(Error::Closed),
		}
	}

	/// Receives one complete multipart message.
	pub async fn recv_parts(&self) -> Result<Vec<Bytes>> {
		if self.is_closed() {
			return Err(Error::Closed);
		}
		let Some(recv_rx) = &self.inner.recv_rx else {
			return Err(Error::Transport(io::Error::new(
				io::ErrorKind::Unsupported,
				format!("{} sockets cannot receive", self.inner.pattern.as_str()),
			)));
		};
		let mut rx = recv_rx.lock().await;
		match rx.recv().await {
			Some(res) => res.map_err(Error::Transport),
			None => Err(Error::Closed),
		}
	}

	/// Receives and decodes one envelope.
	///
	/// For addressed patterns the payload must follow an empty delimiter frame,
	/// and every frame before the delimiter is kept as the envelope's routing
	/// identity. Other patterns decode the last frame and ignore the rest.
	pub async fn recv(&self) -> Result<Envelope> {
		let parts = self.recv_parts().await?;
		let (identity, blob) = split_frames(self.inner.pattern, parts)?;
		let mut event = Envelope::decode(&blob)?;
		event.set_identity(identity);
		Ok(event)
	}

	/// Builds an envelope with a fresh message id.
	pub fn create_event(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Envelope {
		Envelope::create(self.inner.ids.as_ref(), name, args, header)
	}

	/// Encodes and sends an envelope, prepending its routing identity if any.
	pub async fn emit_event(&self, event: &Envelope) -> Result<()> {
		let blob = Bytes::from(event.encode()?);
		let parts = match event.identity() {
			Some(identity) => {
				let mut parts = identity.to_vec();
				parts.push(Bytes::new());
				parts.push(blob);
				parts
			}
			None if self.inner.pattern.is_addressed() => vec![Bytes::new(), blob],
			None => vec![blob],
		};
		self.send(parts).await
	}

	/// Builds and sends an envelope.
	pub async fn emit(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Result<()> {
		let event = self.create_event(name, args, header);
		self.emit_event(&event).await
	}

	/// Stops both pumps and closes the socket. Further calls are no-ops.
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		for pump in self.inner.pumps.lock().drain(..) {
			pump.abort();
		}
		self.inner.transport.close();
		tracing::debug!(pattern = self.inner.pattern.as_str(), "events.close");
	}
}

/// Splits a multipart message into its routing identity and payload frame.
fn split_frames(pattern: SocketPattern, mut parts: Vec<Bytes>) -> Result<(Option<Vec<Bytes>>, Bytes)> {
	let Some(blob) = parts.pop() else {
		return Err(Error::Protocol("received an empty multipart message".into()));
	};
	if !pattern.is_addressed() {
		if !parts.is_empty() {
			tracing::debug!(pattern = pattern.as_str(), extra = parts.len(), "events.extra_frames");
		}
		return Ok((None, blob));
	}
	match parts.pop() {
		Some(delimiter) if delimiter.is_empty() => Ok(((!parts.is_empty()).then_some(parts), blob)),
		_ => Err(Error::Protocol(format!(
			"{} message without an empty delimiter frame",
			pattern.as_str()
		))),
	}
}

async fn send_pump(transport: Arc<dyn Transport>, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
	while let Some(Outgoing { parts, done }) = rx.recv().await {
		let res = transport.send(parts).await;
		if let Err(e) = &res {
			tracing::error!(error = %e, "events.send_failed");
		}
		let _ = done.send(res);
	}
}

async fn recv_pump(transport: Arc<dyn Transport>, tx: mpsc::Sender<io::Result<Vec<Bytes>>>) {
	loop {
		let res = transport.recv().await;
		let failed = res.is_err();
		if let Err(e) = &res {
			tracing::debug!(error = %e, "events.recv_failed");
		}
		if tx.send(res).await.is_err() || failed {
			break;
		}
	}
}
