//! Credit-based flow control.
//!
//! Each side of a [`BufferedChannel`] may only send as many payload envelopes
//! as the peer granted slots for with `_zpc_more` envelopes. The receiving side
//! grants slots in bulk as its local buffer drains, so a fast producer cannot
//! overrun a slow consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError, mpsc};
use tokio_util::sync::CancellationToken;
use zrpc_wire::{Envelope, Header, Value, names};
use zrpc_worker::{OwnedTask, TaskClass};

use crate::channel::{EventChannel, with_timeout};
use crate::heartbeat::{Liveness, wait_lost};
use crate::{Error, Result};

/// Default local buffer capacity, in envelopes.
pub const DEFAULT_INQUEUE_SIZE: usize = 100;

/// Most unused credit a peer may hold out to us. Half the semaphore range, so
/// slots handed back by failed sends always fit.
const MAX_REMOTE_CREDIT: usize = Semaphore::MAX_PERMITS / 2;

type CloseIf = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

struct BufferedShared<C> {
	channel: C,
	capacity: usize,
	/// Slots the peer granted us and we have not used yet.
	remote_open_slots: Semaphore,
	/// Slots we promised the peer and it has not used yet.
	local_reserved: Mutex<usize>,
	queued: AtomicUsize,
	verbose: AtomicBool,
	channel_closed: AtomicBool,
	close_if: Mutex<Option<CloseIf>>,
	fatal: CancellationToken,
	pump_error: Mutex<Option<Error>>,
}

impl<C: EventChannel> BufferedShared<C> {
	fn close_channel(&self) {
		if !self.channel_closed.swap(true, Ordering::AcqRel) {
			self.channel.close();
		}
	}

	/// Error that ended the receive pump, reported on every later `recv`.
	fn pump_error(&self) -> Error {
		self.pump_error.lock().as_ref().map_or(Error::Closed, Error::replicate)
	}

	fn fail(&self, err: Error) {
		*self.pump_error.lock() = Some(err);
		self.fatal.cancel();
	}

	async fn request_data(&self) -> Result<()> {
		let open_slots = {
			let mut reserved = self.local_reserved.lock();
			let open_slots = self.capacity - *reserved;
			*reserved += open_slots;
			open_slots
		};
		tracing::debug!(open_slots, "buffered.grant");
		self.channel.emit(names::MORE, vec![Value::from(open_slots)], None).await
	}
}

/// Flow-controlled decorator over a (usually heartbeat-monitored) channel.
pub struct BufferedChannel<C: EventChannel> {
	shared: Arc<BufferedShared<C>>,
	pump: OwnedTask,
	rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl<C: EventChannel> BufferedChannel<C> {
	/// Wraps `channel` with a local buffer of `inqueue_size` envelopes.
	///
	/// # Panics
	///
	/// Panics if `inqueue_size` is zero.
	pub fn new(channel: C, inqueue_size: usize) -> Self {
		assert!(inqueue_size > 0, "inqueue size must be > 0");
		let shared = Arc::new(BufferedShared {
			channel,
			capacity: inqueue_size,
			remote_open_slots: Semaphore::new(1),
			local_reserved: Mutex::new(1),
			queued: AtomicUsize::new(0),
			verbose: AtomicBool::new(false),
			channel_closed: AtomicBool::new(false),
			close_if: Mutex::new(None),
			fatal: CancellationToken::new(),
			pump_error: Mutex::new(None),
		});
		let (tx, rx) = mpsc::unbounded_channel();
		let pump = OwnedTask::spawn(TaskClass::ChannelPump, "buffered.recv", recv_pump(Arc::clone(&shared), tx));
		Self {
			shared,
			pump,
			rx: tokio::sync::Mutex::new(rx),
		}
	}

	/// The wrapped channel.
	pub fn inner(&self) -> &C {
		&self.shared.channel
	}

	/// Slots currently available for sending without blocking.
	pub fn remote_open_slots(&self) -> usize {
		self.shared.remote_open_slots.available_permits()
	}

	/// Slots currently promised to the peer.
	pub fn local_reserved(&self) -> usize {
		*self.shared.local_reserved.lock()
	}

	/// Installs a predicate recognising the last envelope of the conversation.
	///
	/// Once a matching envelope is buffered, the wrapped channel is closed and
	/// the receive pump exits; already-buffered envelopes remain readable.
	pub fn set_close_if(&self, predicate: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
		*self.shared.close_if.lock() = Some(Arc::new(predicate));
	}

	/// Sends an envelope, spending one slot of remote credit.
	///
	/// Without credit, returns `Ok(false)` when `block` is false; otherwise
	/// waits up to `timeout` for a grant. A failed send gives the slot back.
	pub async fn emit_event_with(&self, event: Envelope, block: bool, timeout: Option<Duration>) -> Result<bool> {
		let permit = if block {
			let liveness = self.shared.channel.liveness();
			tokio::select! {
				biased;
				err = wait_lost(liveness) => return Err(err),
				permit = with_timeout(timeout, "waiting for remote credit", self.shared.remote_open_slots.acquire()) => {
					permit?.map_err(|_| Error::Closed)?
				}
			}
		} else {
			match self.shared.remote_open_slots.try_acquire() {
				Ok(permit) => permit,
				Err(TryAcquireError::NoPermits) => return Ok(false),
				Err(TryAcquireError::Closed) => return Err(Error::Closed),
			}
		};
		permit.forget();
		match self.shared.channel.emit_event(event).await {
			Ok(()) => Ok(true),
			Err(e) => {
				self.shared.remote_open_slots.add_permits(1);
				Err(e)
			}
		}
	}

	/// Builds and sends an envelope; see [`BufferedChannel::emit_event_with`].
	pub async fn emit_with(
		&self,
		name: &str,
		args: Vec<Value>,
		header: Option<Header>,
		block: bool,
		timeout: Option<Duration>,
	) -> Result<bool> {
		let event = self.shared.channel.create_event(name, args, header);
		self.emit_event_with(event, block, timeout).await
	}
}

#[async_trait]
impl<C: EventChannel> EventChannel for BufferedChannel<C> {
	fn create_event(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Envelope {
		self.shared.channel.create_event(name, args, header)
	}

	async fn emit_event(&self, event: Envelope) -> Result<()> {
		self.emit_event_with(event, true, None).await.map(|_| ())
	}

	async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope> {
		let shared = &self.shared;
		if shared.fatal.is_cancelled() {
			return Err(shared.pump_error());
		}
		// The first call never grants: the peer starts with one slot.
		if shared.verbose.swap(true, Ordering::AcqRel)
			&& !shared.channel_closed.load(Ordering::Acquire)
			&& *shared.local_reserved.lock() < shared.capacity / 2
		{
			shared.request_data().await?;
		}

		let mut rx = self.rx.lock().await;
		let item = tokio::select! {
			biased;
			_ = shared.fatal.cancelled() => return Err(shared.pump_error()),
			item = with_timeout(timeout, "waiting on a buffered channel", rx.recv()) => item?,
		};
		match item {
			Some(event) => {
				shared.queued.fetch_sub(1, Ordering::AcqRel);
				let mut reserved = shared.local_reserved.lock();
				*reserved = reserved.saturating_sub(1);
				Ok(event)
			}
			None => Err(shared.pump_error()),
		}
	}

	fn close(&self) {
		self.pump.abort();
		self.shared.close_channel();
	}

	fn liveness(&self) -> Option<Liveness> {
		self.shared.channel.liveness()
	}
}

impl<C: EventChannel> Drop for BufferedChannel<C> {
	fn drop(&mut self) {
		self.close();
	}
}

async fn recv_pump<C: EventChannel>(shared: Arc<BufferedShared<C>>, tx: mpsc::UnboundedSender<Envelope>) {
	loop {
		let event = match shared.channel.recv(None).await {
			Ok(event) => event,
			Err(e) => {
				*shared.pump_error.lock() = Some(e);
				break;
			}
		};

		if event.name() == names::MORE {
			match event.args().first().and_then(Value::as_i64) {
				Some(granted) if granted > 0 => {
					let room = MAX_REMOTE_CREDIT.saturating_sub(shared.remote_open_slots.available_permits());
					match usize::try_from(granted) {
						Ok(granted) if granted <= room => {
							tracing::debug!(granted, "buffered.credit");
							shared.remote_open_slots.add_permits(granted);
						}
						_ => {
							tracing::error!(granted, room, "buffered.credit_overflow");
							shared.fail(Error::Protocol(format!("credit grant of {granted} exceeds the {room} slots left")));
							break;
						}
					}
				}
				Some(_) => {}
				None => tracing::warn!(event = %event, "buffered.malformed_credit"),
			}
			continue;
		}

		if shared.queued.load(Ordering::Acquire) >= shared.capacity {
			tracing::error!(capacity = shared.capacity, event = %event, "buffered.overflow");
			shared.fail(Error::Protocol(format!(
				"inbound queue overflow ({} envelopes) on {}",
				shared.capacity,
				event.name()
			)));
			break;
		}

		let last = shared.close_if.lock().as_ref().is_some_and(|close_if| close_if(&event));
		if last {
			shared.close_channel();
		}
		shared.queued.fetch_add(1, Ordering::AcqRel);
		if tx.send(event).is_err() || last {
			break;
		}
	}
}
