//! Peer liveness detection.
//!
//! [`HeartBeatOnChannel`] exchanges `_zpc_hb` envelopes over a channel. Once
//! the peer has been silent for two periods, the conversation is marked as
//! lost: every blocked or subsequent `recv`/`emit` fails with
//! [`Error::RemoteLost`], and anything waiting on [`Liveness::lost`] wakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zrpc_wire::{Compat, Envelope, Header, Value, names};
use zrpc_worker::{OwnedTask, TaskClass};

use crate::channel::{EventChannel, with_timeout};
use crate::{Error, Result};

/// Observer for the remote-lost condition of one conversation.
#[derive(Debug, Clone)]
pub struct Liveness {
	lost: CancellationToken,
	window: Duration,
}

impl Liveness {
	/// Returns true once the peer has been declared lost.
	pub fn is_lost(&self) -> bool {
		self.lost.is_cancelled()
	}

	/// The error raised for this conversation's loss.
	pub fn error(&self) -> Error {
		Error::RemoteLost(self.window)
	}

	/// Resolves once the peer has been declared lost.
	pub async fn lost(&self) -> Error {
		self.lost.cancelled().await;
		self.error()
	}
}

/// Resolves when `liveness` reports a loss; never resolves without one.
pub(crate) async fn wait_lost(liveness: Option<Liveness>) -> Error {
	match liveness {
		Some(liveness) => liveness.lost().await,
		None => std::future::pending().await,
	}
}

struct HeartbeatShared<C> {
	channel: C,
	freq: Option<Duration>,
	liveness: Liveness,
	closed: AtomicBool,
	last_seen: Mutex<Option<Instant>>,
	compat: OnceLock<Compat>,
	emitter: Mutex<Option<OwnedTask>>,
}

impl<C: EventChannel> HeartbeatShared<C> {
	fn start_heartbeat(self: &Arc<Self>) {
		let Some(freq) = self.freq else {
			return;
		};
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		let mut emitter = self.emitter.lock();
		if emitter.is_none() {
			*emitter = Some(OwnedTask::spawn(
				TaskClass::Heartbeat,
				"heartbeat.emit",
				heartbeat_loop(Arc::clone(self), freq),
			));
		}
	}

	fn check_lost(&self) -> Result<()> {
		if self.liveness.is_lost() {
			return Err(self.liveness.error());
		}
		Ok(())
	}
}

/// Liveness-monitoring decorator over a channel.
pub struct HeartBeatOnChannel<C: EventChannel> {
	shared: Arc<HeartbeatShared<C>>,
	pump: OwnedTask,
	rx: tokio::sync::Mutex<mpsc::Receiver<Result<Envelope>>>,
}

impl<C: EventChannel> HeartBeatOnChannel<C> {
	/// Wraps `channel`, emitting a heartbeat every `freq`.
	///
	/// A passive instance stays silent until the peer's first heartbeat. With
	/// `freq = None` no heartbeat is ever emitted and the peer is never
	/// declared lost.
	pub fn new(channel: C, freq: Option<Duration>, passive: bool) -> Self {
		let shared = Arc::new(HeartbeatShared {
			channel,
			freq,
			liveness: Liveness {
				lost: CancellationToken::new(),
				window: freq.map(|f| f * 2).unwrap_or_default(),
			},
			closed: AtomicBool::new(false),
			last_seen: Mutex::new(None),
			compat: OnceLock::new(),
			emitter: Mutex::new(None),
		});
		let (tx, rx) = mpsc::channel(1);
		let pump = OwnedTask::spawn(TaskClass::ChannelPump, "heartbeat.recv", recv_pump(Arc::clone(&shared), tx));
		if !passive {
			shared.start_heartbeat();
		}
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

	/// Peer behaviour, once the first envelope has been seen.
	pub fn compat(&self) -> Option<Compat> {
		self.shared.compat.get().copied()
	}

	/// Whether this side is currently emitting heartbeats.
	pub fn is_emitting(&self) -> bool {
		self.shared.emitter.lock().as_ref().is_some_and(|task| !task.is_finished())
	}
}

#[async_trait]
impl<C: EventChannel> EventChannel for HeartBeatOnChannel<C> {
	fn create_event(&self, name: &str, args: Vec<Value>, header: Option<Header>) -> Envelope {
		self.shared.channel.create_event(name, args, header)
	}

	async fn emit_event(&self, mut event: Envelope) -> Result<()> {
		self.shared.check_lost()?;
		if event.name() == names::MORE && self.compat().is_some_and(|c| c.heartbeat_carries_credit) {
			event.set_name(names::HEARTBEAT);
		}
		let liveness = self.shared.liveness.clone();
		tokio::select! {
			biased;
			_ = liveness.lost.cancelled() => Err(liveness.error()),
			res = self.shared.channel.emit_event(event) => res,
		}
	}

	async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope> {
		self.shared.check_lost()?;
		let liveness = &self.shared.liveness;
		let mut rx = self.rx.lock().await;
		tokio::select! {
			biased;
			_ = liveness.lost.cancelled() => Err(liveness.error()),
			item = with_timeout(timeout, "waiting on a heartbeat channel", rx.recv()) => match item? {
				Some(res) => res,
				None => Err(Error::Closed),
			},
		}
	}

	fn close(&self) {
		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.pump.abort();
		if let Some(emitter) = self.shared.emitter.lock().take() {
			emitter.abort();
		}
		self.shared.channel.close();
	}

	fn liveness(&self) -> Option<Liveness> {
		Some(self.shared.liveness.clone())
	}
}

impl<C: EventChannel> Drop for HeartBeatOnChannel<C> {
	fn drop(&mut self) {
		self.close();
	}
}

async fn heartbeat_loop<C: EventChannel>(shared: Arc<HeartbeatShared<C>>, freq: Duration) {
	loop {
		tokio::time::sleep(freq).await;
		let last_seen = *shared.last_seen.lock().get_or_insert_with(Instant::now);
		if last_seen.elapsed() > freq * 2 {
			tracing::warn!(silent_for = ?last_seen.elapsed(), window = ?freq * 2, "heartbeat.remote_lost");
			shared.liveness.lost.cancel();
			break;
		}
		// Version-2 peers read the argument as a credit grant.
		if let Err(e) = shared.channel.emit(names::HEARTBEAT, vec![Value::from(0)], None).await {
			tracing::debug!(error = %e, "heartbeat.emit_failed");
			break;
		}
	}
}

async fn recv_pump<C: EventChannel>(shared: Arc<HeartbeatShared<C>>, tx: mpsc::Sender<Result<Envelope>>) {
	loop {
		let mut event = match shared.channel.recv(None).await {
			Ok(event) => event,
			Err(e) => {
				let _ = tx.send(Err(e)).await;
				break;
			}
		};
		let compat = *shared.compat.get_or_init(|| Compat::detect(event.header()));
		*shared.last_seen.lock() = Some(Instant::now());

		if event.name() == names::HEARTBEAT {
			shared.start_heartbeat();
			if !compat.heartbeat_carries_credit {
				continue;
			}
			event.set_name(names::MORE);
		}
		if tx.send(Ok(event)).await.is_err() {
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use zrpc_wire::CounterIdGen;

	use super::*;
	use crate::channel::{Channel, ChannelMultiplexer};
	use crate::events::Events;
	use crate::transport::mem;

	struct Pair {
		server: ChannelMultiplexer,
		client: ChannelMultiplexer,
	}

	fn pair() -> Pair {
		let (router, handle) = mem::router();
		let server = Events::new(Arc::new(router), Arc::new(CounterIdGen::new()));
		let client = Events::new(Arc::new(handle.connect()), Arc::new(CounterIdGen::new()));
		Pair {
			server: ChannelMultiplexer::new(server, false),
			client: ChannelMultiplexer::new(client, true),
		}
	}

	async fn open(pair: &Pair) -> (Channel, Channel) {
		let client = pair.client.channel(None);
		client.emit("open", vec![], None).await.unwrap();
		let server = pair.server.channel(Some(pair.server.recv().await.unwrap()));
		(client, server)
	}

	const FREQ: Duration = Duration::from_millis(40);

	#[tokio::test]
	async fn heartbeats_are_swallowed_and_payload_flows() {
		let pair = pair();
		let (client, server) = open(&pair).await;
		let client = HeartBeatOnChannel::new(client, Some(FREQ), false);
		let server = HeartBeatOnChannel::new(server, Some(FREQ), false);

		assert_eq!(server.recv(None).await.unwrap().name(), "open");
		tokio::time::sleep(FREQ * 4).await;
		server.emit("payload", vec![], None).await.unwrap();
		let got = client.recv(Some(Duration::from_secs(1))).await.unwrap();
		assert_eq!(got.name(), "payload");
		assert!(client.liveness().is_some_and(|l| !l.is_lost()));
	}

	#[tokio::test]
	async fn silent_peer_is_declared_lost() {
		let pair = pair();
		let (client, server) = open(&pair).await;
		// The server side never heartbeats.
		let _silent = server;
		let client = HeartBeatOnChannel::new(client, Some(FREQ), false);

		let started = Instant::now();
		let err = client.recv(Some(Duration::from_secs(2))).await.unwrap_err();
		assert!(err.is_remote_lost(), "unexpected {err:?}");
		assert!(started.elapsed() < FREQ * 2 + Duration::from_millis(500));
		assert!(client.emit("late", vec![], None).await.unwrap_err().is_remote_lost());
	}

	#[tokio::test]
	async fn passive_side_waits_for_peer() {
		let pair = pair();
		let (client, server) = open(&pair).await;
		let server = HeartBeatOnChannel::new(server, Some(FREQ), true);
		assert!(!server.is_emitting());
		assert_eq!(server.recv(None).await.unwrap().name(), "open");

		let client = HeartBeatOnChannel::new(client, Some(FREQ), false);
		tokio::time::sleep(FREQ * 3).await;
		assert!(server.is_emitting());
		assert!(!client.liveness().is_some_and(|l| l.is_lost()));
	}

	#[tokio::test]
	async fn legacy_peer_heartbeat_doubles_as_credit() {
		let pair = pair();
		let client = pair.client.channel(None);
		let mut legacy = Header::new();
		legacy.insert("v", 2);
		client.emit("open", vec![], Some(legacy.clone())).await.unwrap();
		let server = pair.server.channel(Some(pair.server.recv().await.unwrap()));
		let server = HeartBeatOnChannel::new(server, None, true);
		assert_eq!(server.recv(None).await.unwrap().name(), "open");
		assert_eq!(server.compat(), Some(Compat::for_version(2)));

		client.emit(names::HEARTBEAT, vec![Value::from(5)], Some(legacy)).await.unwrap();
		let credit = server.recv(Some(Duration::from_secs(1))).await.unwrap();
		assert_eq!(credit.name(), names::MORE);
		assert_eq!(credit.args(), &[Value::from(5)]);

		server.emit(names::MORE, vec![Value::from(3)], None).await.unwrap();
		let seen = client.recv(Some(Duration::from_secs(1))).await.unwrap();
		assert_eq!(seen.name(), names::HEARTBEAT);
	}

	#[tokio::test]
	async fn close_stops_everything_and_is_idempotent() {
		let pair = pair();
		let (client, _server) = open(&pair).await;
		let client = HeartBeatOnChannel::new(client, Some(FREQ), false);
		assert!(client.is_emitting());
		client.close();
		client.close();
		assert!(!client.is_emitting());
		assert!(client.inner().is_closed());
		assert_eq!(pair.client.active_channels(), 0);
	}
}
