//! In-process transport.
//!
//! [`router`] creates a router socket that any number of dealers can connect
//! to, each receiving a unique routing identity. [`pipe`] connects two sockets
//! one-to-one (dealer/dealer, push/pull, pub/sub, pair/pair).

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SocketPattern, Transport};

/// Capacity of each in-memory socket queue, in messages.
pub const MEM_QUEUE_LEN: usize = 1024;

type Frames = Vec<Bytes>;
type PeerMap = Arc<Mutex<HashMap<Bytes, mpsc::Sender<Frames>>>>;

enum Route {
	/// Straight to the other end of a pipe.
	Peer(mpsc::Sender<Frames>),
	/// Dealer side: frames are prefixed with our identity on arrival.
	ToRouter {
		identity: Bytes,
		tx: mpsc::Sender<Frames>,
		peers: PeerMap,
	},
	/// Router side: the first frame selects the dealer.
	FromRouter(PeerMap),
	/// Receive-only socket.
	Nowhere,
}

/// One end of an in-process connection.
pub struct MemTransport {
	pattern: SocketPattern,
	inbox: tokio::sync::Mutex<mpsc::Receiver<Frames>>,
	route: Mutex<Option<Route>>,
	closed: CancellationToken,
}

impl MemTransport {
	fn new(pattern: SocketPattern, inbox: mpsc::Receiver<Frames>, route: Route) -> Self {
		Self {
			pattern,
			inbox: tokio::sync::Mutex::new(inbox),
			route: Mutex::new(Some(route)),
			closed: CancellationToken::new(),
		}
	}
}

/// Handle used to connect dealers to a router created by [`router`].
#[derive(Clone)]
pub struct MemRouter {
	tx: mpsc::Sender<Frames>,
	peers: PeerMap,
	next_peer: Arc<AtomicU64>,
}

impl MemRouter {
	/// Connects a new dealer socket to the router.
	pub fn connect(&self) -> MemTransport {
		let n = self.next_peer.fetch_add(1, Ordering::Relaxed);
		let identity = Bytes::from(format!("peer-{n}"));
		let (tx, rx) = mpsc::channel(MEM_QUEUE_LEN);
		self.peers.lock().insert(identity.clone(), tx);
		tracing::debug!(identity = ?identity, "mem.router.connect");
		MemTransport::new(
			SocketPattern::Dealer,
			rx,
			Route::ToRouter {
				identity,
				tx: self.tx.clone(),
				peers: Arc::clone(&self.peers),
			},
		)
	}

	/// Number of currently connected dealers.
	pub fn peer_count(&self) -> usize {
		self.peers.lock().len()
	}
}

/// Creates a router socket and the handle used to connect dealers to it.
pub fn router() -> (MemTransport, MemRouter) {
	let (tx, rx) = mpsc::channel(MEM_QUEUE_LEN);
	let peers: PeerMap = Arc::default();
	let router = MemTransport::new(SocketPattern::Router, rx, Route::FromRouter(Arc::clone(&peers)));
	let handle = MemRouter {
		tx,
		peers,
		next_peer: Arc::new(AtomicU64::new(1)),
	};
	(router, handle)
}

/// Connects two sockets one-to-one.
///
/// Messages flow both ways unless one side cannot send (e.g. `Pull`, `Sub`).
pub fn pipe(a: SocketPattern, b: SocketPattern) -> (MemTransport, MemTransport) {
	let (a_tx, a_rx) = mpsc::channel(MEM_QUEUE_LEN);
	let (b_tx, b_rx) = mpsc::channel(MEM_QUEUE_LEN);
	let route = |pattern: SocketPattern, tx| if pattern.can_send() { Route::Peer(tx) } else { Route::Nowhere };
	(MemTransport::new(a, a_rx, route(a, b_tx)), MemTransport::new(b, b_rx, route(b, a_tx)))
}

fn broken_pipe() -> io::Error {
	io::Error::new(io::ErrorKind::BrokenPipe, "socket closed")
}

#[async_trait]
impl Transport for MemTransport {
	fn pattern(&self) -> SocketPattern {
		self.pattern
	}

	async fn send(&self, mut parts: Vec<Bytes>) -> io::Result<()> {
		if self.closed.is_cancelled() {
			return Err(broken_pipe());
		}
		let tx = {
			let route = self.route.lock();
			match route.as_ref() {
				None => return Err(broken_pipe()),
				Some(Route::Nowhere) => {
					return Err(io::Error::new(
						io::ErrorKind::Unsupported,
						format!("{} sockets cannot send", self.pattern.as_str()),
					));
				}
				Some(Route::Peer(tx)) => tx.clone(),
				Some(Route::ToRouter { identity, tx, .. }) => {
					parts.insert(0, identity.clone());
					tx.clone()
				}
				Some(Route::FromRouter(peers)) => {
					if parts.is_empty() {
						return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing routing identity"));
					}
					let identity = parts.remove(0);
					match peers.lock().get(&identity) {
						Some(tx) => tx.clone(),
						None => {
							tracing::debug!(identity = ?identity, "mem.router.unknown_peer");
							return Ok(());
						}
					}
				}
			}
		};
		tx.send(parts).await.map_err(|_| broken_pipe())
	}

	async fn recv(&self) -> io::Result<Vec<Bytes>> {
		if !self.pattern.can_recv() {
			return Err(io::Error::new(
				io::ErrorKind::Unsupported,
				format!("{} sockets cannot receive", self.pattern.as_str()),
			));
		}
		let mut inbox = self.inbox.lock().await;
		tokio::select! {
			biased;
			_ = self.closed.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")),
			msg = inbox.recv() => msg.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "peer disconnected")),
		}
	}

	fn close(&self) {
		if self.closed.is_cancelled() {
			return;
		}
		self.closed.cancel();
		if let Some(Route::ToRouter { identity, peers, .. }) = self.route.lock().take() {
			peers.lock().remove(&identity);
		}
		tracing::debug!(pattern = self.pattern.as_str(), "mem.close");
	}
}
