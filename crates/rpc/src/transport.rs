//! Boundary with the underlying message-queue socket.
//!
//! The core never creates, binds or connects sockets. It only needs an object
//! that can asynchronously send and receive multipart binary messages, which
//! is what [`Transport`] describes. [`mem`] provides an in-process
//! implementation.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

pub mod mem;

/// Messaging pattern of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketPattern {
	/// Identity-addressed peer that receives from many dealers.
	Router,
	/// Asynchronous peer of a router.
	Dealer,
	/// Strict request side of request/reply.
	Req,
	/// Strict reply side of request/reply.
	Rep,
	/// Exclusive one-to-one peer.
	Pair,
	/// Fan-out sender.
	Push,
	/// Fan-in receiver.
	Pull,
	/// Broadcast sender.
	Pub,
	/// Broadcast receiver.
	Sub,
}

impl SocketPattern {
	/// Whether the socket can send messages.
	pub const fn can_send(self) -> bool {
		!matches!(self, Self::Pull | Self::Sub)
	}

	/// Whether unsolicited inbound messages are possible.
	pub const fn can_recv(self) -> bool {
		!matches!(self, Self::Push | Self::Pub)
	}

	/// Whether payloads are preceded by routing identity frames and an empty
	/// delimiter frame.
	pub const fn is_addressed(self) -> bool {
		matches!(self, Self::Router | Self::Dealer)
	}

	/// Stable name used in logs.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Router => "router",
			Self::Dealer => "dealer",
			Self::Req => "req",
			Self::Rep => "rep",
			Self::Pair => "pair",
			Self::Push => "push",
			Self::Pull => "pull",
			Self::Pub => "pub",
			Self::Sub => "sub",
		}
	}
}

/// A message-queue socket able to move framed multipart messages.
///
/// A multipart message is sent and received as a whole: implementations must
/// never interleave frames of two messages.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Messaging pattern of this socket.
	fn pattern(&self) -> SocketPattern;

	/// Sends one multipart message.
	async fn send(&self, parts: Vec<Bytes>) -> io::Result<()>;

	/// Receives one complete multipart message.
	async fn recv(&self) -> io::Result<Vec<Bytes>>;

	/// Closes the socket. Must be idempotent.
	fn close(&self);
}
