//! Multiplexed, heartbeat-monitored, flow-controlled RPC over message sockets.
//!
//! The stack, from the socket up:
//! * [`Transport`]: the message-queue socket collaborator ([`mem`] ships an
//!   in-process one)
//! * [`Events`]: background pumps turning a socket into async send/receive
//! * [`ChannelMultiplexer`] / [`Channel`]: many correlated conversations over
//!   one socket
//! * [`HeartBeatOnChannel`]: peer liveness detection
//! * [`BufferedChannel`]: credit-based flow control
//! * [`Client`] / [`Server`]: request/reply and request/stream calls built on
//!   the layers above, with [`hooks`] at well-defined points
//! * [`Publisher`] / [`Subscriber`]: one-way calls over push/pull and pub/sub

#![warn(missing_docs)]

mod buffered;
mod channel;
mod client;
mod config;
mod error;
mod events;
mod heartbeat;
pub mod hooks;
mod methods;
mod oneway;
mod pattern;
mod server;
pub mod transport;

pub use buffered::{BufferedChannel, DEFAULT_INQUEUE_SIZE};
pub use channel::{Channel, ChannelMultiplexer, EventChannel};
pub use client::{Client, PendingCall};
pub use config::{ConfigError, RpcConfig};
pub use error::{Error, RemoteError, Result};
pub use events::Events;
pub use heartbeat::{HeartBeatOnChannel, Liveness};
pub use hooks::{Context, Middleware};
pub use methods::{Method, Methods, StreamReply, UnaryReply};
pub use oneway::{Publisher, Puller, Pusher, Subscriber};
pub use pattern::{Pattern, Reply, ReplyStream};
pub use server::Server;
pub use transport::{SocketPattern, Transport, mem};
pub use zrpc_wire as wire;
pub use zrpc_wire::{Envelope, Header, Value};
