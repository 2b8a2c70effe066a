/// Execution classes for transport tasks, used for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Socket send/receive pumps that perform the actual transport I/O.
	SocketPump,
	/// The multiplexer loop routing inbound envelopes to channels.
	Dispatcher,
	/// Periodic liveness emitters.
	Heartbeat,
	/// Per-channel receive pumps (heartbeat and flow-control layers).
	ChannelPump,
	/// The server loop accepting new inbound calls.
	Acceptor,
	/// One RPC call, on either side of the wire.
	Call,
}

impl TaskClass {
	/// Stable name used in log fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::SocketPump => "socket_pump",
			Self::Dispatcher => "dispatcher",
			Self::Heartbeat => "heartbeat",
			Self::ChannelPump => "channel_pump",
			Self::Acceptor => "acceptor",
			Self::Call => "call",
		}
	}
}
