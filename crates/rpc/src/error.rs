//! Error types.

use std::io;
use std::time::Duration;

use zrpc_wire::{Compat, Envelope, Value, WireError};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The peer stopped proving liveness within the detection window.
	#[error("lost remote after {0:?} heartbeat")]
	RemoteLost(Duration),
	/// A bounded wait exceeded its deadline.
	#[error("timeout after {timeout:?} when {when}")]
	Timeout {
		/// The deadline that expired.
		timeout: Duration,
		/// What was being waited for.
		when: String,
	},
	/// The peer's handler failed.
	#[error("{0}")]
	Remote(#[from] RemoteError),
	/// The peer did not honor the protocol (e.g. overflowed its credit).
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// An envelope could not be encoded or decoded.
	#[error("{0}")]
	Wire(#[from] WireError),
	/// The underlying transport failed.
	#[error("transport error: {0}")]
	Transport(#[from] io::Error),
	/// The channel or socket was closed locally.
	#[error("channel closed")]
	Closed,
	/// A registered hook rejected the operation.
	#[error("hook failed: {0}")]
	Hook(String),
}

impl Error {
	pub(crate) fn timeout(timeout: Duration, when: impl Into<String>) -> Self {
		Self::Timeout {
			timeout,
			when: when.into(),
		}
	}

	/// Copy of this error for reporting it again.
	///
	/// Wire and transport errors keep their message; wire errors are reported
	/// as [`Error::Protocol`].
	pub(crate) fn replicate(&self) -> Self {
		match self {
			Self::RemoteLost(after) => Self::RemoteLost(*after),
			Self::Timeout { timeout, when } => Self::timeout(*timeout, when.clone()),
			Self::Remote(remote) => Self::Remote(remote.clone()),
			Self::Protocol(msg) => Self::Protocol(msg.clone()),
			Self::Wire(e) => Self::Protocol(e.to_string()),
			Self::Transport(e) => Self::Transport(io::Error::new(e.kind(), e.to_string())),
			Self::Closed => Self::Closed,
			Self::Hook(msg) => Self::Hook(msg.clone()),
		}
	}

	/// Returns true for [`Error::RemoteLost`].
	pub fn is_remote_lost(&self) -> bool {
		matches!(self, Self::RemoteLost(_))
	}

	/// Returns true for [`Error::Timeout`].
	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout { .. })
	}
}

/// Failure reported by a remote handler.
///
/// Handlers return it to describe their failure; clients receive it decoded
/// from an error reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
	/// Error kind, e.g. `RuntimeError`.
	pub name: String,
	/// Human readable message.
	pub message: String,
	/// Optional human readable trace.
	pub traceback: Option<String>,
}

impl RemoteError {
	/// Creates an error without a trace.
	pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			message: message.into(),
			traceback: None,
		}
	}

	/// Attaches a human readable trace.
	#[must_use]
	pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
		self.traceback = Some(traceback.into());
		self
	}

	/// Arguments of the error reply sent to a peer with behaviour `compat`.
	pub(crate) fn to_args(&self, compat: Compat) -> Vec<Value> {
		let traceback = self.traceback.clone().unwrap_or_else(|| self.to_string());
		if compat.single_arg_errors {
			return vec![Value::from(traceback)];
		}
		vec![
			Value::from(self.name.as_str()),
			Value::from(self.message.as_str()),
			Value::from(traceback),
		]
	}

	/// Decodes an error reply, honoring the single-string legacy layout.
	pub(crate) fn from_reply(reply: &Envelope) -> Self {
		let text = |v: Option<&Value>| v.map(value_text).unwrap_or_default();
		let args = reply.args();
		if Compat::detect(reply.header()).single_arg_errors || args.len() < 3 {
			return Self::new("RemoteError", text(args.first()));
		}
		let traceback = match &args[2] {
			Value::Nil => None,
			v => Some(value_text(v)),
		};
		Self {
			name: text(args.first()),
			message: text(args.get(1)),
			traceback,
		}
	}
}

fn value_text(value: &Value) -> String {
	match value {
		Value::String(s) => s.as_str().map(str::to_owned).unwrap_or_else(|| String::from_utf8_lossy(s.as_bytes()).into_owned()),
		Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use zrpc_wire::Header;

	use super::*;

	fn reply(version: u64, args: Vec<Value>) -> Envelope {
		let mut header = Header::new();
		header.insert("v", version);
		Envelope::from_parts(zrpc_wire::names::ERR, header, args)
	}

	#[test]
	fn decodes_three_part_error() {
		let env = reply(3, vec![Value::from("RuntimeError"), Value::from("boom"), Value::Nil]);
		let err = RemoteError::from_reply(&env);
		assert_eq!(err, RemoteError::new("RuntimeError", "boom"));
		assert_eq!(err.to_string(), "RuntimeError: boom");
	}

	#[test]
	fn decodes_legacy_single_string_error() {
		let env = reply(1, vec![Value::from("Traceback: it broke")]);
		let err = RemoteError::from_reply(&env);
		assert_eq!(err.name, "RemoteError");
		assert_eq!(err.message, "Traceback: it broke");
		assert_eq!(err.traceback, None);
	}

	#[test]
	fn legacy_peers_get_single_argument() {
		let err = RemoteError::new("ValueError", "bad").with_traceback("tb");
		assert_eq!(err.to_args(Compat::for_version(1)), vec![Value::from("tb")]);
		assert_eq!(err.to_args(Compat::CURRENT).len(), 3);
	}
}
