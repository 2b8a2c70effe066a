use bytes::Bytes;

use crate::header::{MESSAGE_ID, VERSION};
use crate::{Header, MessageIds, PROTOCOL_VERSION, Value, WireError};

/// One wire-level message: name, header and positional arguments.
///
/// `identity` holds the routing frames of identity-addressed sockets. It is
/// transport-only state and never part of the encoded blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	name: String,
	header: Header,
	args: Vec<Value>,
	identity: Option<Vec<Bytes>>,
}

impl Envelope {
	/// Creates an envelope with a fresh message id and the current protocol
	/// version, then overlays `overrides` on top of the header.
	pub fn create(ids: &dyn MessageIds, name: impl Into<String>, args: Vec<Value>, overrides: Option<Header>) -> Self {
		let mut header = Header::new();
		header.insert(MESSAGE_ID, ids.next_id());
		header.insert(VERSION, PROTOCOL_VERSION);
		if let Some(overrides) = overrides {
			header.merge(overrides);
		}
		Self {
			name: name.into(),
			header,
			args,
			identity: None,
		}
	}

	/// Assembles an envelope from already-built parts.
	pub fn from_parts(name: impl Into<String>, header: Header, args: Vec<Value>) -> Self {
		Self {
			name: name.into(),
			header,
			args,
			identity: None,
		}
	}

	/// Encodes `(header, name, args)` as MessagePack.
	pub fn encode(&self) -> Result<Vec<u8>, WireError> {
		Ok(rmp_serde::to_vec(&(&self.header, &self.name, &self.args))?)
	}

	/// Decodes an envelope.
	///
	/// A header that is not a map is replaced by an empty one, and a bare
	/// `args` value is wrapped into a one-element sequence.
	pub fn decode(blob: &[u8]) -> Result<Self, WireError> {
		let (header, name, args): (Value, String, Value) = rmp_serde::from_slice(blob)?;
		let args = match args {
			Value::Array(items) => items,
			Value::Nil => Vec::new(),
			other => vec![other],
		};
		Ok(Self {
			name,
			header: Header::from_value(header),
			args,
			identity: None,
		})
	}

	/// Message name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Renames the envelope, used when translating legacy control messages.
	pub fn set_name(&mut self, name: impl Into<String>) {
		self.name = name.into();
	}

	/// Header.
	pub fn header(&self) -> &Header {
		&self.header
	}

	/// Mutable header.
	pub fn header_mut(&mut self) -> &mut Header {
		&mut self.header
	}

	/// Positional arguments.
	pub fn args(&self) -> &[Value] {
		&self.args
	}

	/// Consumes the envelope, returning its arguments.
	pub fn into_args(self) -> Vec<Value> {
		self.args
	}

	/// Routing identity frames, if the envelope came from or goes to an
	/// identity-addressed socket.
	pub fn identity(&self) -> Option<&[Bytes]> {
		self.identity.as_deref()
	}

	/// Sets or clears the routing identity.
	pub fn set_identity(&mut self, identity: Option<Vec<Bytes>>) {
		self.identity = identity;
	}

	/// Shorthand for the header's `message_id`.
	pub fn message_id(&self) -> Option<&str> {
		self.header.message_id()
	}
}

impl std::fmt::Display for Envelope {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {:?}", self.name, self.header)
	}
}
