use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Value;

/// Key holding the unique id of an envelope.
pub const MESSAGE_ID: &str = "message_id";
/// Key holding the protocol version of the producer.
pub const VERSION: &str = "v";
/// Key correlating an envelope with the conversation it belongs to.
pub const RESPONSE_TO: &str = "response_to";
/// Optional flag set on streaming conversations.
pub const STREAM: &str = "stream";

/// Envelope header.
///
/// Keys other than the well-known ones are passed through untouched. The map
/// is ordered so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, Value>);

impl Header {
	/// Creates an empty header.
	pub fn new() -> Self {
		Self::default()
	}

	/// Builds a header from a decoded MessagePack value.
	///
	/// Anything other than a map yields an empty header; entries whose key is
	/// not a string are dropped.
	pub(crate) fn from_value(value: Value) -> Self {
		let Value::Map(entries) = value else {
			return Self::default();
		};
		let map = entries
			.into_iter()
			.filter_map(|(k, v)| match k {
				Value::String(s) => s.into_str().map(|s| (s, v)),
				Value::Binary(b) => String::from_utf8(b).ok().map(|s| (s, v)),
				_ => None,
			})
			.collect();
		Self(map)
	}

	/// Returns the value stored under `key`.
	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	/// Inserts a value, returning the previous one.
	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
		self.0.insert(key.into(), value.into())
	}

	/// Removes a key.
	pub fn remove(&mut self, key: &str) -> Option<Value> {
		self.0.remove(key)
	}

	/// Overlays every entry of `other` onto `self`.
	pub fn merge(&mut self, other: Header) {
		self.0.extend(other.0);
	}

	/// Returns true if the header has no entries.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Iterates over all entries in key order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}

	/// The envelope's unique id.
	pub fn message_id(&self) -> Option<&str> {
		self.get(MESSAGE_ID).and_then(Value::as_str)
	}

	/// The producer's protocol version.
	pub fn version(&self) -> Option<u64> {
		self.get(VERSION).and_then(Value::as_u64)
	}

	/// Id of the conversation this envelope answers, if any.
	pub fn response_to(&self) -> Option<&str> {
		self.get(RESPONSE_TO).and_then(Value::as_str)
	}

	/// Sets the conversation id.
	pub fn set_response_to(&mut self, id: impl Into<String>) {
		self.insert(RESPONSE_TO, Value::from(id.into()));
	}

	/// Whether the producer flagged this conversation as streaming.
	pub fn is_stream(&self) -> bool {
		self.get(STREAM).and_then(Value::as_bool).unwrap_or(false)
	}
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Header {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_value_keeps_string_keys_only() {
		let value = Value::Map(vec![
			(Value::from("trace_id"), Value::from("abc")),
			(Value::Binary(b"v".to_vec()), Value::from(3)),
			(Value::from(7), Value::from("dropped")),
		]);
		let header = Header::from_value(value);
		assert_eq!(header.get("trace_id").and_then(Value::as_str), Some("abc"));
		assert_eq!(header.version(), Some(3));
		assert_eq!(header.iter().count(), 2);
	}

	#[test]
	fn non_map_value_yields_empty_header() {
		assert!(Header::from_value(Value::from("legacy")).is_empty());
		assert!(Header::from_value(Value::Nil).is_empty());
	}

	#[test]
	fn merge_overlays_existing_keys() {
		let mut header: Header = [("a", 1), ("b", 2)].into_iter().collect();
		header.merge([("b", 20), ("c", 30)].into_iter().collect());
		assert_eq!(header.get("b").and_then(Value::as_i64), Some(20));
		assert_eq!(header.get("c").and_then(Value::as_i64), Some(30));
		assert!(!header.is_stream());
	}
}
