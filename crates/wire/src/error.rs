use thiserror::Error;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum WireError {
	/// MessagePack serialization failed.
	#[error("encode failed: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	/// The blob is not a valid `(header, name, args)` tuple.
	#[error("decode failed: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
}
