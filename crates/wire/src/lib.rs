//! Wire model for zrpc.
//!
//! An [`Envelope`] is the unit exchanged between peers: a message name, a
//! header map and positional arguments. On the wire it is the MessagePack
//! encoding of the 3-tuple `(header, name, args)`.
//!
//! * [`Envelope`]: creation, encoding and decoding
//! * [`Header`]: well-known header keys and pass-through fields
//! * [`MessageIds`]: supplier of unique message identifiers
//! * [`Compat`]: behaviour switches for peers speaking older protocol versions
//! * [`names`]: reserved control message names

#![warn(missing_docs)]

mod compat;
mod envelope;
mod error;
mod header;
mod id;
pub mod names;

pub use bytes::Bytes;
pub use compat::Compat;
pub use envelope::Envelope;
pub use error::WireError;
pub use header::Header;
pub use id::{CounterIdGen, MessageIds};
/// Dynamic value carried in headers and arguments.
pub use rmpv::Value;

/// Protocol version stamped on every envelope this crate creates.
pub const PROTOCOL_VERSION: u64 = 3;
