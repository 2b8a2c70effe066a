//! Reserved message names.
//!
//! None of these are ever dispatched to application handlers.

/// Liveness probe exchanged by heartbeat layers.
pub const HEARTBEAT: &str = "_zpc_hb";
/// Flow-control credit grant, `args = (slots,)`.
pub const MORE: &str = "_zpc_more";
/// Successful request/reply answer, `args = (value,)`.
pub const OK: &str = "OK";
/// Error answer, `args = (kind, message, traceback)`.
pub const ERR: &str = "ERR";
/// One item of a streamed answer.
pub const STREAM: &str = "STREAM";
/// Terminal envelope of a successful stream.
pub const STREAM_DONE: &str = "STREAM_DONE";

/// Returns true if `name` is reserved by the transport.
pub fn is_reserved(name: &str) -> bool {
	matches!(name, HEARTBEAT | MORE | OK | ERR | STREAM | STREAM_DONE)
}
