use crate::Header;

/// Behaviour switches for peers speaking an older protocol version.
///
/// Resolved once per conversation from the first inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compat {
	/// The peer uses the heartbeat message for credit grants as well (`v < 3`).
	pub heartbeat_carries_credit: bool,
	/// Error replies carry a single opaque string (`v < 2`).
	pub single_arg_errors: bool,
}

impl Compat {
	/// Behaviour for peers at the current protocol version.
	pub const CURRENT: Self = Self {
		heartbeat_carries_credit: false,
		single_arg_errors: false,
	};

	/// Looks up the behaviour for protocol version `v`.
	pub const fn for_version(v: u64) -> Self {
		Self {
			heartbeat_carries_credit: v < 3,
			single_arg_errors: v < 2,
		}
	}

	/// Resolves the behaviour from an envelope header; a missing version counts as 0.
	pub fn detect(header: &Header) -> Self {
		Self::for_version(header.version().unwrap_or(0))
	}
}
