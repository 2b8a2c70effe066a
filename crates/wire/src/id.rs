//! Message id suppliers.

use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

/// Supplier of unique message ids.
///
/// Ids must be unique per process for the lifetime of that process; the
/// transport treats them as opaque strings.
pub trait MessageIds: Send + Sync {
	/// Produces the next id.
	fn next_id(&self) -> String;
}

/// Counter-based id generator.
///
/// Ids are a 32-bit counter, rendered as 8 hex digits, followed by a random
/// per-generator suffix. The counter starts at a random value and wraps to
/// zero instead of overflowing.
#[derive(Debug)]
pub struct CounterIdGen {
	counter: AtomicU32,
	base: String,
}

impl CounterIdGen {
	/// Creates a generator with a random seed and suffix.
	#[must_use]
	pub fn new() -> Self {
		let seed = Uuid::new_v4().as_u128() as u32;
		let base = Uuid::new_v4().to_string()[8..].to_string();
		Self::with_seed(seed, base)
	}

	/// Creates a generator with an explicit seed and suffix.
	#[must_use]
	pub fn with_seed(seed: u32, base: impl Into<String>) -> Self {
		Self {
			counter: AtomicU32::new(seed),
			base: base.into(),
		}
	}
}

impl Default for CounterIdGen {
	fn default() -> Self {
		Self::new()
	}
}

impl MessageIds for CounterIdGen {
	fn next_id(&self) -> String {
		let n = self.counter.fetch_add(1, Ordering::Relaxed);
		format!("{n:08x}{}", self.base)
	}
}
