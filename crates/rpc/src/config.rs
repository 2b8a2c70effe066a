//! Runtime configuration for clients and servers.

use std::time::Duration;

use serde::Deserialize;

/// Errors raised while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	/// The TOML document could not be parsed.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),
	/// A field holds a value outside its valid range.
	#[error("invalid value for {field}: {reason}")]
	Invalid {
		/// Offending field.
		field: &'static str,
		/// Why it was rejected.
		reason: &'static str,
	},
}

/// Tunables shared by [`Client`](crate::Client) and [`Server`](crate::Server).
///
/// ```toml
/// heartbeat_secs = 5.0
/// passive_heartbeat = false
/// timeout_secs = 30.0
/// inqueue_size = 100
/// pool_size = 64
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
	/// Heartbeat period in seconds; `None` disables liveness emission.
	pub heartbeat_secs: Option<f64>,
	/// Only start heartbeating once the peer has.
	pub passive_heartbeat: bool,
	/// Client call timeout in seconds.
	pub timeout_secs: f64,
	/// Per-channel inbound buffer capacity, in envelopes.
	pub inqueue_size: usize,
	/// Maximum number of concurrently served calls; unbounded when `None`.
	pub pool_size: Option<usize>,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			heartbeat_secs: Some(5.0),
			passive_heartbeat: false,
			timeout_secs: 30.0,
			inqueue_size: crate::DEFAULT_INQUEUE_SIZE,
			pool_size: None,
		}
	}
}

impl RpcConfig {
	/// Parses and validates a TOML document. Missing fields take defaults.
	pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(src)?;
		config.validate()?;
		Ok(config)
	}

	/// Checks value ranges.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
			return Err(ConfigError::Invalid {
				field: "timeout_secs",
				reason: "must be a positive number of seconds",
			});
		}
		if let Some(hb) = self.heartbeat_secs
			&& (!hb.is_finite() || hb <= 0.0)
		{
			return Err(ConfigError::Invalid {
				field: "heartbeat_secs",
				reason: "must be a positive number of seconds",
			});
		}
		if self.inqueue_size == 0 {
			return Err(ConfigError::Invalid {
				field: "inqueue_size",
				reason: "must be at least 1",
			});
		}
		if self.pool_size == Some(0) {
			return Err(ConfigError::Invalid {
				field: "pool_size",
				reason: "must be at least 1",
			});
		}
		Ok(())
	}

	/// Heartbeat period.
	pub fn heartbeat(&self) -> Option<Duration> {
		self.heartbeat_secs.map(Duration::from_secs_f64)
	}

	/// Call timeout.
	pub fn timeout(&self) -> Duration {
		Duration::from_secs_f64(self.timeout_secs)
	}

	/// Sets the heartbeat period.
	#[must_use]
	pub fn with_heartbeat(mut self, freq: Option<Duration>) -> Self {
		self.heartbeat_secs = freq.map(|d| d.as_secs_f64());
		self
	}

	/// Sets the call timeout.
	#[must_use]
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout_secs = timeout.as_secs_f64();
		self
	}

	/// Sets the inbound buffer capacity.
	#[must_use]
	pub fn with_inqueue_size(mut self, size: usize) -> Self {
		self.inqueue_size = size;
		self
	}

	/// Bounds the server task pool.
	#[must_use]
	pub fn with_pool_size(mut self, size: Option<usize>) -> Self {
		self.pool_size = size;
		self
	}

	/// Sets passive heartbeat mode.
	#[must_use]
	pub fn with_passive_heartbeat(mut self, passive: bool) -> Self {
		self.passive_heartbeat = passive;
		self
	}
}
