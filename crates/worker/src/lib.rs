//! Task primitives shared by the zrpc transport layers.
//!
//! Every long-lived loop in the transport stack (socket pumps, the channel
//! dispatcher, heartbeat emitters, per-call server tasks) is spawned through
//! this crate so that it carries a [`TaskClass`] in logs and so that its
//! owner can tear it down deterministically via [`OwnedTask`].

#![warn(missing_docs)]

mod class;
mod join_set;
mod spawn;
mod task;

pub use class::TaskClass;
pub use join_set::WorkerJoinSet;
pub use spawn::spawn;
pub use task::OwnedTask;
