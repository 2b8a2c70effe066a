use std::future::Future;

use tokio::task::JoinHandle;

use crate::TaskClass;

/// A background task exclusively owned by a transport object.
///
/// The task is aborted when [`OwnedTask::abort`] is called or when the handle
/// is dropped. Aborting is idempotent and never affects a task that already
/// returned.
#[derive(Debug)]
pub struct OwnedTask {
	name: &'static str,
	class: TaskClass,
	handle: JoinHandle<()>,
}

impl OwnedTask {
	/// Spawns `fut` as an owned task.
	pub fn spawn<F>(class: TaskClass, name: &'static str, fut: F) -> Self
	where
		F: Future<Output = ()> + Send + 'static,
	{
		tracing::trace!(worker_class = class.as_str(), task = name, "worker.owned.spawn");
		Self {
			name,
			class,
			handle: crate::spawn(class, fut),
		}
	}

	/// Returns the task name given at spawn time.
	pub const fn name(&self) -> &'static str {
		self.name
	}

	/// Returns true once the task has completed or was aborted.
	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Requests the task to stop at its next suspension point.
	pub fn abort(&self) {
		if !self.handle.is_finished() {
			tracing::trace!(worker_class = self.class.as_str(), task = self.name, "worker.owned.abort");
			self.handle.abort();
		}
	}
}

impl Drop for OwnedTask {
	fn drop(&mut self) {
		self.abort();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn drop_aborts_pending_task() {
		let reached = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&reached);
		let task = OwnedTask::spawn(TaskClass::Heartbeat, "sleeper", async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			flag.store(true, Ordering::SeqCst);
		});
		drop(task);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(!reached.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn abort_is_idempotent() {
		let task = OwnedTask::spawn(TaskClass::ChannelPump, "pending", std::future::pending());
		task.abort();
		task.abort();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(task.is_finished());
		assert_eq!(task.name(), "pending");
	}
}
