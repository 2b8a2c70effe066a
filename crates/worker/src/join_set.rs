use std::future::Future;

use tokio::task::{JoinError, JoinSet};

use crate::TaskClass;

/// Classified wrapper around a Tokio [`JoinSet`].
///
/// Used as a task pool: tasks are aborted when the set is dropped.
#[derive(Debug)]
pub struct WorkerJoinSet<T> {
	class: TaskClass,
	inner: JoinSet<T>,
}

impl<T> WorkerJoinSet<T>
where
	T: Send + 'static,
{
	/// Creates an empty worker join set for the given task class.
	pub fn new(class: TaskClass) -> Self {
		Self { class, inner: JoinSet::new() }
	}

	/// Returns the number of tasks currently in the set.
	pub fn len(&self) -> usize {
		self.inner.len()
	}

	/// Returns `true` if the set is empty.
	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	/// Spawns a future into the set.
	#[allow(clippy::disallowed_methods)]
	pub fn spawn<F>(&mut self, fut: F)
	where
		F: Future<Output = T> + Send + 'static,
	{
		tracing::trace!(worker_class = self.class.as_str(), pending = self.inner.len(), "worker.join_set.spawn");
		self.inner.spawn(fut);
	}

	/// Waits for the next completed task.
	pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
		self.inner.join_next().await
	}

	/// Reaps completed tasks without waiting, returning how many were reaped.
	pub fn reap(&mut self) -> usize {
		let mut reaped = 0;
		while let Some(res) = self.inner.try_join_next() {
			if let Err(e) = res
				&& e.is_panic()
			{
				tracing::error!(worker_class = self.class.as_str(), error = %e, "worker.join_set.panic");
			}
			reaped += 1;
		}
		reaped
	}

	/// Waits for every task in the set to finish.
	pub async fn drain(&mut self) {
		while let Some(res) = self.inner.join_next().await {
			if let Err(e) = res
				&& e.is_panic()
			{
				tracing::error!(worker_class = self.class.as_str(), error = %e, "worker.join_set.panic");
			}
		}
	}
}
