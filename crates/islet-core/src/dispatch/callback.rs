//! Progress reporting for batch dispatch.

use crate::runtime::InstanceId;

use super::{TaskDescriptor, TaskFailure};

/// Callback trait for dispatch progress reporting.
///
/// Task and instance methods are called from worker threads, concurrently
/// for different indices.
pub trait DispatchCallback: Send + Sync {
    /// Called on the dispatcher thread before any worker is spawned.
    fn on_batch_started(&self, _batch_size: usize) {}

    /// Called when a worker begins its task.
    fn on_task_started(&self, _index: usize, _task: &TaskDescriptor) {}

    /// Called after the task's instance was created.
    fn on_instance_created(&self, _index: usize, _instance: InstanceId) {}

    /// Called after the task's instance was torn down.
    fn on_instance_destroyed(&self, _index: usize, _instance: InstanceId) {}

    /// Called when a task succeeded.
    fn on_task_completed(&self, _index: usize) {}

    /// Called when a task failed.
    fn on_task_failed(&self, _index: usize, _failure: &TaskFailure) {}

    /// Called on the dispatcher thread after the join barrier.
    fn on_batch_completed(&self, _batch_size: usize, _failed: usize) {}
}
