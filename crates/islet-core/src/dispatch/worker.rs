//! Per-task worker: one OS thread, one instance, one outcome.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, Scope};

use tokio::sync::oneshot;

use crate::codec::{Codec, EncodedValue};
use crate::config::RuntimeConfig;
use crate::error::{Error, FailureKind, Result};
use crate::module::{ModuleRegistry, panic_message};
use crate::runtime::{Context, Instance};

use super::{DispatchCallback, Outcome, TaskDescriptor, TaskFailure, TaskStage};

/// Read-only state every worker of a batch borrows from the dispatcher.
#[derive(Clone, Copy)]
pub(crate) struct WorkerShared<'a> {
    pub registry: &'a ModuleRegistry,
    pub codec: &'a dyn Codec,
    pub runtime: &'a RuntimeConfig,
    pub callback: Option<&'a dyn DispatchCallback>,
}

/// Spawn the worker for task `index` inside `scope`.
///
/// Returns the receiving half of the task's result channel, or the failure
/// to record when the OS refused to start the thread.
pub(crate) fn spawn<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    builder: thread::Builder,
    index: usize,
    task: TaskDescriptor,
    shared: WorkerShared<'env>,
) -> std::result::Result<oneshot::Receiver<Outcome>, TaskFailure> {
    let (tx, rx) = oneshot::channel();
    let batch_span = tracing::Span::current();

    let spawned = builder.spawn_scoped(scope, move || {
        let span = tracing::debug_span!(parent: &batch_span, "task", index);
        let _enter = span.enter();

        let mut reporter = Reporter::new(index, tx);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_task(index, &task, shared, &mut reporter)
        }));
        if let Err(payload) = result {
            let message = format!("worker panicked: {}", panic_message(payload.as_ref()));
            tracing::error!(error = %message, "Worker panicked");
            reporter.report(Outcome::Failure(TaskFailure::new(
                index,
                FailureKind::Worker,
                message,
            )));
        }
    });

    match spawned {
        Ok(_handle) => Ok(rx),
        Err(e) => Err(spawn_failure(index, e)),
    }
}

fn spawn_failure(index: usize, error: io::Error) -> TaskFailure {
    tracing::error!(index, error = %error, "Failed to spawn worker thread");
    TaskFailure::new(
        index,
        FailureKind::Worker,
        format!("failed to spawn worker thread: {}", error),
    )
}

/// Sending half of a task's result channel; delivers at most one outcome.
struct Reporter {
    index: usize,
    tx: Option<oneshot::Sender<Outcome>>,
}

impl Reporter {
    fn new(index: usize, tx: oneshot::Sender<Outcome>) -> Self {
        Self { index, tx: Some(tx) }
    }

    fn report(&mut self, outcome: Outcome) {
        let Some(tx) = self.tx.take() else {
            tracing::warn!(index = self.index, "Outcome already reported, dropping");
            return;
        };
        if tx.send(outcome).is_err() {
            tracing::warn!(index = self.index, "Result channel closed before report");
        }
    }
}

/// Tears the instance down when dropped, on every exit path.
struct InstanceGuard<'a> {
    instance: Option<Instance>,
    index: usize,
    callback: Option<&'a dyn DispatchCallback>,
}

impl<'a> InstanceGuard<'a> {
    fn new(instance: Instance, index: usize, callback: Option<&'a dyn DispatchCallback>) -> Self {
        Self {
            instance: Some(instance),
            index,
            callback,
        }
    }

    fn run_within<R>(&mut self, f: impl FnOnce(&mut Context<'_>) -> Result<R>) -> Result<R> {
        match self.instance.as_mut() {
            Some(instance) => instance.run_within(f),
            None => Err(Error::WorkerLost("instance already torn down".to_string())),
        }
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            let id = instance.id();
            instance.destroy();
            tracing::trace!(stage = ?TaskStage::TornDown, instance = %id, "Stage reached");
            if let Some(callback) = self.callback {
                callback.on_instance_destroyed(self.index, id);
            }
        }
    }
}

/// Run one task to completion on the current thread.
fn run_task(
    index: usize,
    task: &TaskDescriptor,
    shared: WorkerShared<'_>,
    reporter: &mut Reporter,
) {
    if let Some(callback) = shared.callback {
        callback.on_task_started(index, task);
    }

    let instance = match Instance::create(shared.runtime) {
        Ok(instance) => instance,
        Err(e) => {
            // Nothing was created, so there is nothing to tear down.
            finish(index, Err(e), TaskStage::Created, shared, reporter);
            return;
        }
    };
    let id = instance.id();
    if let Some(callback) = shared.callback {
        callback.on_instance_created(index, id);
    }

    let mut guard = InstanceGuard::new(instance, index, shared.callback);
    let mut stage = TaskStage::InstanceReady;
    let result = guard.run_within(|cx| execute_in_instance(cx, task, shared, &mut stage));

    finish(index, result, stage, shared, reporter);
    drop(guard);
}

/// Resolve, decode, invoke and encode inside the task's instance.
///
/// `stage` is left at the last stage reached, for failure reporting.
fn execute_in_instance(
    cx: &mut Context<'_>,
    task: &TaskDescriptor,
    shared: WorkerShared<'_>,
    stage: &mut TaskStage,
) -> Result<EncodedValue> {
    let callable = shared
        .registry
        .resolve(cx, task.namespace(), task.name())?;
    *stage = TaskStage::Resolved;

    let arguments = shared.codec.decode(task.arguments())?;
    cx.track(&arguments);
    let args = arguments.into_args();
    *stage = TaskStage::ArgsDecoded;

    let value = callable.invoke(cx, &args)?;
    cx.track(&value);
    *stage = TaskStage::Invoked;

    let encoded = shared.codec.encode(&value)?;
    *stage = TaskStage::ResultEncoded;

    tracing::debug!(
        instance = %cx.instance_id(),
        callable = %format_args!("{}.{}", task.namespace(), task.name()),
        bytes = encoded.len(),
        "Task executed"
    );
    Ok(encoded)
}

fn finish(
    index: usize,
    result: Result<EncodedValue>,
    stage: TaskStage,
    shared: WorkerShared<'_>,
    reporter: &mut Reporter,
) {
    let outcome = match result {
        Ok(encoded) => {
            if let Some(callback) = shared.callback {
                callback.on_task_completed(index);
            }
            Outcome::Success(encoded)
        }
        Err(e) => {
            let failure = TaskFailure::from_error(index, &e);
            tracing::warn!(
                last_stage = ?stage,
                kind = %failure.kind,
                error = %failure.message,
                "Task failed"
            );
            if let Some(callback) = shared.callback {
                callback.on_task_failed(index, &failure);
            }
            Outcome::Failure(failure)
        }
    };
    reporter.report(outcome);
    tracing::trace!(stage = ?TaskStage::Reported, "Stage reached");
}
