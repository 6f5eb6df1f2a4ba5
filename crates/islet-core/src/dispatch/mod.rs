//! Parallel dispatch of task batches across isolated runtime instances.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher::run(batch)
//!     │
//!     ├── worker thread 0 ── Instance ── resolve → decode → invoke → encode
//!     ├── worker thread 1 ── Instance ── resolve → decode → invoke → encode
//!     │   ...                                      │
//!     │                                            └── Outcome over a oneshot channel
//!     │
//!     └── join barrier ── outcomes in submission order ── BatchResult
//! ```
//!
//! Every task gets its own OS thread and its own [`Instance`](crate::Instance);
//! neither outlives `run`. Only encoded bytes cross back to the dispatcher
//! thread.
//!
//! # Module Structure
//!
//! - `callback` - progress reporting trait
//! - `dispatcher` - fan-out/fan-in and aggregation
//! - `worker` - per-task pipeline and instance lifecycle

mod callback;
mod dispatcher;
mod worker;

use std::fmt;

use crate::codec::EncodedValue;
use crate::error::{Error, FailureKind};

pub use callback::DispatchCallback;
pub use dispatcher::Dispatcher;

/// One requested unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    namespace: String,
    name: String,
    arguments: EncodedValue,
}

impl TaskDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        arguments: EncodedValue,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &EncodedValue {
        &self.arguments
    }
}

/// Where a task is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStage {
    Created,
    InstanceReady,
    Resolved,
    ArgsDecoded,
    Invoked,
    ResultEncoded,
    Reported,
    TornDown,
}

/// Why one task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Position of the task in the submitted batch.
    pub index: usize,
    /// Pipeline stage the failure came from.
    pub kind: FailureKind,
    /// Textual description of the error.
    pub message: String,
}

impl TaskFailure {
    pub fn new(index: usize, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn from_error(index: usize, error: &Error) -> Self {
        Self::new(index, error.kind(), error.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed ({}): {}",
            self.index, self.kind, self.message
        )
    }
}

/// Result of one task, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(EncodedValue),
    Failure(TaskFailure),
}

/// Consolidated report of every failed task in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    failures: Vec<TaskFailure>,
}

impl BatchError {
    /// Failures ordered by task index.
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Indices of the failed tasks, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }

    pub fn into_failures(self) -> Vec<TaskFailure> {
        self.failures
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Output of [`Dispatcher::run`]: every result in submission order, or
/// every failure.
pub type BatchResult = std::result::Result<Vec<EncodedValue>, BatchError>;

/// All-or-nothing aggregation of per-task outcomes.
///
/// Any failure discards every success; the error lists all failures.
pub(crate) fn aggregate(outcomes: Vec<Outcome>) -> BatchResult {
    let mut results = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Success(encoded) => results.push(encoded),
            Outcome::Failure(failure) => failures.push(failure),
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        failures.sort_by_key(|f| f.index);
        Err(BatchError { failures })
    }
}
