//! Fan-out/fan-in dispatcher.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::module::ModuleRegistry;
use crate::value::Value;

use super::worker::{self, WorkerShared};
use super::{BatchResult, DispatchCallback, Outcome, TaskDescriptor, TaskFailure, aggregate};

/// Runs batches of tasks, one isolated instance and one OS thread per task.
///
/// A dispatcher is reusable and holds no per-batch state. Results come back
/// in submission order, and a batch succeeds only if every task succeeds.
pub struct Dispatcher<C: Codec = JsonCodec> {
    registry: ModuleRegistry,
    codec: C,
    config: DispatcherConfig,
    callback: Option<Arc<dyn DispatchCallback>>,
}

impl Dispatcher<JsonCodec> {
    /// Create a dispatcher with the JSON codec and default configuration.
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            registry,
            codec: JsonCodec,
            config: DispatcherConfig::default(),
            callback: None,
        }
    }
}

impl<C: Codec> Dispatcher<C> {
    /// Replace the codec.
    pub fn with_codec<D: Codec>(self, codec: D) -> Dispatcher<D> {
        Dispatcher {
            registry: self.registry,
            codec,
            config: self.config,
            callback: self.callback,
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the progress callback.
    pub fn set_callback(&mut self, callback: impl DispatchCallback + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Execute a batch.
    ///
    /// Spawns one worker per task, waits for all of them, then aggregates.
    /// An empty batch returns an empty result without spawning anything.
    pub fn run(&self, batch: Vec<TaskDescriptor>) -> BatchResult {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = batch.len();
        let batch_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", id = %batch_id, tasks = batch_size);
        let _enter = span.enter();
        let started = Instant::now();
        tracing::info!("Batch started");

        let callback = self.callback.as_deref();
        if let Some(callback) = callback {
            callback.on_batch_started(batch_size);
        }

        let shared = WorkerShared {
            registry: &self.registry,
            codec: &self.codec,
            runtime: &self.config.runtime,
            callback,
        };

        // The scope is the join barrier: it returns only after every worker
        // has terminated, so no receive below can block.
        let pending: Vec<_> = thread::scope(|scope| {
            batch
                .into_iter()
                .enumerate()
                .map(|(index, task)| {
                    worker::spawn(scope, self.thread_builder(index), index, task, shared)
                })
                .collect()
        });

        let outcomes: Vec<Outcome> = pending
            .into_iter()
            .enumerate()
            .map(|(index, pending)| match pending {
                Ok(mut rx) => rx.try_recv().unwrap_or_else(|e| {
                    tracing::error!(index, "Worker terminated without reporting");
                    let error = Error::WorkerLost(format!(
                        "task {} terminated without reporting an outcome ({})",
                        index, e
                    ));
                    Outcome::Failure(TaskFailure::from_error(index, &error))
                }),
                Err(failure) => Outcome::Failure(failure),
            })
            .collect();
        let result = aggregate(outcomes);

        let failed = result.as_ref().err().map_or(0, |e| e.failures().len());
        tracing::info!(
            tasks = batch_size,
            failed,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Batch completed"
        );
        if let Some(callback) = callback {
            callback.on_batch_completed(batch_size, failed);
        }
        result
    }

    /// Call `namespace.name(args)` for every entry, in parallel.
    ///
    /// Convenience over [`run`](Self::run) for callers holding plain
    /// values: arguments are encoded and results decoded with this
    /// dispatcher's codec.
    pub fn parallel<I, N, F>(&self, calls: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = (N, F, Value)>,
        N: Into<String>,
        F: Into<String>,
    {
        let batch = calls
            .into_iter()
            .map(|(namespace, name, args)| {
                Ok(TaskDescriptor::new(namespace, name, self.codec.encode(&args)?))
            })
            .collect::<Result<Vec<_>>>()?;

        self.run(batch)?
            .iter()
            .map(|encoded| self.codec.decode(encoded))
            .collect()
    }

    fn thread_builder(&self, index: usize) -> thread::Builder {
        let builder =
            thread::Builder::new().name(format!("{}-{}", self.config.thread_name_prefix, index));
        match self.config.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}
