//! Isolated runtime instances.
//!
//! An [`Instance`] is an independent execution context: its own isolation
//! lock, its own heap bookkeeping and its own table of imported modules.
//! Two instances created with the default configuration never contend on
//! anything, which is what lets a batch run truly in parallel.
//!
//! Instances are thread-confined. They are `!Send`, so one is created, used
//! and dropped on the same thread, and dropping is the teardown: the handle
//! cannot be used after it is destroyed.

use std::fmt;
use std::marker::PhantomData;
use std::process::{Command, Output};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::value::Value;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide lock used by instances that do not own their isolation lock.
static SHARED_LOCK: LazyLock<Arc<Mutex<()>>> = LazyLock::new(|| Arc::new(Mutex::new(())));

/// Heap bookkeeping for instances sharing the creator's allocator.
static SHARED_HEAP: LazyLock<Arc<Mutex<HeapStats>>> =
    LazyLock::new(|| Arc::new(Mutex::new(HeapStats::default())));

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking callable is caught before it can poison anything we rely on.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unique identifier of a runtime instance within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Something a callable may ask its instance for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Fork,
    Exec,
    Threads,
    DaemonThreads,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fork => "fork",
            Self::Exec => "exec",
            Self::Threads => "threads",
            Self::DaemonThreads => "daemon threads",
        };
        f.write_str(s)
    }
}

/// Heap statistics of an instance (or of the shared heap).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Values currently attributed to the heap.
    pub live_values: usize,
    /// Bytes currently attributed to the heap.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
}

impl HeapStats {
    fn add(&mut self, bytes: usize) {
        self.live_values += 1;
        self.live_bytes += bytes;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
    }

    fn release(&mut self, values: usize, bytes: usize) {
        self.live_values = self.live_values.saturating_sub(values);
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
    }
}

/// Heap bookkeeping: owned outright, or the process-wide shared heap.
enum Heap {
    Owned(HeapStats),
    Shared {
        stats: Arc<Mutex<HeapStats>>,
        /// This instance's contribution, released at teardown.
        values: usize,
        bytes: usize,
    },
}

impl Heap {
    fn new(shared: bool) -> Self {
        if shared {
            Heap::Shared {
                stats: SHARED_HEAP.clone(),
                values: 0,
                bytes: 0,
            }
        } else {
            Heap::Owned(HeapStats::default())
        }
    }

    fn record(&mut self, bytes: usize) {
        match self {
            Heap::Owned(stats) => stats.add(bytes),
            Heap::Shared {
                stats,
                values,
                bytes: own_bytes,
            } => {
                lock_ignoring_poison(stats).add(bytes);
                *values += 1;
                *own_bytes += bytes;
            }
        }
    }

    fn stats(&self) -> HeapStats {
        match self {
            Heap::Owned(stats) => *stats,
            Heap::Shared { stats, .. } => *lock_ignoring_poison(stats),
        }
    }

    fn release(&mut self) {
        match self {
            Heap::Owned(stats) => *stats = HeapStats::default(),
            Heap::Shared {
                stats,
                values,
                bytes,
            } => {
                lock_ignoring_poison(stats).release(*values, *bytes);
                *values = 0;
                *bytes = 0;
            }
        }
    }
}

/// An isolated runtime instance.
pub struct Instance {
    id: InstanceId,
    config: RuntimeConfig,
    lock: Arc<Mutex<()>>,
    heap: Heap,
    modules: FxHashMap<String, Module>,
    _thread_confined: PhantomData<Rc<()>>,
}

impl Instance {
    /// Create a new instance.
    ///
    /// Fails with [`Error::InstanceCreation`] when the configuration is
    /// inconsistent; nothing is allocated in that case.
    pub fn create(config: &RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InstanceCreation(e.to_string()))?;

        let lock = if config.own_isolation_lock {
            Arc::new(Mutex::new(()))
        } else {
            SHARED_LOCK.clone()
        };

        let instance = Self {
            id: InstanceId::next(),
            config: config.clone(),
            lock,
            heap: Heap::new(config.share_allocator_with_creator),
            modules: FxHashMap::default(),
            _thread_confined: PhantomData,
        };
        tracing::debug!(
            instance = %instance.id,
            shared = config.is_shared(),
            "Instance created"
        );
        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current heap statistics.
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Number of modules imported into this instance.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Run `f` inside this instance's context, on the calling thread.
    ///
    /// The instance's isolation lock is held for the duration of `f`.
    pub fn run_within<R>(&mut self, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let lock = self.lock.clone();
        let _guard = lock_ignoring_poison(&lock);
        let mut cx = Context {
            id: self.id,
            config: &self.config,
            heap: &mut self.heap,
            modules: &mut self.modules,
        };
        f(&mut cx)
    }

    /// Tear the instance down.
    ///
    /// Equivalent to dropping it; spelled out for call sites where the
    /// teardown point matters.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        let _guard = lock_ignoring_poison(&lock);
        // Module state may hold values created inside the instance.
        self.modules.clear();
        self.heap.release();
        tracing::debug!(instance = %self.id, "Instance destroyed");
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("shared", &self.config.is_shared())
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// View of an instance handed to code running inside it.
pub struct Context<'a> {
    id: InstanceId,
    config: &'a RuntimeConfig,
    heap: &'a mut Heap,
    modules: &'a mut FxHashMap<String, Module>,
}

impl Context<'_> {
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.config
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Attribute a value to this instance's heap.
    pub fn track(&mut self, value: &Value) {
        self.heap.record(value.approx_size());
    }

    /// Check that the instance permits `capability`.
    ///
    /// [`Capability::Fork`] has no operation of its own here; callables that
    /// fork through other means are expected to check it first.
    pub fn require(&self, capability: Capability) -> Result<()> {
        let allowed = match capability {
            Capability::Fork => self.config.allow_fork,
            Capability::Exec => self.config.allow_external_exec,
            Capability::Threads => self.config.allow_spawning_threads,
            Capability::DaemonThreads => self.config.allow_spawning_daemon_threads,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::CapabilityDenied(capability))
        }
    }

    /// Spawn a thread from inside the instance, if permitted.
    pub fn spawn_thread<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.require(Capability::Threads)?;
        let handle = std::thread::Builder::new()
            .name(format!("{}-child", self.id))
            .spawn(f)?;
        Ok(handle)
    }

    /// Spawn a detached thread that may outlive the instance, if permitted.
    ///
    /// Needs both [`Capability::Threads`] and [`Capability::DaemonThreads`].
    pub fn spawn_daemon_thread<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.require(Capability::Threads)?;
        self.require(Capability::DaemonThreads)?;
        std::thread::Builder::new()
            .name(format!("{}-daemon", self.id))
            .spawn(f)?;
        Ok(())
    }

    /// Run an external program to completion, if permitted.
    pub fn exec(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.require(Capability::Exec)?;
        Ok(Command::new(program).args(args).output()?)
    }

    pub(crate) fn modules_mut(&mut self) -> &mut FxHashMap<String, Module> {
        self.modules
    }
}
