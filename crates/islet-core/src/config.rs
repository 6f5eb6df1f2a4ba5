//! Configuration for runtime instances and the dispatcher.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options applied when creating an isolated runtime instance.
///
/// Every option defaults to its most restrictive value. Instances are
/// single-use, single-task and single-thread, so callables needing fork,
/// external processes or extra threads are refused at the capability fence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Share heap bookkeeping with every other sharing instance.
    pub share_allocator_with_creator: bool,
    /// Permit forking from inside the instance.
    pub allow_fork: bool,
    /// Permit executing external programs from inside the instance.
    pub allow_external_exec: bool,
    /// Permit spawning threads from inside the instance.
    pub allow_spawning_threads: bool,
    /// Permit spawning detached threads from inside the instance.
    pub allow_spawning_daemon_threads: bool,
    /// Give the instance its own isolation lock instead of the process-wide one.
    pub own_isolation_lock: bool,
    /// Refuse modules that have not declared multi-instance support.
    pub check_multi_instance_modules: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            share_allocator_with_creator: false,
            allow_fork: false,
            allow_external_exec: false,
            allow_spawning_threads: false,
            allow_spawning_daemon_threads: false,
            own_isolation_lock: true,
            check_multi_instance_modules: true,
        }
    }
}

impl RuntimeConfig {
    /// Legacy shared mode: one process-wide lock and one shared heap.
    ///
    /// Instances created this way serialize on each other. Used as the
    /// baseline the isolated mode is measured against.
    pub fn shared() -> Self {
        Self {
            share_allocator_with_creator: true,
            own_isolation_lock: false,
            ..Self::default()
        }
    }

    /// Whether this configuration runs on the process-wide lock.
    pub fn is_shared(&self) -> bool {
        !self.own_isolation_lock
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.own_isolation_lock && self.share_allocator_with_creator {
            return Err(Error::InvalidConfig(
                "an instance with its own isolation lock cannot share the creator's allocator"
                    .to_string(),
            ));
        }
        if !self.own_isolation_lock && !self.share_allocator_with_creator {
            return Err(Error::InvalidConfig(
                "an instance on the shared isolation lock must share the creator's allocator"
                    .to_string(),
            ));
        }
        if !self.share_allocator_with_creator && !self.check_multi_instance_modules {
            return Err(Error::InvalidConfig(
                "an instance with its own allocator must check modules for multi-instance support"
                    .to_string(),
            ));
        }
        if self.allow_spawning_daemon_threads && !self.allow_spawning_threads {
            return Err(Error::InvalidConfig(
                "daemon threads require allow_spawning_threads".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Configuration for every instance the dispatcher creates.
    pub runtime: RuntimeConfig,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// Stack size for worker threads; platform default when unset.
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            thread_name_prefix: "islet-task".to_string(),
            stack_size: None,
        }
    }
}

impl DispatcherConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.runtime.validate()?;
        Ok(config)
    }
}
