//! Core engine for islet.
//!
//! This crate provides:
//! - Isolated runtime instances, each with its own isolation lock and heap bookkeeping
//! - A module system resolving callables by namespace and name inside an instance
//! - A value codec for carrying arguments and results across the isolation boundary
//! - A dispatcher that fans a batch out to one worker thread per task and fans
//!   the outcomes back in, in submission order

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod runtime;
pub mod stdlib;
pub mod value;

pub use codec::{Codec, EncodedValue, JsonCodec};
pub use config::{DispatcherConfig, RuntimeConfig};
pub use dispatch::{
    BatchError, BatchResult, DispatchCallback, Dispatcher, Outcome, TaskDescriptor, TaskFailure,
    TaskStage,
};
pub use error::{Error, FailureKind, Result};
pub use module::{Callable, Module, ModuleDef, ModuleRegistry};
pub use runtime::{Capability, Context, HeapStats, Instance, InstanceId};
pub use value::Value;
