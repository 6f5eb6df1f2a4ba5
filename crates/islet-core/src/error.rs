//! Error types for islet-core.

use std::fmt;

use thiserror::Error;

use crate::dispatch::BatchError;
use crate::runtime::Capability;

/// Result type for islet-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in islet-core.
#[derive(Debug, Error)]
pub enum Error {
    /// An isolated runtime instance could not be created.
    #[error("instance creation failed: {0}")]
    InstanceCreation(String),

    /// No module is registered under the requested namespace.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// The namespace exists but does not export the requested name.
    #[error("callable not found: {namespace} has no attribute '{name}'")]
    CallableNotFound { namespace: String, name: String },

    /// The module refuses to be loaded into more than one instance.
    #[error("module '{0}' does not support multiple instances")]
    ModuleUnsupported(String),

    /// Encoded arguments were malformed or incompatible.
    #[error("decode error: {0}")]
    Decode(String),

    /// The callable itself failed.
    #[error("invocation failed: {0}")]
    Invocation(String),

    /// The result could not be represented by the codec.
    #[error("encode error: {0}")]
    Encode(String),

    /// Inconsistent runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A callable asked for something its instance is fenced off from.
    #[error("capability denied: {0} is not permitted inside this instance")]
    CapabilityDenied(Capability),

    /// A worker thread terminated without reporting an outcome.
    #[error("worker lost: {0}")]
    WorkerLost(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// One or more tasks of a batch failed.
    #[error("{0}")]
    Batch(#[from] BatchError),
}

/// The pipeline stage a per-task failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Creation,
    Resolution,
    Decode,
    Invocation,
    Encode,
    Worker,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creation => "creation",
            Self::Resolution => "resolution",
            Self::Decode => "decode",
            Self::Invocation => "invocation",
            Self::Encode => "encode",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classify this error by the pipeline stage it belongs to.
    ///
    /// Errors that are not produced by a pipeline step are attributed to
    /// the invocation, since they can only surface there (e.g. a callable
    /// hitting a capability fence and propagating it).
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InstanceCreation(_) | Self::InvalidConfig(_) => FailureKind::Creation,
            Self::NamespaceNotFound(_)
            | Self::CallableNotFound { .. }
            | Self::ModuleUnsupported(_) => FailureKind::Resolution,
            Self::Decode(_) => FailureKind::Decode,
            Self::Encode(_) => FailureKind::Encode,
            Self::WorkerLost(_) => FailureKind::Worker,
            Self::Invocation(_)
            | Self::CapabilityDenied(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Batch(_) => FailureKind::Invocation,
        }
    }
}
