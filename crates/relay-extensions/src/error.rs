//! Extension error types.
//!
//! All extension subsystems surface errors through [`ExtensionError`].  Errors
//! that have to reach another participant (a load failure reported through
//! `onWorkerInit`, a refused allocation) are encoded with
//! [`ExtensionError::to_fault`].

use relay_kernel::{DispatchError, Fault};

use crate::manager::WorkerId;

/// Unified error type for extension loading.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtensionError {
    /// A dispatch call made on behalf of an extension failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The extension at `location` could not be fetched or its entry point
    /// failed.
    #[error("extension failed to load from `{location}`: {reason}")]
    LoadFailure {
        /// Where the extension was loaded from.
        location: String,
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// No extension source knows this location.
    #[error("unknown extension location: {location}")]
    UnknownLocation { location: String },

    /// `allocateWorker` was called with no extension waiting to be loaded.
    #[error("no extension is waiting for a worker")]
    NoPendingExtension,

    /// The allocation reply did not have the `[workerId, location]` shape.
    #[error("invalid worker allocation: {reason}")]
    InvalidAllocation { reason: String },

    /// `register` was called before the loader had a worker id.
    #[error("extension registered before a worker was allocated")]
    NotAllocated,

    /// `onWorkerInit` named a worker that is not waiting to initialise.
    #[error("unknown worker: {worker_id}")]
    UnknownWorker { worker_id: WorkerId },

    /// The sandbox host could not start a sandbox, or the coordinator it
    /// serves has gone away.
    #[error("extension host error: {0}")]
    Host(String),
}

impl ExtensionError {
    /// Short machine-readable name, used as the `name` of a wire fault.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(err) => err.kind(),
            Self::LoadFailure { .. } => "LoadFailure",
            Self::UnknownLocation { .. } => "UnknownLocation",
            Self::NoPendingExtension => "NoPendingExtension",
            Self::InvalidAllocation { .. } => "InvalidAllocation",
            Self::NotAllocated => "NotAllocated",
            Self::UnknownWorker { .. } => "UnknownWorker",
            Self::Host(_) => "HostError",
        }
    }

    /// Encode for the `error` field of a response, or for the error argument
    /// of `onWorkerInit`.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::Dispatch(err) => err.to_fault(),
            other => Fault::named(other.kind(), other.to_string()),
        }
    }
}

/// Convenience alias used throughout the extensions crate.
pub type Result<T> = std::result::Result<T, ExtensionError>;
