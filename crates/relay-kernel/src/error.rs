//! Kernel error types.
//!
//! Every dispatch operation surfaces failures through [`DispatchError`].  A
//! call never fails synchronously: errors are always delivered through the
//! call's future.  Errors that have to cross a channel are encoded as a
//! [`Fault`], the JSON value carried in a response's `error` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::message::CorrelationId;

// ---------------------------------------------------------------------------
// Fault
// ---------------------------------------------------------------------------

/// Error payload carried in the `error` field of a response message.
///
/// A provider method that fails returns a `Fault`; the value is forwarded
/// verbatim to the caller, wherever the caller lives.  The internal structure
/// of the value is not interpreted by the dispatch layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fault(pub Value);

impl Fault {
    /// Wrap an arbitrary JSON value.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Build an error-shaped fault (`{"name": "Error", "message": ...}`).
    pub fn message(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// Build a fault with an explicit error name.
    pub fn named(name: &str, message: impl Into<String>) -> Self {
        Self(json!({ "name": name, "message": message.into() }))
    }

    /// Borrow the raw value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Consume the fault, returning the raw value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            Value::Object(map) => match map.get("message").and_then(Value::as_str) {
                Some(message) => f.write_str(message),
                None => write!(f, "{}", self.0),
            },
            other => write!(f, "{other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Unified error type for the dispatch kernel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The call targets a service name nobody has registered.
    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    /// The service exists but its capability table has no such method.
    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    /// The provider's operation failed, locally or in another sandbox.  The
    /// fault is passed through unchanged.
    #[error("{0}")]
    Remote(Fault),

    /// An inbound message carried neither a service nor a correlation id.
    #[error("malformed dispatch message: {reason}")]
    MalformedMessage { reason: String },

    /// A provider table failed validation at registration time.
    #[error("invalid provider for service `{service}`: {reason}")]
    InvalidProvider { service: String, reason: String },

    /// The channel to the peer has been closed.
    #[error("dispatch channel closed")]
    ChannelClosed,

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An encoded frame exceeded the configured limit.
    #[error("frame too large: {size} > {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// The dispatcher that owned the pending call went away before the
    /// response arrived.
    #[error("dispatcher disconnected before call {correlation_id} was answered")]
    Disconnected { correlation_id: CorrelationId },

    /// No sandbox with this id is attached to the coordinator.
    #[error("sandbox not attached: {id}")]
    SandboxNotFound { id: String },

    /// A synchronous call targeted a service that is not provided locally.
    #[error("service `{service}` is not provided locally")]
    NotLocal { service: String },

    /// A `dispatch` control message named a method this role does not handle.
    #[error("unknown dispatch control method: {method}")]
    UnknownControlMethod { method: String },

    /// A control message or provider received an argument of the wrong shape.
    #[error("invalid argument for `{method}`: {reason}")]
    InvalidArgument { method: String, reason: String },

    /// Catch-all for failures inside the kernel itself (e.g. a task that
    /// delivered a result was aborted).
    #[error("internal dispatch error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Short machine-readable name, used as the `name` of a wire fault.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceNotFound { .. } => "ServiceNotFound",
            Self::MethodNotFound { .. } => "MethodNotFound",
            Self::Remote(_) => "RemoteException",
            Self::MalformedMessage { .. } => "MalformedMessage",
            Self::InvalidProvider { .. } => "InvalidProvider",
            Self::ChannelClosed => "ChannelClosed",
            Self::Serialization(_) => "SerializationError",
            Self::FrameTooLarge { .. } => "FrameTooLarge",
            Self::Disconnected { .. } => "Disconnected",
            Self::SandboxNotFound { .. } => "SandboxNotFound",
            Self::NotLocal { .. } => "NotLocal",
            Self::UnknownControlMethod { .. } => "UnknownControlMethod",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Encode this error for the `error` field of a response.
    ///
    /// Remote faults are forwarded verbatim; every other variant becomes a
    /// `{"name", "message"}` object.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::Remote(fault) => fault.clone(),
            other => Fault::named(other.kind(), other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, DispatchError>;
