//! Wire messages.
//!
//! Everything that crosses a channel is an [`Envelope`]: a flat record whose
//! fields are all optional.  Which fields are present decides what the
//! message *is*:
//!
//! ```text
//! Call:     { service, method, correlationId?, args }
//! Response: { correlationId, result? } | { correlationId, error }
//! ```
//!
//! A call addressed to the reserved [`DISPATCH_SERVICE`] is a control message
//! used for protocol housekeeping.  [`Envelope::classify`] turns a raw
//! envelope into one of the typed views.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DispatchError, Fault, Result};

/// Locally generated tag pairing a call with its response.
pub type CorrelationId = u64;

/// Reserved service name for control messages.
pub const DISPATCH_SERVICE: &str = "dispatch";

/// Name of the service the extension loader talks to.
pub const EXTENSIONS_SERVICE: &str = "extensions";

/// Methods understood on the reserved `dispatch` service.
pub mod control {
    pub const HANDSHAKE: &str = "handshake";
    pub const TERMINATE: &str = "terminate";
    pub const SET_SERVICE: &str = "setService";
    pub const ALLOCATE_WORKER: &str = "allocateWorker";
    pub const REGISTER_EXTENSION_SERVICE: &str = "registerExtensionService";
    pub const ON_WORKER_INIT: &str = "onWorkerInit";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Raw wire form of every dispatch message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Fault>,
}

/// An inbound envelope after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A call addressed to the reserved `dispatch` service.
    Control(CallMessage),
    /// A call addressed to any other service.
    Call(CallMessage),
    /// A response to one of our own outstanding calls.
    Response(ResponseMessage),
    /// Neither a service nor a correlation id: nothing can be done with it.
    Malformed(Envelope),
}

impl Envelope {
    /// Decide what kind of message this envelope carries.
    pub fn classify(self) -> Inbound {
        match (self.service, self.correlation_id) {
            (Some(service), correlation_id) => {
                let call = CallMessage {
                    method: self.method.unwrap_or_default(),
                    correlation_id,
                    args: self.args,
                    service,
                };
                if call.is_control() {
                    Inbound::Control(call)
                } else {
                    Inbound::Call(call)
                }
            }
            (None, Some(correlation_id)) => Inbound::Response(ResponseMessage {
                correlation_id,
                outcome: match self.error {
                    Some(fault) => Err(fault),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                },
            }),
            (None, None) => Inbound::Malformed(Self {
                service: None,
                correlation_id: None,
                ..self
            }),
        }
    }

    /// Encode as JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::MalformedMessage {
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

/// A request to invoke `method` on `service`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    pub service: String,
    pub method: String,
    /// Absent when the sender does not expect a response.
    pub correlation_id: Option<CorrelationId>,
    pub args: Vec<Value>,
}

impl CallMessage {
    /// Build a call that expects a response under `correlation_id`.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        correlation_id: CorrelationId,
        args: Vec<Value>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            correlation_id: Some(correlation_id),
            args,
        }
    }

    /// Whether this call targets the reserved `dispatch` service.
    pub fn is_control(&self) -> bool {
        self.service == DISPATCH_SERVICE
    }

    /// Borrow the positional argument at `index` as a string.
    pub fn str_arg(&self, index: usize) -> Result<&str> {
        self.args
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidArgument {
                method: self.method.clone(),
                reason: format!("argument {index} must be a string"),
            })
    }
}

impl From<CallMessage> for Envelope {
    fn from(call: CallMessage) -> Self {
        Self {
            service: Some(call.service),
            method: Some(call.method),
            correlation_id: call.correlation_id,
            args: call.args,
            ..Self::default()
        }
    }
}

/// The outcome of a call, addressed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub correlation_id: CorrelationId,
    pub outcome: std::result::Result<Value, Fault>,
}

impl ResponseMessage {
    pub fn success(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            outcome: Ok(result),
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: Fault) -> Self {
        Self {
            correlation_id,
            outcome: Err(error),
        }
    }

    /// Build a response from a locally computed call result.
    pub fn from_result(correlation_id: CorrelationId, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(correlation_id, value),
            Err(err) => Self::failure(correlation_id, err.to_fault()),
        }
    }
}

impl From<ResponseMessage> for Envelope {
    fn from(response: ResponseMessage) -> Self {
        let (result, error) = match response.outcome {
            Ok(value) => (Some(value), None),
            Err(fault) => (None, Some(fault)),
        };
        Self {
            correlation_id: Some(response.correlation_id),
            result,
            error,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
