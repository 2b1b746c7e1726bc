//! relay dispatch kernel.
//!
//! This crate lets isolated participants call each other's services by name,
//! over asynchronous message channels, without knowing where a service lives:
//!
//! - **[`message`]** -- The wire envelope (`Call` / `Response`) and its typed
//!   views, serialised with `serde` in camelCase.
//! - **[`channel`]** -- The [`Channel`] seam plus an in-process implementation
//!   on [`tokio::sync::mpsc`] and a recording test double.
//! - **[`provider`]** -- Validated per-service capability tables.
//! - **[`protocol`]** -- The shared call/response protocol, implemented once
//!   as provided methods on the [`Dispatcher`] trait.
//! - **[`coordinator`]** -- The authority that owns the service directory and
//!   forwards calls between sandboxes.
//! - **[`sandbox`]** -- An isolated participant with a single channel to the
//!   coordinator.
//! - **[`config`]** / **[`error`]** -- Tunables and the unified error type.
//!
//! Every registry is owned by an explicitly constructed instance, so any
//! number of coordinators and sandboxes can coexist in one process.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod sandbox;

// Re-export the most commonly used types at the crate root for convenience.
pub use channel::{Channel, ChannelReceiver, Delivery, Endpoint, LocalChannel, TransferList};
pub use config::DispatchConfig;
pub use coordinator::{Coordinator, SandboxInfo, WeakCoordinator};
pub use error::{DispatchError, Fault, Result};
pub use message::{
    CallMessage, CorrelationId, DISPATCH_SERVICE, EXTENSIONS_SERVICE, Envelope, Inbound,
    ResponseMessage, control,
};
pub use protocol::{CallFuture, ControlReply, Dispatcher, Peer, PeerId, PendingCalls, Resolved};
pub use provider::{Invocation, MethodResult, ServiceProvider};
pub use sandbox::Sandbox;
