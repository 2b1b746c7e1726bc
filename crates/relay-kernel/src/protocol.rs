//! Shared dispatch protocol.
//!
//! Both roles (the [`Coordinator`](crate::coordinator::Coordinator) and every
//! [`Sandbox`](crate::sandbox::Sandbox)) speak the same call/response
//! protocol.  The role-specific parts are two hooks on the [`Dispatcher`]
//! trait:
//!
//! - [`Dispatcher::resolve_provider`] decides whether a service is local,
//!   reachable through a peer, or unknown;
//! - [`Dispatcher::handle_control_message`] handles calls addressed to the
//!   reserved `dispatch` service.
//!
//! Everything else (building calls, the pending-call table, demultiplexing
//! inbound messages, sending responses) is provided by the trait itself and
//! is identical for both roles.
//!
//! # Correlation
//!
//! ```text
//! call ──► PendingCalls::register ──► id ──► Call{id} ─────► peer
//!                                                             │
//! future ◄── PendingCalls::complete(id) ◄── Response{id} ◄────┘
//! ```
//!
//! Responses may arrive in any order; each one settles only the future that
//! was registered under its correlation id, exactly once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::channel::{Channel, Delivery, TransferList};
use crate::error::{DispatchError, Result};
use crate::message::{CallMessage, CorrelationId, Envelope, Inbound, ResponseMessage};
use crate::provider::{Invocation, ServiceProvider};

/// Future returned by every call.  Never fails synchronously.
pub type CallFuture = BoxFuture<'static, Result<Value>>;

/// Identifier of one side of a channel, as seen by its owner.
pub type PeerId = Uuid;

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// A channel to another participant, tagged with an id.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    channel: Arc<dyn Channel>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish()
    }
}

impl Peer {
    /// Wrap a channel under a fresh time-ordered id.
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            id: Uuid::now_v7(),
            channel,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn post(&self, envelope: Envelope, transfer: Option<TransferList>) -> Result<()> {
        self.channel.post(envelope, transfer)
    }

    pub fn close(&self) {
        self.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Whether this peer sends through `channel`.
    pub fn uses_channel(&self, channel: &Arc<dyn Channel>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.channel), Arc::as_ptr(channel))
    }
}

/// Where a service lives, from the resolving role's point of view.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// Invoke directly on this provider.
    Local(Arc<ServiceProvider>),
    /// Forward the call through this peer.
    Remote(Peer),
}

// ---------------------------------------------------------------------------
// Pending call table
// ---------------------------------------------------------------------------

/// Continuations waiting for a response, keyed by correlation id.
///
/// Ids are issued from a monotonically increasing counter and are never
/// reused.  An entry exists strictly between "call sent" and "response
/// delivered"; if the peer never answers it stays forever.
pub struct PendingCalls {
    next_id: AtomicU64,
    entries: DashMap<CorrelationId, oneshot::Sender<Result<Value>>>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: DashMap::new(),
        }
    }

    /// Reserve the next correlation id and store its continuation.
    pub fn register(&self) -> (CorrelationId, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        (id, rx)
    }

    /// Remove `id` and settle its continuation.
    ///
    /// Returns `false` if no call is pending under `id` (unknown, or already
    /// answered).
    pub fn complete(&self, id: CorrelationId, outcome: Result<Value>) -> bool {
        let Some((_, tx)) = self.entries.remove(&id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(correlation_id = id, "caller stopped waiting before the response arrived");
        }
        true
    }

    /// Drop the entry for a call that was never sent.
    pub fn forget(&self, id: CorrelationId) {
        self.entries.remove(&id);
    }

    /// Number of calls awaiting a response.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Control replies
// ---------------------------------------------------------------------------

/// Action run once a control reply has been handed to the channel.
pub type AfterReply = Box<dyn FnOnce() + Send>;

/// What a role produces for a control message: the outcome to send back, and
/// optionally something to do only after the reply has been posted.
pub struct ControlReply {
    outcome: CallFuture,
    after_reply: Option<AfterReply>,
}

impl ControlReply {
    pub fn new(outcome: CallFuture) -> Self {
        Self {
            outcome,
            after_reply: None,
        }
    }

    /// A reply that is already settled.
    pub fn ready(result: Result<Value>) -> Self {
        Self::new(future::ready(result).boxed())
    }

    /// Run `action` after the reply has been posted (or, for messages without
    /// a correlation id, after the outcome settled).
    pub fn then(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.after_reply = Some(Box::new(action));
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The shared dispatch protocol.
///
/// Implementors supply the pending-call table and the two role hooks; the
/// provided methods implement calls, responses and message handling.
pub trait Dispatcher: Send + Sync {
    /// This participant's pending-call table.
    fn pending(&self) -> &PendingCalls;

    /// Find the provider of `service`.
    fn resolve_provider(&self, service: &str) -> Option<Resolved>;

    /// Handle a call addressed to the reserved `dispatch` service.
    ///
    /// Returning `None` means there is nothing to reply with.
    fn handle_control_message(&self, peer: &Peer, message: CallMessage) -> Option<ControlReply>;

    /// Call `method` on `service`, wherever it lives.
    fn call(&self, service: &str, method: &str, args: Vec<Value>) -> CallFuture {
        self.route(service, method, None, args)
    }

    /// Like [`Dispatcher::call`], but moves `transfer` to the callee instead
    /// of copying it.
    fn transfer_call(
        &self,
        service: &str,
        method: &str,
        transfer: TransferList,
        args: Vec<Value>,
    ) -> CallFuture {
        self.route(service, method, Some(transfer), args)
    }

    /// Resolve `service` and invoke or forward the call.
    fn route(
        &self,
        service: &str,
        method: &str,
        transfer: Option<TransferList>,
        args: Vec<Value>,
    ) -> CallFuture {
        match self.resolve_provider(service) {
            Some(Resolved::Local(provider)) => {
                let invocation = Invocation {
                    method: method.to_owned(),
                    args,
                    transfer: transfer.unwrap_or_default(),
                };
                future::ready(provider.invoke(service, invocation)).boxed()
            }
            Some(Resolved::Remote(peer)) => {
                self.remote_transfer_call(&peer, service, method, transfer, args)
            }
            None => future::ready(Err(DispatchError::ServiceNotFound {
                service: service.to_owned(),
            }))
            .boxed(),
        }
    }

    /// Whether calls to `service` cross a channel.
    fn is_remote_service(&self, service: &str) -> bool {
        matches!(self.resolve_provider(service), Some(Resolved::Remote(_)))
    }

    /// Force a call through a particular peer.
    fn remote_call(&self, peer: &Peer, service: &str, method: &str, args: Vec<Value>) -> CallFuture {
        self.remote_transfer_call(peer, service, method, None, args)
    }

    /// Force a call, with an optional transfer list, through a particular peer.
    fn remote_transfer_call(
        &self,
        peer: &Peer,
        service: &str,
        method: &str,
        transfer: Option<TransferList>,
        args: Vec<Value>,
    ) -> CallFuture {
        let (correlation_id, rx) = self.pending().register();
        let call = CallMessage::new(service, method, correlation_id, args);

        tracing::trace!(
            service = %service,
            method = %method,
            correlation_id,
            peer = %peer.id(),
            "posting remote call"
        );

        if let Err(err) = peer.post(call.into(), transfer) {
            self.pending().forget(correlation_id);
            return future::ready(Err(err)).boxed();
        }

        async move {
            rx.await
                .unwrap_or(Err(DispatchError::Disconnected { correlation_id }))
        }
        .boxed()
    }

    /// Settle the pending call a response belongs to.
    ///
    /// Never fails: responses for unknown ids are logged and dropped.
    fn deliver_response(&self, response: ResponseMessage) {
        let id = response.correlation_id;
        let outcome = response.outcome.map_err(DispatchError::Remote);
        if self.pending().complete(id, outcome) {
            tracing::trace!(correlation_id = id, "response delivered");
        } else {
            tracing::warn!(correlation_id = id, "dropping response for unknown or already answered call");
        }
    }

    /// Handle one inbound message from `peer`.
    fn on_message(&self, peer: &Peer, delivery: Delivery) {
        match delivery.envelope.classify() {
            Inbound::Control(message) => {
                let correlation_id = message.correlation_id;
                let method = message.method.clone();
                tracing::debug!(method = %method, peer = %peer.id(), "control message received");
                match self.handle_control_message(peer, message) {
                    Some(reply) => send_reply(peer, correlation_id, reply),
                    None => tracing::debug!(method = %method, "control message produced no reply"),
                }
            }
            Inbound::Call(message) => {
                let outcome = self.route(
                    &message.service,
                    &message.method,
                    delivery.transfer,
                    message.args,
                );
                send_reply(peer, message.correlation_id, ControlReply::new(outcome));
            }
            Inbound::Response(response) => self.deliver_response(response),
            Inbound::Malformed(envelope) => {
                let err = DispatchError::MalformedMessage {
                    reason: "message has neither a service nor a correlation id".into(),
                };
                tracing::error!(peer = %peer.id(), envelope = ?envelope, "{err}");
            }
        }
    }
}

/// Post the outcome of an inbound call back to `peer`.
///
/// Settled outcomes are posted immediately; pending ones on a spawned task.
fn send_reply(peer: &Peer, correlation_id: Option<CorrelationId>, reply: ControlReply) {
    let ControlReply {
        mut outcome,
        after_reply,
    } = reply;

    if let Some(result) = (&mut outcome).now_or_never() {
        finish_reply(peer, correlation_id, result, after_reply);
        return;
    }

    let peer = peer.clone();
    tokio::spawn(async move {
        let result = outcome.await;
        finish_reply(&peer, correlation_id, result, after_reply);
    });
}

fn finish_reply(
    peer: &Peer,
    correlation_id: Option<CorrelationId>,
    result: Result<Value>,
    after_reply: Option<AfterReply>,
) {
    match correlation_id {
        Some(id) => {
            let response = ResponseMessage::from_result(id, result);
            if let Err(err) = peer.post(response.into(), None) {
                tracing::warn!(correlation_id = id, peer = %peer.id(), error = %err, "could not post response");
            }
        }
        None => tracing::error!(
            peer = %peer.id(),
            outcome = ?result,
            "dispatch call is missing its correlation id; outcome discarded"
        ),
    }

    if let Some(action) = after_reply {
        action();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
