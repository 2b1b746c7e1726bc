//! Coordinator role.
//!
//! The coordinator is the authority for the cross-sandbox service directory.
//! It hosts its own local services (e.g. `extensions`), remembers which
//! sandbox provides every remotely registered service, and forwards calls
//! between sandboxes.  A sandbox never talks to another sandbox directly: a
//! call from sandbox A to a service on sandbox B travels A → coordinator → B
//! and the response retraces the same path.
//!
//! # Handshake and shutdown
//!
//! ```text
//! sandbox                         coordinator
//!    │ ── dispatch.handshake ──────► │   (attach + pump already running)
//!    │ ◄─────── dispatch.handshake ─ │   sandbox now connected
//!    │ ◄──────────────── ack ─────── │
//!    │ ── ack ─────────────────────► │
//!    ⋮
//!    │ ◄──────── dispatch.terminate  │
//!    │ ── ack ─────────────────────► │   only now does either side close
//! ```
//!
//! The directory only grows.  A sandbox that disconnects leaves stale
//! entries behind; calls routed to them fail with `ChannelClosed`.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{Channel, ChannelReceiver};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::message::{CallMessage, DISPATCH_SERVICE, EXTENSIONS_SERVICE, control};
use crate::protocol::{
    CallFuture, ControlReply, Dispatcher, PeerId, Peer, PendingCalls, Resolved,
};
use crate::provider::{Invocation, ServiceProvider, validate_service_name};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of an attached sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Id assigned when the sandbox was attached.
    pub id: PeerId,
    /// When the sandbox was attached.
    pub attached_at: DateTime<Utc>,
}

struct AttachedSandbox {
    peer: Peer,
    info: SandboxInfo,
}

/// The process-wide dispatch authority.
///
/// Cheaply cloneable (`Arc`-backed).  Each instance is independent, so tests
/// can run many coordinators side by side.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

/// Non-owning handle to a [`Coordinator`], for services the coordinator
/// itself hosts.
#[derive(Clone)]
pub struct WeakCoordinator {
    inner: Weak<CoordinatorInner>,
}

struct CoordinatorInner {
    config: DispatchConfig,
    pending: PendingCalls,
    /// Services provided in the coordinator's own context.
    services: DashMap<String, Arc<ServiceProvider>>,
    /// Service name -> sandbox that registered it.
    directory: DashMap<String, Peer>,
    sandboxes: DashMap<PeerId, AttachedSandbox>,
}

impl WeakCoordinator {
    pub fn upgrade(&self) -> Option<Coordinator> {
        self.inner.upgrade().map(|inner| Coordinator { inner })
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl Coordinator {
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                pending: PendingCalls::new(),
                services: DashMap::new(),
                directory: DashMap::new(),
                sandboxes: DashMap::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakCoordinator {
        WeakCoordinator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    // -- Local services -----------------------------------------------------

    /// Provide `service` from the coordinator's own context.
    ///
    /// Returns a settled future, for symmetry with
    /// [`Sandbox::set_service`](crate::sandbox::Sandbox::set_service).
    pub fn set_service(&self, service: impl Into<String>, provider: ServiceProvider) -> CallFuture {
        let result = self.set_service_sync(service, provider).map(|()| Value::Null);
        future::ready(result).boxed()
    }

    /// Provide `service` from the coordinator's own context, synchronously.
    pub fn set_service_sync(&self, service: impl Into<String>, provider: ServiceProvider) -> Result<()> {
        let service = service.into();
        validate_service_name(&service)?;
        if self.inner.services.insert(service.clone(), Arc::new(provider)).is_some() {
            self.inner.config.log_replacement("coordinator", &service);
        }
        tracing::debug!(service = %service, "local service registered");
        Ok(())
    }

    /// Invoke a local service synchronously.
    ///
    /// Fails with [`DispatchError::NotLocal`] for services provided by a
    /// sandbox.
    pub fn call_sync(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let provider = self
            .inner
            .services
            .get(service)
            .map(|entry| Arc::clone(entry.value()));
        match provider {
            Some(provider) => provider.invoke(service, Invocation::new(method, args)),
            None if self.inner.directory.contains_key(service) => Err(DispatchError::NotLocal {
                service: service.to_owned(),
            }),
            None => Err(DispatchError::ServiceNotFound {
                service: service.to_owned(),
            }),
        }
    }

    // -- Sandboxes ----------------------------------------------------------

    /// Attach a sandbox and start pumping its inbound messages.
    ///
    /// Attaching the same channel twice is ignored; the existing id is
    /// returned.
    pub fn attach(&self, channel: Arc<dyn Channel>, inbox: ChannelReceiver) -> PeerId {
        if let Some(id) = self.find_sandbox(&channel) {
            tracing::warn!(peer = %id, "ignoring attempt to attach duplicate sandbox");
            return id;
        }

        let peer = self.add_sandbox(channel);
        let id = peer.id();
        tokio::spawn(run_pump(self.downgrade(), peer, inbox));
        id
    }

    /// Register a sandbox without starting a pump.
    ///
    /// The caller is responsible for feeding inbound messages to
    /// [`Dispatcher::on_message`] with the returned peer.
    pub fn add_sandbox(&self, channel: Arc<dyn Channel>) -> Peer {
        if let Some(existing) = self
            .find_sandbox(&channel)
            .and_then(|id| self.inner.sandboxes.get(&id).map(|e| e.peer.clone()))
        {
            tracing::warn!(peer = %existing.id(), "ignoring attempt to add duplicate sandbox");
            return existing;
        }

        let peer = Peer::new(channel);
        let info = SandboxInfo {
            id: peer.id(),
            attached_at: Utc::now(),
        };
        self.inner.sandboxes.insert(
            info.id,
            AttachedSandbox {
                peer: peer.clone(),
                info,
            },
        );
        tracing::info!(peer = %peer.id(), sandboxes = self.sandbox_count(), "sandbox attached");
        peer
    }

    fn find_sandbox(&self, channel: &Arc<dyn Channel>) -> Option<PeerId> {
        self.inner
            .sandboxes
            .iter()
            .find(|entry| entry.peer.uses_channel(channel))
            .map(|entry| *entry.key())
    }

    /// Ask a sandbox to shut down.
    ///
    /// The coordinator's side of the channel is closed, and the sandbox
    /// forgotten, only after the sandbox has acknowledged.
    pub fn terminate(&self, id: PeerId) -> BoxFuture<'static, Result<()>> {
        let Some(peer) = self.inner.sandboxes.get(&id).map(|e| e.peer.clone()) else {
            return future::ready(Err(DispatchError::SandboxNotFound { id: id.to_string() })).boxed();
        };

        let ack = self.remote_call(&peer, DISPATCH_SERVICE, control::TERMINATE, Vec::new());
        let this = self.clone();
        async move {
            ack.await?;
            peer.close();
            this.inner.sandboxes.remove(&id);
            tracing::info!(peer = %id, "sandbox terminated");
            Ok(())
        }
        .boxed()
    }

    /// Terminate every attached sandbox, returning each outcome.
    pub async fn terminate_all(&self) -> Vec<(PeerId, Result<()>)> {
        let ids: Vec<PeerId> = self.inner.sandboxes.iter().map(|e| *e.key()).collect();
        let results = future::join_all(ids.iter().map(|id| self.terminate(*id))).await;
        ids.into_iter().zip(results).collect()
    }

    fn detach(&self, id: PeerId) {
        if self.inner.sandboxes.remove(&id).is_some() {
            let stale = self
                .inner
                .directory
                .iter()
                .filter(|entry| entry.value().id() == id)
                .count();
            tracing::info!(peer = %id, stale_services = stale, "sandbox channel closed");
        }
    }

    pub fn sandbox_count(&self) -> usize {
        self.inner.sandboxes.len()
    }

    /// Attached sandboxes, oldest first.
    pub fn sandboxes(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self
            .inner
            .sandboxes
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.attached_at);
        infos
    }

    // -- Directory ----------------------------------------------------------

    fn record_directory_entry(&self, service: &str, peer: &Peer) -> Result<()> {
        validate_service_name(service)?;
        if self
            .inner
            .directory
            .insert(service.to_owned(), peer.clone())
            .is_some()
        {
            self.inner.config.log_replacement("directory", service);
        }
        tracing::info!(service = %service, peer = %peer.id(), "remote service registered");
        Ok(())
    }

    /// Which sandbox provides `service`, if any.
    pub fn provider_of(&self, service: &str) -> Option<PeerId> {
        self.inner.directory.get(service).map(|entry| entry.id())
    }

    /// Whether `service` can be resolved (locally or through the directory).
    pub fn has_service(&self, service: &str) -> bool {
        self.inner.services.contains_key(service) || self.inner.directory.contains_key(service)
    }

    /// `(service, sandbox)` pairs, sorted by service name.
    pub fn directory_snapshot(&self) -> Vec<(String, PeerId)> {
        let mut entries: Vec<(String, PeerId)> = self
            .inner
            .directory
            .iter()
            .map(|entry| (entry.key().clone(), entry.id()))
            .collect();
        entries.sort();
        entries
    }

    // -- Control ------------------------------------------------------------

    fn on_handshake(&self, peer: &Peer) -> ControlReply {
        tracing::info!(peer = %peer.id(), "sandbox handshake received");
        let handshake = self.remote_call(peer, DISPATCH_SERVICE, control::HANDSHAKE, Vec::new());
        let peer_id = peer.id();
        tokio::spawn(async move {
            if let Err(err) = handshake.await {
                tracing::error!(peer = %peer_id, error = %err, "could not handshake with sandbox");
            }
        });
        ControlReply::ready(Ok(Value::Null))
    }
}

impl Dispatcher for Coordinator {
    fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    fn resolve_provider(&self, service: &str) -> Option<Resolved> {
        if let Some(provider) = self.inner.services.get(service) {
            return Some(Resolved::Local(Arc::clone(provider.value())));
        }
        self.inner
            .directory
            .get(service)
            .map(|peer| Resolved::Remote(peer.clone()))
    }

    fn handle_control_message(&self, peer: &Peer, message: CallMessage) -> Option<ControlReply> {
        let reply = match message.method.as_str() {
            control::SET_SERVICE => ControlReply::ready(
                message
                    .str_arg(0)
                    .and_then(|service| self.record_directory_entry(service, peer))
                    .map(|()| Value::Null),
            ),
            control::HANDSHAKE => self.on_handshake(peer),
            control::ALLOCATE_WORKER
            | control::REGISTER_EXTENSION_SERVICE
            | control::ON_WORKER_INIT => ControlReply::new(self.route(
                EXTENSIONS_SERVICE,
                &message.method,
                None,
                message.args,
            )),
            other => {
                tracing::error!(method = %other, peer = %peer.id(), "coordinator received unknown control method");
                ControlReply::ready(Err(DispatchError::UnknownControlMethod {
                    method: other.to_owned(),
                }))
            }
        };
        Some(reply)
    }
}

async fn run_pump(coordinator: WeakCoordinator, peer: Peer, mut inbox: ChannelReceiver) {
    while let Some(delivery) = inbox.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        coordinator.on_message(&peer, delivery);
    }
    if let Some(coordinator) = coordinator.upgrade() {
        coordinator.detach(peer.id());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
