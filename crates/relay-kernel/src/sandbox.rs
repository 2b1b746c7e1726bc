//! Sandbox role.
//!
//! A sandbox is an isolated participant with exactly one channel, to the
//! coordinator.  Services it provides are served locally; every other call
//! goes upstream.  The sandbox becomes *connected* when the coordinator sends
//! it a `handshake`, and only then announces its services.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::channel::{Channel, ChannelReceiver};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::message::{CallMessage, DISPATCH_SERVICE, control};
use crate::protocol::{CallFuture, ControlReply, Dispatcher, Peer, PendingCalls, Resolved};
use crate::provider::{ServiceProvider, validate_service_name};

/// One isolated dispatch participant.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

#[derive(Clone)]
struct WeakSandbox {
    inner: Weak<SandboxInner>,
}

struct SandboxInner {
    config: DispatchConfig,
    pending: PendingCalls,
    services: DashMap<String, Arc<ServiceProvider>>,
    upstream: Peer,
    connected: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    handshake_sent: AtomicBool,
    pump_started: AtomicBool,
}

impl WeakSandbox {
    fn upgrade(&self) -> Option<Sandbox> {
        self.inner.upgrade().map(|inner| Sandbox { inner })
    }
}

impl Sandbox {
    /// Create a sandbox that talks to the coordinator through `channel`.
    ///
    /// Nothing is sent until [`Sandbox::connect`] (or
    /// [`Sandbox::send_handshake`]) is called.
    pub fn new(channel: Arc<dyn Channel>, config: DispatchConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SandboxInner {
                config,
                pending: PendingCalls::new(),
                services: DashMap::new(),
                upstream: Peer::new(channel),
                connected,
                closed,
                handshake_sent: AtomicBool::new(false),
                pump_started: AtomicBool::new(false),
            }),
        }
    }

    fn downgrade(&self) -> WeakSandbox {
        WeakSandbox {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// The channel to the coordinator.
    pub fn upstream(&self) -> &Peer {
        &self.inner.upstream
    }

    // -- Connection ---------------------------------------------------------

    /// Start pumping `inbox` and greet the coordinator.
    ///
    /// Calling this more than once has no further effect.
    pub fn connect(&self, inbox: ChannelReceiver) {
        if self.inner.pump_started.swap(true, Ordering::SeqCst) {
            tracing::warn!(peer = %self.inner.upstream.id(), "sandbox pump already running");
            return;
        }
        tokio::spawn(run_pump(
            self.downgrade(),
            self.inner.upstream.clone(),
            inbox,
            self.inner.closed.subscribe(),
        ));
        self.send_handshake();
    }

    /// Send this sandbox's `handshake` upstream, once.
    pub fn send_handshake(&self) {
        if self.inner.handshake_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let ack = self.remote_call(&self.inner.upstream, DISPATCH_SERVICE, control::HANDSHAKE, Vec::new());
        let peer = self.inner.upstream.id();
        tokio::spawn(async move {
            match ack.await {
                Ok(_) => tracing::debug!(peer = %peer, "handshake acknowledged"),
                Err(err) => tracing::error!(peer = %peer, error = %err, "handshake failed"),
            }
        });
    }

    /// Resolves once the coordinator's `handshake` has arrived.
    pub fn wait_for_connection(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.connected.subscribe();
        async move { wait_until_set(&mut rx).await }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolves once this sandbox has closed its channel.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.closed.subscribe();
        async move { wait_until_set(&mut rx).await }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn shut_down(&self, reason: &str) {
        self.inner.upstream.close();
        if !self.inner.closed.send_replace(true) {
            tracing::info!(peer = %self.inner.upstream.id(), reason, "sandbox closed");
        }
    }

    // -- Services -----------------------------------------------------------

    /// Provide `service` from this sandbox.
    ///
    /// The provider is usable locally at once.  The returned future settles
    /// when the coordinator has acknowledged the matching `setService`, which
    /// is sent only after the sandbox is connected.
    pub fn set_service(&self, service: impl Into<String>, provider: ServiceProvider) -> CallFuture {
        let service = service.into();
        if let Err(err) = validate_service_name(&service) {
            return future::ready(Err(err)).boxed();
        }
        if self
            .inner
            .services
            .insert(service.clone(), Arc::new(provider))
            .is_some()
        {
            self.inner.config.log_replacement("sandbox", &service);
        }
        tracing::debug!(service = %service, "sandbox service registered locally");

        // Holds the sandbox weakly until connected.
        let weak = self.downgrade();
        let connected = self.wait_for_connection();
        let closed = self.closed();
        let announce = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = closed => return Err(DispatchError::ChannelClosed),
                () = connected => {}
            }
            let this = weak.upgrade().ok_or(DispatchError::ChannelClosed)?;
            let ack = this.remote_call(
                &this.inner.upstream,
                DISPATCH_SERVICE,
                control::SET_SERVICE,
                vec![json!(service)],
            );
            drop(this);
            ack.await
        });

        async move {
            announce
                .await
                .map_err(|err| DispatchError::Internal(err.to_string()))?
        }
        .boxed()
    }

    /// Names of the services provided by this sandbox, sorted.
    pub fn local_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Dispatcher for Sandbox {
    fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    fn resolve_provider(&self, service: &str) -> Option<Resolved> {
        match self.inner.services.get(service) {
            Some(provider) => Some(Resolved::Local(Arc::clone(provider.value()))),
            None => Some(Resolved::Remote(self.inner.upstream.clone())),
        }
    }

    fn handle_control_message(&self, peer: &Peer, message: CallMessage) -> Option<ControlReply> {
        let reply = match message.method.as_str() {
            control::HANDSHAKE => {
                if self.inner.connected.send_replace(true) {
                    tracing::debug!(peer = %peer.id(), "repeated handshake ignored");
                } else {
                    tracing::info!(peer = %peer.id(), "sandbox connected");
                }
                ControlReply::ready(Ok(Value::Null))
            }
            control::TERMINATE => {
                let this = self.clone();
                ControlReply::ready(Ok(Value::Null)).then(move || this.shut_down("terminated"))
            }
            other => {
                tracing::error!(method = %other, peer = %peer.id(), "sandbox received unknown control method");
                ControlReply::ready(Err(DispatchError::UnknownControlMethod {
                    method: other.to_owned(),
                }))
            }
        };
        Some(reply)
    }
}

async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    // The sender lives as long as the sandbox; an error means it is gone.
    let _ = rx.wait_for(|set| *set).await;
}

async fn run_pump(
    sandbox: WeakSandbox,
    peer: Peer,
    mut inbox: ChannelReceiver,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else { break };
                let Some(sandbox) = sandbox.upgrade() else { return };
                sandbox.on_message(&peer, delivery);
            }
            () = wait_until_set(&mut closed) => break,
        }
    }
    if let Some(sandbox) = sandbox.upgrade() {
        sandbox.shut_down("upstream channel ended");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
