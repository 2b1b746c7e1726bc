//! Sandbox hosts.
//!
//! A [`SandboxHost`] starts the isolated sandbox an extension is loaded into.
//! [`InProcessHost`] runs each sandbox as a set of tokio tasks in the current
//! process, linked to the coordinator by a [`LocalChannel`] pair.

use std::sync::Arc;

use dashmap::DashMap;
use relay_kernel::{Coordinator, LocalChannel, PeerId, Sandbox};

use crate::error::Result;
use crate::loader::{ExtensionLoader, LoaderState};
use crate::source::ExtensionSource;

/// Starts extension sandboxes.
pub trait SandboxHost: Send + Sync {
    /// Start a sandbox attached to `coordinator` and begin loading the next
    /// queued extension into it.  Returns the coordinator's id for the new
    /// sandbox.
    fn spawn(&self, coordinator: &Coordinator) -> Result<PeerId>;
}

/// [`SandboxHost`] that keeps every sandbox in this process.
pub struct InProcessHost {
    source: Arc<dyn ExtensionSource>,
    /// Loaders of sandboxes that have not closed yet.
    loaders: Arc<DashMap<PeerId, ExtensionLoader>>,
}

impl InProcessHost {
    pub fn new(source: Arc<dyn ExtensionSource>) -> Self {
        Self {
            source,
            loaders: Arc::new(DashMap::new()),
        }
    }

    /// Current state of every loader whose sandbox is still open.
    pub fn loader_states(&self) -> Vec<(PeerId, LoaderState)> {
        let mut states: Vec<(PeerId, LoaderState)> = self
            .loaders
            .iter()
            .map(|entry| (*entry.key(), entry.value().state()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }
}

impl SandboxHost for InProcessHost {
    fn spawn(&self, coordinator: &Coordinator) -> Result<PeerId> {
        let config = coordinator.config().clone();
        let (coordinator_side, sandbox_side) = LocalChannel::pair(&config);
        let id = coordinator.attach(coordinator_side.channel, coordinator_side.inbox);

        let sandbox = Sandbox::new(sandbox_side.channel, config);
        let loader = ExtensionLoader::new(sandbox.clone(), Arc::clone(&self.source));
        sandbox.connect(sandbox_side.inbox);
        self.loaders.insert(id, loader.clone());

        let closed = sandbox.closed();
        let loaders = Arc::clone(&self.loaders);
        tokio::spawn(async move {
            closed.await;
            loaders.remove(&id);
            tracing::debug!(peer = %id, "extension sandbox closed");
        });

        loader.start();
        Ok(id)
    }
}
