//! Extension manager.
//!
//! The coordinator-side half of extension loading, installed as the
//! coordinator's local `extensions` service.  Loading a location works like
//! this:
//!
//! 1. [`ExtensionManager::load_extension`] queues the location and asks the
//!    [`SandboxHost`] for a fresh sandbox.
//! 2. The sandbox's loader calls `allocateWorker`, which pops the oldest
//!    queued location and hands it out together with a new worker id.
//! 3. Each service the extension declares is confirmed with
//!    `registerExtensionService`.
//! 4. `onWorkerInit` settles the future returned in step 1.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use relay_kernel::{
    Coordinator, DispatchError, EXTENSIONS_SERVICE, Fault, ServiceProvider, WeakCoordinator,
    control,
};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::error::{ExtensionError, Result};
use crate::host::SandboxHost;

/// Identifier the manager hands to each extension sandbox.
pub type WorkerId = u64;

type LoadFuture = Shared<BoxFuture<'static, Result<()>>>;

struct PendingLoad {
    location: String,
    done: oneshot::Sender<Result<()>>,
}

/// Coordinator-side registry of extension workers.
///
/// Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    coordinator: WeakCoordinator,
    host: Arc<dyn SandboxHost>,
    next_worker_id: AtomicU64,
    /// Requested locations not yet handed to a worker, oldest first.
    pending_locations: Mutex<VecDeque<PendingLoad>>,
    /// Workers that were allocated a location but have not reported yet.
    pending_workers: DashMap<WorkerId, PendingLoad>,
    /// Loads started but not yet settled, by location.
    in_flight: DashMap<String, LoadFuture>,
    loaded_locations: DashMap<String, WorkerId>,
    loaded_services: Mutex<Vec<String>>,
}

impl ExtensionManager {
    /// Create a manager and register it as `coordinator`'s `extensions`
    /// service.
    pub fn install(coordinator: &Coordinator, host: Arc<dyn SandboxHost>) -> Result<Self> {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                coordinator: coordinator.downgrade(),
                host,
                next_worker_id: AtomicU64::new(0),
                pending_locations: Mutex::new(VecDeque::new()),
                pending_workers: DashMap::new(),
                in_flight: DashMap::new(),
                loaded_locations: DashMap::new(),
                loaded_services: Mutex::new(Vec::new()),
            }),
        };
        coordinator.set_service_sync(EXTENSIONS_SERVICE, manager.provider()?)?;
        tracing::info!("extension manager installed");
        Ok(manager)
    }

    fn provider(&self) -> Result<ServiceProvider> {
        let allocate = self.clone();
        let register = self.clone();
        let init = self.clone();
        let provider = ServiceProvider::builder()
            .method(control::ALLOCATE_WORKER, move |_| {
                let (worker_id, location) = allocate.allocate_worker().map_err(|e| e.to_fault())?;
                Ok(json!([worker_id, location]))
            })
            .method(control::REGISTER_EXTENSION_SERVICE, move |inv| {
                let service: String = inv.arg_as(0)?;
                register
                    .register_extension_service(&service)
                    .map_err(|e| e.to_fault())?;
                Ok(Value::Null)
            })
            .method(control::ON_WORKER_INIT, move |inv| {
                let worker_id: WorkerId = inv.arg_as(0)?;
                let error = inv.arg(1).filter(|e| !e.is_null()).cloned().map(Fault::new);
                init.on_worker_init(worker_id, error).map_err(|e| e.to_fault())?;
                Ok(Value::Null)
            })
            .build()?;
        Ok(provider)
    }

    fn coordinator(&self) -> Result<Coordinator> {
        self.inner
            .coordinator
            .upgrade()
            .ok_or_else(|| ExtensionError::Host("coordinator has shut down".into()))
    }

    /// Load the extension at `location` into a new sandbox.
    ///
    /// Resolves when the extension's worker reports `onWorkerInit`.  A
    /// location that was already loaded resolves at once; one that is still
    /// loading shares the outcome of the load in progress.
    pub fn load_extension(&self, location: &str) -> BoxFuture<'static, Result<()>> {
        if self.is_extension_loaded(location) {
            tracing::info!(location = %location, "extension already loaded");
            return future::ready(Ok(())).boxed();
        }
        let coordinator = match self.coordinator() {
            Ok(coordinator) => coordinator,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let (done, settled) = oneshot::channel();
        let load: LoadFuture = async move {
            settled
                .await
                .unwrap_or_else(|_| Err(ExtensionError::Host("extension load abandoned".into())))
        }
        .boxed()
        .shared();

        match self.inner.in_flight.entry(location.to_owned()) {
            Entry::Occupied(entry) => {
                tracing::info!(location = %location, "extension already loading");
                return entry.get().clone().boxed();
            }
            Entry::Vacant(entry) => {
                entry.insert(load.clone());
            }
        }
        lock(&self.inner.pending_locations).push_back(PendingLoad {
            location: location.to_owned(),
            done,
        });

        match self.inner.host.spawn(&coordinator) {
            Ok(peer) => {
                tracing::info!(location = %location, peer = %peer, "extension sandbox started");
            }
            Err(err) => {
                let mut queue = lock(&self.inner.pending_locations);
                if let Some(index) = queue.iter().rposition(|p| p.location == location) {
                    queue.remove(index);
                }
                drop(queue);
                self.inner.in_flight.remove(location);
                return future::ready(Err(err)).boxed();
            }
        }

        load.boxed()
    }

    /// Hand the oldest queued location to a new worker.
    pub fn allocate_worker(&self) -> Result<(WorkerId, String)> {
        let pending = lock(&self.inner.pending_locations)
            .pop_front()
            .ok_or(ExtensionError::NoPendingExtension)?;
        let worker_id = self.inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let location = pending.location.clone();
        self.inner.pending_workers.insert(worker_id, pending);
        tracing::debug!(worker_id, location = %location, "worker allocated");
        Ok((worker_id, location))
    }

    /// Confirm that an extension service is reachable through the directory.
    pub fn register_extension_service(&self, service: &str) -> Result<()> {
        if self.coordinator()?.provider_of(service).is_none() {
            return Err(DispatchError::ServiceNotFound {
                service: service.to_owned(),
            }
            .into());
        }
        lock(&self.inner.loaded_services).push(service.to_owned());
        tracing::info!(service = %service, "extension service registered");
        Ok(())
    }

    /// Settle the pending load of `worker_id`.
    pub fn on_worker_init(&self, worker_id: WorkerId, error: Option<Fault>) -> Result<()> {
        let Some((_, pending)) = self.inner.pending_workers.remove(&worker_id) else {
            tracing::warn!(worker_id, "onWorkerInit from unknown worker");
            return Err(ExtensionError::UnknownWorker { worker_id });
        };

        let outcome = match error {
            None => {
                self.inner
                    .loaded_locations
                    .insert(pending.location.clone(), worker_id);
                tracing::info!(worker_id, location = %pending.location, "extension loaded");
                Ok(())
            }
            Some(fault) => {
                tracing::error!(worker_id, location = %pending.location, error = %fault, "extension reported a load failure");
                Err(ExtensionError::LoadFailure {
                    location: pending.location.clone(),
                    reason: fault.to_string(),
                })
            }
        };

        self.inner.in_flight.remove(&pending.location);
        if pending.done.send(outcome).is_err() {
            tracing::debug!(worker_id, "nobody is waiting for this extension load");
        }
        Ok(())
    }

    /// Extension services confirmed so far, in registration order.
    pub fn loaded_services(&self) -> Vec<String> {
        lock(&self.inner.loaded_services).clone()
    }

    pub fn is_extension_loaded(&self, location: &str) -> bool {
        self.inner.loaded_locations.contains_key(location)
    }

    pub fn is_extension_loading(&self, location: &str) -> bool {
        self.inner.in_flight.contains_key(location)
    }

    /// Locations waiting for a worker, plus workers still loading.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending_locations).len() + self.inner.pending_workers.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use relay_kernel::{Dispatcher, PeerId};

    use super::*;

    /// Host that never starts anything.
    struct IdleHost;

    impl SandboxHost for IdleHost {
        fn spawn(&self, _coordinator: &Coordinator) -> Result<PeerId> {
            Ok(PeerId::nil())
        }
    }

    struct FailingHost;

    impl SandboxHost for FailingHost {
        fn spawn(&self, _coordinator: &Coordinator) -> Result<PeerId> {
            Err(ExtensionError::Host("no room".into()))
        }
    }

    /// Host that counts sandboxes instead of starting them.
    #[derive(Default)]
    struct CountingHost {
        spawned: AtomicU64,
    }

    impl SandboxHost for CountingHost {
        fn spawn(&self, _coordinator: &Coordinator) -> Result<PeerId> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(PeerId::nil())
        }
    }

    fn install(host: Arc<dyn SandboxHost>) -> (Coordinator, ExtensionManager) {
        let coordinator = Coordinator::default();
        let manager = ExtensionManager::install(&coordinator, host).expect("install");
        (coordinator, manager)
    }

    #[tokio::test]
    async fn workers_receive_locations_in_request_order() {
        let (_coordinator, manager) = install(Arc::new(IdleHost));
        let _a = manager.load_extension("demo/a");
        let _b = manager.load_extension("demo/b");

        assert_eq!(manager.allocate_worker().unwrap(), (0, "demo/a".to_owned()));
        assert_eq!(manager.allocate_worker().unwrap(), (1, "demo/b".to_owned()));
        assert!(matches!(
            manager.allocate_worker(),
            Err(ExtensionError::NoPendingExtension)
        ));
    }

    #[tokio::test]
    async fn worker_init_settles_the_load() {
        let (_coordinator, manager) = install(Arc::new(IdleHost));
        let load = manager.load_extension("demo/a");
        let (worker_id, _) = manager.allocate_worker().unwrap();

        manager.on_worker_init(worker_id, None).unwrap();
        load.await.expect("loaded");
        assert!(manager.is_extension_loaded("demo/a"));
        assert_eq!(manager.pending_count(), 0);

        // Already loaded: no new sandbox, no new queue entry.
        manager.load_extension("demo/a").await.unwrap();
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn worker_init_with_error_fails_the_load() {
        let (_coordinator, manager) = install(Arc::new(IdleHost));
        let load = manager.load_extension("demo/broken");
        let (worker_id, _) = manager.allocate_worker().unwrap();

        manager
            .on_worker_init(worker_id, Some(Fault::message("cannot start")))
            .unwrap();
        let err = load.await.unwrap_err();
        assert!(matches!(err, ExtensionError::LoadFailure { ref reason, .. } if reason == "cannot start"));
        assert!(!manager.is_extension_loaded("demo/broken"));
    }

    #[tokio::test]
    async fn concurrent_loads_of_one_location_share_a_worker() {
        let host = Arc::new(CountingHost::default());
        let (_coordinator, manager) = install(host.clone());

        let first = manager.load_extension("demo/a");
        let second = manager.load_extension("demo/a");
        assert_eq!(host.spawned.load(Ordering::SeqCst), 1);
        assert!(manager.is_extension_loading("demo/a"));

        let (worker_id, _) = manager.allocate_worker().unwrap();
        assert!(matches!(
            manager.allocate_worker(),
            Err(ExtensionError::NoPendingExtension)
        ));
        manager.on_worker_init(worker_id, None).unwrap();

        let (first, second) = futures::future::join(first, second).await;
        first.unwrap();
        second.unwrap();
        assert!(!manager.is_extension_loading("demo/a"));
        assert!(manager.is_extension_loaded("demo/a"));
    }

    #[tokio::test]
    async fn failed_location_can_be_loaded_again() {
        let host = Arc::new(CountingHost::default());
        let (_coordinator, manager) = install(host.clone());

        let first = manager.load_extension("demo/a");
        let (worker_id, _) = manager.allocate_worker().unwrap();
        manager
            .on_worker_init(worker_id, Some(Fault::message("flaky")))
            .unwrap();
        assert!(first.await.is_err());
        assert!(!manager.is_extension_loading("demo/a"));

        let _retry = manager.load_extension("demo/a");
        assert_eq!(host.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn unknown_worker_is_rejected() {
        let (_coordinator, manager) = install(Arc::new(IdleHost));
        assert!(matches!(
            manager.on_worker_init(42, None),
            Err(ExtensionError::UnknownWorker { worker_id: 42 })
        ));
    }

    #[tokio::test]
    async fn host_failure_unqueues_the_location() {
        let (_coordinator, manager) = install(Arc::new(FailingHost));
        let err = manager.load_extension("demo/a").await.unwrap_err();
        assert!(matches!(err, ExtensionError::Host(_)));
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.is_extension_loading("demo/a"));
    }

    #[tokio::test]
    async fn services_must_be_in_the_directory() {
        let (_coordinator, manager) = install(Arc::new(IdleHost));
        let err = manager.register_extension_service("extension.0.0").unwrap_err();
        assert!(err.to_string().contains("extension.0.0"));
        assert!(manager.loaded_services().is_empty());
    }

    #[tokio::test]
    async fn reachable_through_the_coordinator() {
        let (coordinator, manager) = install(Arc::new(IdleHost));
        let _load = manager.load_extension("demo/a");

        let allocation = coordinator
            .call(EXTENSIONS_SERVICE, control::ALLOCATE_WORKER, vec![])
            .await
            .unwrap();
        assert_eq!(allocation, json!([0, "demo/a"]));

        let err = coordinator
            .call(EXTENSIONS_SERVICE, control::ALLOCATE_WORKER, vec![])
            .await
            .unwrap_err();
        match err {
            DispatchError::Remote(fault) => assert_eq!(fault.value()["name"], "NoPendingExtension"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
