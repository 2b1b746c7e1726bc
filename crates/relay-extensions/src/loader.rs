//! Extension loader.
//!
//! One [`ExtensionLoader`] runs inside every extension sandbox.  It asks the
//! coordinator's `extensions` service for a worker id and a location, runs the
//! extension found there, and reports back once every service the extension
//! declared while loading is reachable:
//!
//! ```text
//! Created ─► Connecting ─► Allocated ─► Loading ─► Registering ─► Ready
//!                                          │
//!                                          └─────► LoadFailed
//! ```
//!
//! Services are registered under `extension.<workerId>.<extensionId>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use relay_kernel::{Dispatcher, EXTENSIONS_SERVICE, Sandbox, ServiceProvider, control};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{ExtensionError, Result};
use crate::manager::WorkerId;
use crate::source::ExtensionSource;

/// Where a loader is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderState {
    Created,
    /// Waiting for the coordinator's handshake.
    Connecting,
    /// Holding a worker id and a location.
    Allocated,
    /// Running the extension's entry point.
    Loading,
    /// Waiting for the registrations made while loading.
    Registering,
    Ready,
    LoadFailed,
}

impl std::fmt::Display for LoaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Allocated => "allocated",
            Self::Loading => "loading",
            Self::Registering => "registering",
            Self::Ready => "ready",
            Self::LoadFailed => "load_failed",
        };
        f.write_str(name)
    }
}

type Registration = Shared<BoxFuture<'static, Result<()>>>;

/// Loads one extension into one sandbox.
#[derive(Clone)]
pub struct ExtensionLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    sandbox: Sandbox,
    source: Arc<dyn ExtensionSource>,
    state: Mutex<LoaderState>,
    worker_id: OnceLock<WorkerId>,
    next_extension_id: AtomicU64,
    /// `Some` only while the entry point runs.
    initial: Mutex<Option<Vec<Registration>>>,
}

/// The capability handed to an extension's entry point.
pub struct Registrar {
    loader: ExtensionLoader,
}

impl ExtensionLoader {
    pub fn new(sandbox: Sandbox, source: Arc<dyn ExtensionSource>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                sandbox,
                source,
                state: Mutex::new(LoaderState::Created),
                worker_id: OnceLock::new(),
                next_extension_id: AtomicU64::new(0),
                initial: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LoaderState {
        *lock(&self.inner.state)
    }

    /// Worker id assigned by the coordinator, once allocated.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.inner.worker_id.get().copied()
    }

    /// Number of services registered so far.
    pub fn extension_count(&self) -> u64 {
        self.inner.next_extension_id.load(Ordering::SeqCst)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.inner.sandbox
    }

    fn set_state(&self, state: LoaderState) {
        let mut current = lock(&self.inner.state);
        let previous = *current;
        tracing::debug!(from = %previous, to = %state, worker_id = ?self.worker_id(), "loader state changed");
        *current = state;
    }

    /// Run the loader on a new task, logging how it ended.
    pub fn start(&self) -> tokio::task::JoinHandle<Result<LoaderState>> {
        let loader = self.clone();
        tokio::spawn(async move {
            let outcome = loader.run().await;
            let peer = loader.inner.sandbox.upstream().id();
            match &outcome {
                Ok(state) => tracing::debug!(peer = %peer, state = %state, "extension loader finished"),
                Err(err) => tracing::error!(peer = %peer, error = %err, "extension loader could not reach the coordinator"),
            }
            outcome
        })
    }

    /// Allocate, load, and report.
    ///
    /// A failed load is reported to the coordinator through `onWorkerInit`
    /// and yields `Ok(LoaderState::LoadFailed)`; `Err` means the coordinator
    /// could not be reached at all.
    pub async fn run(&self) -> Result<LoaderState> {
        self.set_state(LoaderState::Connecting);
        self.inner.sandbox.wait_for_connection().await;

        let allocation = self
            .inner
            .sandbox
            .call(EXTENSIONS_SERVICE, control::ALLOCATE_WORKER, Vec::new())
            .await?;
        let (worker_id, location) = parse_allocation(allocation)?;
        if self.inner.worker_id.set(worker_id).is_err() {
            return Err(ExtensionError::InvalidAllocation {
                reason: "loader was already allocated a worker".into(),
            });
        }
        self.set_state(LoaderState::Allocated);
        tracing::info!(worker_id, location = %location, "worker allocated");

        let outcome = self.load(&location).await;

        let mut report = vec![json!(worker_id)];
        if let Err(err) = &outcome {
            tracing::error!(worker_id, location = %location, error = %err, "extension failed to load");
            report.push(err.to_fault().into_value());
        }
        self.inner
            .sandbox
            .call(EXTENSIONS_SERVICE, control::ON_WORKER_INIT, report)
            .await?;

        let final_state = match outcome {
            Ok(()) => LoaderState::Ready,
            Err(_) => LoaderState::LoadFailed,
        };
        self.set_state(final_state);
        Ok(final_state)
    }

    async fn load(&self, location: &str) -> Result<()> {
        self.set_state(LoaderState::Loading);
        let load_failure = |reason: String| ExtensionError::LoadFailure {
            location: location.to_owned(),
            reason,
        };

        let entry = self
            .inner
            .source
            .fetch(location)
            .await
            .map_err(|err| load_failure(err.to_string()))?;

        *lock(&self.inner.initial) = Some(Vec::new());
        let registrar = Registrar {
            loader: self.clone(),
        };
        let ran = entry.run(&registrar);
        let initial = lock(&self.inner.initial).take().unwrap_or_default();

        // Registrations started before a failure still settle before the
        // worker reports.
        self.set_state(LoaderState::Registering);
        tracing::debug!(location = %location, registrations = initial.len(), "waiting for initial registrations");
        let registered = future::join_all(initial).await;

        ran.map_err(|fault| load_failure(fault.to_string()))?;
        for result in registered {
            result.map_err(|err| load_failure(format!("registration failed: {err}")))?;
        }
        Ok(())
    }

    /// Provide `provider` as the next extension service of this worker.
    ///
    /// The work starts immediately; the returned future resolves to the
    /// service name once the coordinator has acknowledged it.
    pub fn register(&self, provider: ServiceProvider) -> BoxFuture<'static, Result<String>> {
        let Some(worker_id) = self.worker_id() else {
            return future::ready(Err(ExtensionError::NotAllocated)).boxed();
        };
        let extension_id = self.inner.next_extension_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("extension.{worker_id}.{extension_id}");

        let set_service = self.inner.sandbox.set_service(name.clone(), provider);
        let sandbox = self.inner.sandbox.clone();
        let service = name.clone();
        let task = tokio::spawn(async move {
            set_service.await?;
            sandbox
                .call(
                    EXTENSIONS_SERVICE,
                    control::REGISTER_EXTENSION_SERVICE,
                    vec![json!(service)],
                )
                .await?;
            Ok(())
        });

        let registration: Registration = async move {
            task.await
                .map_err(|err| ExtensionError::Host(err.to_string()))?
        }
        .boxed()
        .shared();

        if let Some(initial) = lock(&self.inner.initial).as_mut() {
            initial.push(registration.clone());
        }
        tracing::debug!(service = %name, "extension service registered");

        async move { registration.await.map(|()| name) }.boxed()
    }
}

impl Registrar {
    /// See [`ExtensionLoader::register`].
    pub fn register(&self, provider: ServiceProvider) -> BoxFuture<'static, Result<String>> {
        self.loader.register(provider)
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.loader.worker_id()
    }

    /// Call any service from inside the extension's sandbox.
    pub fn sandbox(&self) -> &Sandbox {
        self.loader.sandbox()
    }
}

fn parse_allocation(value: Value) -> Result<(WorkerId, String)> {
    let invalid = |reason: &str| ExtensionError::InvalidAllocation {
        reason: format!("{reason}: {value}"),
    };
    let worker_id = value
        .get(0)
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("missing worker id"))?;
    let location = value
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing location"))?;
    Ok((worker_id, location.to_owned()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
