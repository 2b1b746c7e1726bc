//! Integration tests for the relay-extensions crate.
//!
//! These tests load extensions into in-process sandboxes through the
//! coordinator's `extensions` service and call the services they declare.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relay_extensions::{
    ExtensionCatalog, ExtensionError, ExtensionManager, InProcessHost, LoaderState,
};
use relay_kernel::{Coordinator, Dispatcher, Fault, LocalChannel, Sandbox, ServiceProvider};
use serde_json::json;

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn eventually(check: impl Fn() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

fn constant(value: i64) -> ServiceProvider {
    ServiceProvider::builder()
        .method("value", move |_| Ok(json!(value)))
        .build()
        .expect("valid provider")
}

fn catalog() -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with_extension("demo/three", |registrar| {
            for n in 0..3 {
                drop(registrar.register(constant(n)));
            }
            Ok(())
        })
        .with_extension("demo/one", |registrar| {
            drop(registrar.register(constant(100)));
            Ok(())
        })
        .with_extension("demo/broken", |_| Err(Fault::message("cannot start")))
        .with_extension("demo/partial", |registrar| {
            drop(registrar.register(constant(7)));
            Err(Fault::message("late failure"))
        })
        .with_extension("demo/panics", |_| panic!("entry point exploded"))
}

fn setup() -> (Coordinator, Arc<InProcessHost>, ExtensionManager) {
    let coordinator = Coordinator::default();
    let host = Arc::new(InProcessHost::new(Arc::new(catalog())));
    let manager = ExtensionManager::install(&coordinator, host.clone()).expect("install");
    (coordinator, host, manager)
}

// ═══════════════════════════════════════════════════════════════════════
//  Loading
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn worker_reports_ready_only_after_every_initial_registration() {
    let (coordinator, host, manager) = setup();

    within(manager.load_extension("demo/three")).await.expect("loaded");

    // onWorkerInit settled the load, so all three confirmations came first.
    let mut services = manager.loaded_services();
    services.sort();
    assert_eq!(
        services,
        vec!["extension.0.0", "extension.0.1", "extension.0.2"]
    );
    for (n, service) in services.iter().enumerate() {
        assert!(coordinator.provider_of(service).is_some());
        let value = within(coordinator.call(service, "value", vec![])).await.unwrap();
        assert_eq!(value, json!(n));
    }

    eventually(|| host.loader_states().iter().all(|(_, s)| *s == LoaderState::Ready)).await;
    assert!(manager.is_extension_loaded("demo/three"));
}

#[tokio::test]
async fn extension_services_are_callable_from_other_sandboxes() {
    let (coordinator, _host, manager) = setup();
    within(manager.load_extension("demo/one")).await.unwrap();

    let (coordinator_side, sandbox_side) = LocalChannel::pair(coordinator.config());
    coordinator.attach(coordinator_side.channel, coordinator_side.inbox);
    let client = Sandbox::new(sandbox_side.channel, coordinator.config().clone());
    client.connect(sandbox_side.inbox);

    let value = within(client.call("extension.0.0", "value", vec![])).await.unwrap();
    assert_eq!(value, json!(100));
}

#[tokio::test]
async fn concurrent_loads_get_distinct_workers() {
    let (coordinator, _host, manager) = setup();

    let (three, one) = within(futures::future::join(
        manager.load_extension("demo/three"),
        manager.load_extension("demo/one"),
    ))
    .await;
    three.unwrap();
    one.unwrap();

    assert_eq!(manager.loaded_services().len(), 4);
    assert_eq!(coordinator.sandbox_count(), 2);
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_loads_of_one_location_start_one_sandbox() {
    let (coordinator, _host, manager) = setup();

    let (first, second) = within(futures::future::join(
        manager.load_extension("demo/three"),
        manager.load_extension("demo/three"),
    ))
    .await;
    first.unwrap();
    second.unwrap();

    assert_eq!(coordinator.sandbox_count(), 1);
    assert_eq!(manager.loaded_services().len(), 3);
}

#[tokio::test]
async fn terminated_sandboxes_leave_the_host() {
    let (coordinator, host, manager) = setup();
    within(manager.load_extension("demo/one")).await.unwrap();
    within(manager.load_extension("demo/three")).await.unwrap();
    assert_eq!(host.loader_states().len(), 2);

    for (_, result) in within(coordinator.terminate_all()).await {
        result.unwrap();
    }
    eventually(|| host.loader_states().is_empty()).await;
}

#[tokio::test]
async fn loading_the_same_location_twice_starts_one_sandbox() {
    let (coordinator, _host, manager) = setup();
    within(manager.load_extension("demo/one")).await.unwrap();
    within(manager.load_extension("demo/one")).await.unwrap();

    assert_eq!(coordinator.sandbox_count(), 1);
    assert_eq!(manager.loaded_services(), vec!["extension.0.0"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failing_entry_point_is_reported_as_load_failure() {
    let (_coordinator, host, manager) = setup();

    let err = within(manager.load_extension("demo/broken")).await.unwrap_err();
    match err {
        ExtensionError::LoadFailure { location, reason } => {
            assert_eq!(location, "demo/broken");
            assert!(reason.contains("cannot start"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(!manager.is_extension_loaded("demo/broken"));
    eventually(|| host.loader_states().iter().all(|(_, s)| *s == LoaderState::LoadFailed)).await;
}

#[tokio::test]
async fn failed_load_still_finishes_its_registrations_first() {
    let (coordinator, _host, manager) = setup();

    let err = within(manager.load_extension("demo/partial")).await.unwrap_err();
    assert!(err.to_string().contains("late failure"));

    // The failure reached the manager only after the service was confirmed.
    assert_eq!(manager.loaded_services(), vec!["extension.0.0"]);
    assert!(coordinator.provider_of("extension.0.0").is_some());
    assert!(!manager.is_extension_loaded("demo/partial"));
    assert!(!manager.is_extension_loading("demo/partial"));
}

#[tokio::test]
async fn panicking_entry_point_is_reported_as_load_failure() {
    let (_coordinator, _host, manager) = setup();
    let err = within(manager.load_extension("demo/panics")).await.unwrap_err();
    assert!(err.to_string().contains("entry point exploded"));
}

#[tokio::test]
async fn unknown_location_is_reported_as_load_failure() {
    let (_coordinator, _host, manager) = setup();
    let err = within(manager.load_extension("demo/missing")).await.unwrap_err();
    match err {
        ExtensionError::LoadFailure { reason, .. } => assert!(reason.contains("demo/missing")),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn extension_control_methods_are_reachable_through_dispatch() {
    let (coordinator, _host, manager) = setup();

    let (coordinator_side, sandbox_side) = LocalChannel::pair(coordinator.config());
    coordinator.attach(coordinator_side.channel, coordinator_side.inbox);
    let sandbox = Sandbox::new(sandbox_side.channel, coordinator.config().clone());
    sandbox.connect(sandbox_side.inbox);

    let err = within(sandbox.call(relay_kernel::DISPATCH_SERVICE, "allocateWorker", vec![]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no extension is waiting"));
    assert_eq!(manager.pending_count(), 0);
}
