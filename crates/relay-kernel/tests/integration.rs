//! Integration tests for the relay-kernel crate.
//!
//! These tests wire a coordinator and several sandboxes together over
//! in-process channels and exercise calls in every direction.

use std::future::Future;
use std::time::Duration;

use relay_kernel::{
    Coordinator, DispatchConfig, DispatchError, Dispatcher, Fault, LocalChannel, PeerId, Sandbox,
    ServiceProvider,
};
use serde_json::{Value, json};

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn link(coordinator: &Coordinator) -> (PeerId, Sandbox) {
    let (coordinator_side, sandbox_side) = LocalChannel::pair(coordinator.config());
    let id = coordinator.attach(coordinator_side.channel, coordinator_side.inbox);
    let sandbox = Sandbox::new(sandbox_side.channel, coordinator.config().clone());
    sandbox.connect(sandbox_side.inbox);
    (id, sandbox)
}

fn test_service() -> ServiceProvider {
    ServiceProvider::builder()
        .method("returnFortyTwo", |_| Ok(json!(42)))
        .method("doubleArgument", |inv| {
            let n: i64 = inv.arg_as(0)?;
            Ok(json!(n * 2))
        })
        .method("throwException", |_| {
            Err(Fault::message("This is a test exception"))
        })
        .method("echo", |inv| Ok(inv.arg(0).cloned().unwrap_or(Value::Null)))
        .method("countBytes", |inv| {
            Ok(json!(inv.transfer.iter().map(Vec::len).sum::<usize>()))
        })
        .build()
        .expect("valid provider")
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sandbox_connects_after_coordinator_handshake() {
    let coordinator = Coordinator::default();
    let (_, sandbox) = link(&coordinator);

    within(sandbox.wait_for_connection()).await;
    assert!(sandbox.is_connected());
    assert_eq!(coordinator.sandbox_count(), 1);
}

#[tokio::test]
async fn registration_settles_once_the_directory_knows_the_service() {
    let coordinator = Coordinator::default();
    let (id, sandbox) = link(&coordinator);

    within(sandbox.set_service("SandboxDispatchTest", test_service()))
        .await
        .expect("registered");

    assert_eq!(coordinator.provider_of("SandboxDispatchTest"), Some(id));
    assert_eq!(
        coordinator.directory_snapshot(),
        vec![("SandboxDispatchTest".to_owned(), id)]
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sandbox_calls_a_service_in_another_sandbox() {
    let coordinator = Coordinator::default();
    let (_, provider) = link(&coordinator);
    let (_, caller) = link(&coordinator);

    within(provider.set_service("test", test_service())).await.unwrap();
    within(caller.wait_for_connection()).await;

    assert_eq!(within(caller.call("test", "returnFortyTwo", vec![])).await.unwrap(), json!(42));
    assert_eq!(
        within(caller.call("test", "doubleArgument", vec![json!(123)])).await.unwrap(),
        json!(246)
    );
    for falsy in [json!(0), json!(false), json!(""), Value::Null] {
        let got = within(caller.call("test", "echo", vec![falsy.clone()])).await.unwrap();
        assert_eq!(got, falsy);
    }
}

#[tokio::test]
async fn provider_faults_cross_two_hops_verbatim() {
    let coordinator = Coordinator::default();
    let (_, provider) = link(&coordinator);
    let (_, caller) = link(&coordinator);
    within(provider.set_service("test", test_service())).await.unwrap();

    let err = within(caller.call("test", "throwException", vec![])).await.unwrap_err();
    match err {
        DispatchError::Remote(fault) => {
            assert_eq!(fault, Fault::message("This is a test exception"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn coordinator_and_sandbox_call_each_other() {
    let coordinator = Coordinator::default();
    coordinator
        .set_service_sync("LocalDispatchTest", test_service())
        .unwrap();
    let (_, sandbox) = link(&coordinator);
    within(sandbox.set_service("SandboxDispatchTest", test_service())).await.unwrap();

    assert_eq!(
        within(sandbox.call("LocalDispatchTest", "doubleArgument", vec![json!(5)])).await.unwrap(),
        json!(10)
    );
    assert_eq!(
        within(coordinator.call("SandboxDispatchTest", "returnFortyTwo", vec![])).await.unwrap(),
        json!(42)
    );
    assert!(coordinator.is_remote_service("SandboxDispatchTest"));
    assert!(!coordinator.is_remote_service("LocalDispatchTest"));
}

#[tokio::test]
async fn unknown_service_error_names_the_service() {
    let coordinator = Coordinator::default();
    let (_, sandbox) = link(&coordinator);

    let err = within(sandbox.call("no-such-service", "m", vec![])).await.unwrap_err();
    assert!(err.to_string().contains("no-such-service"));
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let coordinator = Coordinator::default();
    let (_, provider) = link(&coordinator);
    let (_, caller) = link(&coordinator);
    within(provider.set_service("test", test_service())).await.unwrap();

    let err = within(caller.call("test", "missingMethod", vec![])).await.unwrap_err();
    match err {
        DispatchError::Remote(fault) => assert_eq!(fault.value()["name"], "MethodNotFound"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn transfer_list_reaches_a_provider_two_hops_away() {
    let coordinator = Coordinator::default();
    let (_, provider) = link(&coordinator);
    let (_, caller) = link(&coordinator);
    within(provider.set_service("test", test_service())).await.unwrap();

    let buffers = vec![vec![0u8; 10], vec![1u8; 6]];
    let total = within(caller.transfer_call("test", "countBytes", buffers, vec![]))
        .await
        .unwrap();
    assert_eq!(total, json!(16));

    let none = within(caller.call("test", "countBytes", vec![])).await.unwrap();
    assert_eq!(none, json!(0));
}

#[tokio::test]
async fn many_concurrent_calls_resolve_to_their_own_results() {
    let coordinator = Coordinator::default();
    let (_, provider) = link(&coordinator);
    let (_, caller) = link(&coordinator);
    within(provider.set_service("test", test_service())).await.unwrap();

    let calls: Vec<_> = (0..50)
        .map(|n| caller.call("test", "doubleArgument", vec![json!(n)]))
        .collect();
    let results = within(futures::future::join_all(calls)).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(n as i64 * 2));
    }
    assert!(caller.pending().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn terminate_closes_the_sandbox() {
    let coordinator = Coordinator::default();
    let (id, sandbox) = link(&coordinator);
    within(sandbox.wait_for_connection()).await;

    within(coordinator.terminate(id)).await.expect("terminated");
    within(sandbox.closed()).await;

    assert!(sandbox.is_closed());
    assert_eq!(coordinator.sandbox_count(), 0);
}

#[tokio::test]
async fn stale_directory_entries_fail_after_shutdown() {
    let coordinator = Coordinator::default();
    let (id, provider) = link(&coordinator);
    within(provider.set_service("test", test_service())).await.unwrap();
    within(coordinator.terminate(id)).await.unwrap();

    assert_eq!(coordinator.provider_of("test"), Some(id));
    let err = within(coordinator.call("test", "returnFortyTwo", vec![])).await.unwrap_err();
    assert!(matches!(err, DispatchError::ChannelClosed));
}

#[tokio::test]
async fn independent_coordinators_do_not_share_state() {
    let first = Coordinator::new(DispatchConfig::default());
    let second = Coordinator::new(DispatchConfig::default());
    first.set_service_sync("only-here", test_service()).unwrap();

    assert!(first.has_service("only-here"));
    assert!(!second.has_service("only-here"));
}
