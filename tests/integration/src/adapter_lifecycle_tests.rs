//! Adapter lifecycle scenarios
//!
//! - Adapters with configuration but no endpoints
//! - Anonymous adapters and their proxies
//! - Activation rolled back when the locator registry is unreachable
//! - Hold, deactivation and concurrent destruction

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use rpcnet::{
    EndpointFactoryManager, Identity, LocalError, OperationMode, OutgoingConnection,
    OutgoingSettings,
};
use rpcobj::{AdapterState, Locator, LocatorRegistry, LocatorRegistryError, Proxy};

use common::*;

/// Locator whose registry can be switched between unreachable and working
struct SwitchableLocator {
    weak_self: Weak<SwitchableLocator>,
    reachable: AtomicBool,
    registrations: AtomicUsize,
}

impl SwitchableLocator {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            reachable: AtomicBool::new(reachable),
            registrations: AtomicUsize::new(0),
        })
    }
}

impl LocatorRegistry for SwitchableLocator {
    fn set_adapter_direct_proxy(
        &self,
        _adapter_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LocalError::ConnectTimeout.into());
        }
        if proxy.is_some() {
            self.registrations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_replicated_adapter_direct_proxy(
        &self,
        adapter_id: &str,
        _replica_group_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError> {
        self.set_adapter_direct_proxy(adapter_id, proxy)
    }
}

impl Locator for SwitchableLocator {
    fn identity(&self) -> Identity {
        Identity::with_category("Locator", "Test")
    }

    fn registry(&self) -> Option<Arc<dyn LocatorRegistry>> {
        let registry: Arc<dyn LocatorRegistry> = self.weak_self.upgrade()?;
        Some(registry)
    }

    fn find_adapter_by_id(&self, _adapter_id: &str) -> Result<Option<Proxy>, LocalError> {
        Ok(None)
    }
}

#[test]
fn test_configured_adapter_without_endpoints() {
    init_logging();

    let communicator = communicator(&[("A.ACM.Timeout", "30")]);
    let adapter = communicator.create_object_adapter("A").unwrap();
    assert!(adapter.get_endpoints().is_empty());

    adapter.activate().unwrap();
    assert_eq!(adapter.state(), AdapterState::Active);
    assert!(adapter.get_endpoints().is_empty());
    assert_eq!(adapter.get_acm().timeout, Duration::from_secs(30));

    communicator.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_anonymous_adapter() {
    init_logging();

    let communicator = communicator(&[]);
    let adapter = communicator.create_object_adapter("").unwrap();
    assert_eq!(adapter.get_name(), "");

    let proxy = adapter.add(echo_servant(), Identity::new("hello")).unwrap();
    assert!(!proxy.is_indirect());
    assert_eq!(proxy.endpoints(), adapter.get_published_endpoints().as_slice());

    adapter.activate().unwrap();
    let reply = communicator
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"local"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"local");

    communicator.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_activation_rolls_back_when_locator_unreachable() {
    init_logging();

    let communicator = communicator(&[("C.Endpoints", LOOPBACK), ("C.AdapterId", "C")]);
    let locator = SwitchableLocator::new(false);
    communicator.set_default_locator(Some(locator.clone()));

    let adapter = communicator.create_object_adapter("C").unwrap();
    adapter.add(echo_servant(), Identity::new("echo")).unwrap();

    let activating = adapter.clone();
    let result = tokio::task::spawn_blocking(move || activating.activate())
        .await
        .unwrap();
    assert_eq!(result, Err(LocalError::ConnectTimeout));
    assert_eq!(adapter.state(), AdapterState::Uninitialized);

    // The listener is bound but never validates a connection
    let port = adapter.get_endpoints()[0].port();
    let target = EndpointFactoryManager::default()
        .create(&format!("tcp -h 127.0.0.1 -p {} -t 300", port), false)
        .unwrap()
        .unwrap();
    assert!(OutgoingConnection::connect(&target, &OutgoingSettings::default())
        .await
        .is_err());

    locator.reachable.store(true, Ordering::SeqCst);
    let activating = adapter.clone();
    tokio::task::spawn_blocking(move || activating.activate())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(adapter.state(), AdapterState::Active);
    assert_eq!(locator.registrations.load(Ordering::SeqCst), 1);

    let client = common::communicator(&[]);
    let proxy = client
        .string_to_proxy(&format!("echo:tcp -h 127.0.0.1 -p {}", port))
        .unwrap();
    let reply = client
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"up"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"up");

    client.destroy();
    communicator.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hold_delays_dispatch_until_activate() {
    init_logging();

    let (server, adapter) = echo_server("Held");
    let client = Arc::new(communicator(&[]));
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();

    // Open the connection while active
    client
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();

    adapter.hold().unwrap();
    let holding = adapter.clone();
    tokio::task::spawn_blocking(move || holding.wait_for_hold())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(adapter.state(), AdapterState::Held);

    let call = {
        let client = client.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            client
                .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"held"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!call.is_finished());

    adapter.activate().unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.as_ref(), b"held");

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_finishes_running_dispatch() {
    init_logging();

    let (server, adapter) = echo_server("Draining");
    let client = Arc::new(communicator(&[]));
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();
    client
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();

    let slow = {
        let client = client.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            client
                .invoke(&proxy, "slow", OperationMode::Normal, Bytes::from_static(b"late"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deactivating = adapter.clone();
    tokio::task::spawn_blocking(move || {
        deactivating.deactivate();
        deactivating.wait_for_deactivate();
    })
    .await
    .unwrap();
    assert_eq!(adapter.state(), AdapterState::Deactivated);

    let reply = slow.await.unwrap().unwrap();
    assert_eq!(reply.as_ref(), b"late");

    // Nothing listens any more
    assert!(client
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::new())
        .await
        .is_err());

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_destroy() {
    init_logging();

    let (server, adapter) = echo_server("Twice");
    let destroyers = (0..2).map(|_| {
        let adapter = adapter.clone();
        tokio::task::spawn_blocking(move || adapter.destroy())
    });
    for result in join_all(destroyers).await {
        result.unwrap();
    }

    assert_eq!(adapter.state(), AdapterState::Destroyed);
    assert_eq!(server.adapter_factory().adapter_count(), 0);
    assert!(matches!(
        adapter.add(echo_servant(), Identity::new("late")),
        Err(LocalError::ObjectAdapterDeactivated(_))
    ));
    server.destroy();
}

#[test]
fn test_communicator_destroy_tears_down_adapters() {
    init_logging();

    let communicator = communicator(&[
        ("One.Endpoints", LOOPBACK),
        ("Two.Endpoints", LOOPBACK),
        ("Two.ThreadPool.Size", "2"),
    ]);
    let one = communicator.create_object_adapter("One").unwrap();
    let two = communicator.create_object_adapter("Two").unwrap();
    one.activate().unwrap();
    two.activate().unwrap();
    assert!(!Arc::ptr_eq(&one.get_thread_pool(), &two.get_thread_pool()));

    communicator.destroy();
    assert_eq!(one.state(), AdapterState::Destroyed);
    assert_eq!(two.state(), AdapterState::Destroyed);
    assert!(two.get_thread_pool().is_destroyed());
    assert!(matches!(
        communicator.create_object_adapter("Three"),
        Err(LocalError::CommunicatorDestroyed)
    ));
}
