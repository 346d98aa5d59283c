//! Invocation scenarios over loopback sockets

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rpcnet::{Identity, LocalError, OperationMode, RpcError};
use rpcobj::{
    Cookie, Current, InvocationMode, LocalLocator, Locator, OperationTable, Servant,
    ServantLocator,
};

use common::*;

fn recorder(seen: Arc<Mutex<Vec<Bytes>>>) -> Arc<dyn Servant> {
    OperationTable::builder()
        .operation("record", move |_current, params| {
            let seen = seen.clone();
            async move {
                seen.lock().push(params);
                Ok(Bytes::new())
            }
        })
        .build_arc()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twoway_payload_sizes() {
    init_logging();

    let (server, adapter) = echo_server("Echo");
    let client = communicator(&[]);
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();

    for (i, len) in [0usize, 1, 100, 4096, 65_536, 512 * 1024].into_iter().enumerate() {
        let params = payload(len, i as u8);
        let reply = client
            .invoke(&proxy, "echo", OperationMode::Idempotent, params.clone())
            .await
            .unwrap();
        assert_eq!(reply, params, "payload of {} bytes", len);
    }

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_size_limit() {
    init_logging();

    let server = communicator(&[("Small.Endpoints", LOOPBACK), ("Small.MessageSizeMax", "1")]);
    let adapter = server.create_object_adapter("Small").unwrap();
    adapter.add(echo_servant(), Identity::new("echo")).unwrap();
    adapter.activate().unwrap();
    assert_eq!(adapter.message_size_max(), 1024);

    let client = communicator(&[]);
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();
    assert!(client
        .invoke(&proxy, "echo", OperationMode::Normal, payload(100, 0))
        .await
        .is_ok());
    assert!(client
        .invoke(&proxy, "echo", OperationMode::Normal, payload(8 * 1024, 0))
        .await
        .is_err());

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oneway_and_datagram() {
    init_logging();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = communicator(&[("Sink.Endpoints", "tcp -h 127.0.0.1 -p 0:udp -h 127.0.0.1 -p 0")]);
    let adapter = server.create_object_adapter("Sink").unwrap();
    adapter.add(recorder(seen.clone()), Identity::new("sink")).unwrap();
    adapter.activate().unwrap();
    assert_eq!(adapter.get_endpoints().len(), 2);

    let client = communicator(&[]);
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("sink")).unwrap().to_string())
        .unwrap();

    let oneway = proxy.with_mode(InvocationMode::Oneway);
    let reply = client
        .invoke(&oneway, "record", OperationMode::Normal, Bytes::from_static(b"tcp"))
        .await
        .unwrap();
    assert!(reply.is_empty());

    let datagram = proxy.with_mode(InvocationMode::Datagram);
    client
        .invoke(&datagram, "record", OperationMode::Normal, Bytes::from_static(b"udp"))
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || seen.lock().len() == 2).await);
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec![Bytes::from_static(b"tcp"), Bytes::from_static(b"udp")]);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_errors_cross_the_wire() {
    init_logging();

    let (server, adapter) = echo_server("Errors");
    adapter
        .add_facet(echo_servant(), Identity::new("echo"), "admin")
        .unwrap();
    let client = communicator(&[]);
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();

    let err = client
        .invoke(&proxy, "missing", OperationMode::Normal, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Local(LocalError::OperationNotExist { .. })));

    let err = client
        .invoke(&proxy.with_facet("other"), "echo", OperationMode::Normal, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Local(LocalError::FacetNotExist { .. })));

    let reply = client
        .invoke(&proxy.with_facet("admin"), "echo", OperationMode::Normal, Bytes::from_static(b"facet"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"facet");

    client.destroy();
    server.destroy();
}

/// Serves every identity of its category with one shared servant
struct CategoryLocator {
    servant: Arc<dyn Servant>,
    finished: Mutex<Vec<String>>,
}

impl ServantLocator for CategoryLocator {
    fn locate(&self, current: &Current) -> Result<Option<(Arc<dyn Servant>, Cookie)>, RpcError> {
        let cookie: Cookie = Some(Box::new(current.identity.name.clone()));
        Ok(Some((self.servant.clone(), cookie)))
    }

    fn finished(&self, _current: &Current, _servant: &Arc<dyn Servant>, cookie: Cookie) {
        if let Some(name) = cookie.and_then(|c| c.downcast::<String>().ok()) {
            self.finished.lock().push(*name);
        }
    }

    fn deactivate(&self, _category: &str) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_default_servant_and_servant_locator() {
    init_logging();

    let (server, adapter) = echo_server("Fallback");
    let named = OperationTable::builder()
        .operation("whoami", |current, _params| async move {
            Ok(Bytes::from(current.identity.name.clone()))
        })
        .build_arc();
    adapter.add_default_servant(named.clone(), "users").unwrap();

    let locator = Arc::new(CategoryLocator {
        servant: named,
        finished: Mutex::new(Vec::new()),
    });
    adapter.add_servant_locator(locator.clone(), "files").unwrap();

    let client = communicator(&[]);
    let endpoint = adapter.get_published_endpoints()[0].to_string();

    let proxy = client.string_to_proxy(&format!("users/alice:{}", endpoint)).unwrap();
    let reply = client
        .invoke(&proxy, "whoami", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"alice");

    let proxy = client.string_to_proxy(&format!("files/readme:{}", endpoint)).unwrap();
    let reply = client
        .invoke(&proxy, "whoami", OperationMode::Normal, Bytes::new())
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"readme");
    assert_eq!(*locator.finished.lock(), vec!["readme".to_string()]);

    let proxy = client.string_to_proxy(&format!("nobody/bob:{}", endpoint)).unwrap();
    let err = client
        .invoke(&proxy, "whoami", OperationMode::Normal, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Local(LocalError::ObjectNotExist { .. })));

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_group_through_locator() {
    init_logging();

    let locator = LocalLocator::new(Identity::new("Locator"), false);
    locator.add_adapter("Replica1");
    locator.add_adapter("Replica2");
    locator.add_replica_group("Echoes");

    let mut servers = Vec::new();
    for id in ["Replica1", "Replica2"] {
        let server = communicator(&[]);
        server.set_default_locator(Some(locator.clone()));
        server
            .properties()
            .set_property(format!("{}.AdapterId", id), id);
        server
            .properties()
            .set_property(format!("{}.ReplicaGroupId", id), "Echoes");
        let adapter = server.create_object_adapter_with_endpoints(id, LOOPBACK).unwrap();
        let proxy = adapter.add(echo_servant(), Identity::new("echo")).unwrap();
        assert_eq!(proxy.adapter_id(), "Echoes");
        adapter.activate().unwrap();
        servers.push(server);
    }

    let client = communicator(&[]);
    client.set_default_locator(Some(locator.clone()));
    let proxy = client.string_to_proxy("echo @ Echoes").unwrap();
    let reply = client
        .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"group"))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"group");

    let group = locator.find_adapter_by_id("Echoes").unwrap().unwrap();
    assert_eq!(group.endpoints().len(), 2);

    client.destroy();
    for server in servers {
        server.destroy();
    }
}
