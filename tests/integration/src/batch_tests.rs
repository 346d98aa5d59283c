//! Batched oneway scenarios
//!
//! Requests queued through a batch proxy must reach the servant whole,
//! exactly once, and in submission order within one batch, whether the batch
//! is flushed explicitly, by size or by the periodic flush timer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use rpcnet::{Identity, OperationMode};
use rpcobj::{Communicator, InvocationMode, ObjectAdapter, OperationTable, Proxy};

use common::*;

type Seen = Arc<Mutex<Vec<Bytes>>>;

fn sink_server(name: &str) -> (Communicator, Arc<ObjectAdapter>, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let servant = OperationTable::builder()
        .operation("record", move |_current, params| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().push(params);
                Ok(Bytes::new())
            }
        })
        .build_arc();

    let server = communicator(&[]);
    let adapter = server
        .create_object_adapter_with_endpoints(name, LOOPBACK)
        .unwrap();
    adapter.add(servant, Identity::new("sink")).unwrap();
    adapter.activate().unwrap();
    (server, adapter, seen)
}

fn batch_proxy(client: &Communicator, adapter: &ObjectAdapter) -> Proxy {
    client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("sink")).unwrap().to_string())
        .unwrap()
        .with_mode(InvocationMode::BatchOneway)
}

fn tagged(tag: u32, seq: u32, len: usize) -> Bytes {
    let mut body = Vec::with_capacity(8 + len);
    body.extend_from_slice(&tag.to_le_bytes());
    body.extend_from_slice(&seq.to_le_bytes());
    body.extend((0..len).map(|i| (i as u32 ^ tag ^ seq) as u8));
    body.into()
}

fn untag(body: &Bytes) -> (u32, u32) {
    let tag = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let seq = u32::from_le_bytes(body[4..8].try_into().unwrap());
    assert_eq!(body.slice(8..), tagged(tag, seq, body.len() - 8).slice(8..), "corrupted request");
    (tag, seq)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_flush_preserves_order() {
    init_logging();

    let (server, adapter, seen) = sink_server("Ordered");
    let client = communicator(&[]);
    let proxy = batch_proxy(&client, &adapter);

    for seq in 0..100 {
        client
            .invoke(&proxy, "record", OperationMode::Normal, tagged(0, seq, 16))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().is_empty(), "nothing is sent before a flush");

    client.flush_batch_requests().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || seen.lock().len() == 100).await);
    let order: Vec<u32> = seen.lock().iter().map(|b| untag(b).1).collect();
    assert_eq!(order, (0..100).collect::<Vec<_>>());

    // An empty flush is a no-op
    client.flush_batch_requests().await.unwrap();

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_auto_flush_by_size() {
    init_logging();

    let (server, adapter, seen) = sink_server("AutoFlush");
    let client = communicator(&[("Rpc.BatchAutoFlushSize", "1")]);
    let proxy = batch_proxy(&client, &adapter);

    for seq in 0..20 {
        client
            .invoke(&proxy, "record", OperationMode::Normal, tagged(1, seq, 200))
            .await
            .unwrap();
    }
    // Batches over 1 KB went out without an explicit flush
    assert!(eventually(Duration::from_secs(5), || !seen.lock().is_empty()).await);

    client.flush_batch_requests().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || seen.lock().len() == 20).await);
    // Separate batches may dispatch concurrently on the server
    let mut received: Vec<u32> = seen.lock().iter().map(|b| untag(b).1).collect();
    received.sort_unstable();
    assert_eq!(received, (0..20).collect::<Vec<_>>());

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_periodic_flush() {
    init_logging();

    let (server, adapter, seen) = sink_server("Periodic");
    let client = communicator(&[("Rpc.BatchFlushInterval", "50")]);
    let proxy = batch_proxy(&client, &adapter);

    for seq in 0..10 {
        client
            .invoke(&proxy, "record", OperationMode::Normal, tagged(2, seq, 8))
            .await
            .unwrap();
    }
    assert!(eventually(Duration::from_secs(5), || seen.lock().len() == 10).await);

    client.destroy();
    server.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_callers_never_interleave() {
    init_logging();

    const CALLERS: u32 = 8;
    const PER_CALLER: u32 = 50;

    let (server, adapter, seen) = sink_server("Concurrent");
    let client = Arc::new(communicator(&[("Rpc.BatchAutoFlushSize", "4")]));
    let proxy = batch_proxy(&client, &adapter);

    let callers = (0..CALLERS).map(|tag| {
        let client = client.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            for seq in 0..PER_CALLER {
                client
                    .invoke(&proxy, "record", OperationMode::Normal, tagged(tag, seq, 64 + tag as usize))
                    .await
                    .unwrap();
            }
        })
    });
    for result in join_all(callers).await {
        result.unwrap();
    }
    client.flush_batch_requests().await.unwrap();

    let total = (CALLERS * PER_CALLER) as usize;
    assert!(eventually(Duration::from_secs(10), || seen.lock().len() == total).await);

    // Every request arrives whole and exactly once
    let mut received = vec![Vec::new(); CALLERS as usize];
    for body in seen.lock().iter() {
        let (tag, seq) = untag(body);
        received[tag as usize].push(seq);
    }
    for (tag, mut seqs) in received.into_iter().enumerate() {
        seqs.sort_unstable();
        assert_eq!(seqs, (0..PER_CALLER).collect::<Vec<_>>(), "caller {}", tag);
    }

    client.destroy();
    server.destroy();
}
