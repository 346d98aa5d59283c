//! Stress tests
//!
//! Many concurrent callers against one adapter:
//! - Independent client communicators, each with its own connection
//! - Many tasks sharing one multiplexed connection
//! - Client churn while the server keeps running
//! - Data integrity under load

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use rpcnet::{Identity, OperationMode};
use tokio::sync::Barrier;

use common::*;

/// Many client communicators calling at once
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_many_clients() {
    init_logging();

    const NUM_CLIENTS: usize = 20;
    const REQUESTS_PER_CLIENT: usize = 50;

    let (server, adapter) = echo_server("Stress");
    let proxy_string = adapter
        .create_direct_proxy(Identity::new("echo"))
        .unwrap()
        .to_string();

    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CLIENTS));
    let start = Instant::now();

    let clients = (0..NUM_CLIENTS).map(|client_id| {
        let stats = stats.clone();
        let barrier = barrier.clone();
        let proxy_string = proxy_string.clone();
        tokio::spawn(async move {
            let client = communicator(&[]);
            let proxy = client.string_to_proxy(&proxy_string).unwrap();
            barrier.wait().await;

            for i in 0..REQUESTS_PER_CLIENT {
                let params = payload(32 + i, client_id as u8);
                let started = Instant::now();
                match client
                    .invoke(&proxy, "echo", OperationMode::Idempotent, params.clone())
                    .await
                {
                    Ok(reply) if reply == params => stats.record_success(started.elapsed()),
                    Ok(_) => stats.record_data_corruption(),
                    Err(e) => {
                        eprintln!("client {} request {} failed: {}", client_id, i, e);
                        stats.record_failure();
                    }
                }
            }
            tokio::task::spawn_blocking(move || client.destroy())
                .await
                .unwrap();
        })
    });
    for result in join_all(clients).await {
        result.unwrap();
    }

    stats.print_report("Many clients", start.elapsed());
    assert_eq!(stats.success_count(), (NUM_CLIENTS * REQUESTS_PER_CLIENT) as u64);
    assert_eq!(stats.failure_count(), 0);
    assert_eq!(stats.data_corruption_count(), 0);

    server.destroy();
}

/// Many tasks sharing one client and therefore one connection
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_shared_connection() {
    init_logging();

    const NUM_TASKS: usize = 32;
    const REQUESTS_PER_TASK: usize = 40;

    let (server, adapter) = echo_server("Shared");
    let client = Arc::new(communicator(&[]));
    let proxy = client
        .string_to_proxy(&adapter.create_direct_proxy(Identity::new("echo")).unwrap().to_string())
        .unwrap();

    let stats = Arc::new(ConcurrentStats::new());
    let start = Instant::now();
    let tasks = (0..NUM_TASKS).map(|task_id| {
        let client = client.clone();
        let proxy = proxy.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            for i in 0..REQUESTS_PER_TASK {
                let mut body = format!("{}:{}:", task_id, i).into_bytes();
                body.extend(std::iter::repeat(b'x').take(i * 10));
                let params = Bytes::from(body);
                let started = Instant::now();
                match client
                    .invoke(&proxy, "echo", OperationMode::Normal, params.clone())
                    .await
                {
                    Ok(reply) if reply == params => stats.record_success(started.elapsed()),
                    Ok(_) => stats.record_data_corruption(),
                    Err(_) => stats.record_failure(),
                }
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    stats.print_report("Shared connection", start.elapsed());
    assert_eq!(stats.success_count(), (NUM_TASKS * REQUESTS_PER_TASK) as u64);
    assert_eq!(stats.data_corruption_count(), 0);
    assert_eq!(client.instance().outgoing_connection_factory().connection_count(), 1);

    client.destroy();
    server.destroy();
}

/// Clients come and go while the server keeps serving
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_churn() {
    init_logging();

    const ROUNDS: usize = 20;

    let (server, adapter) = echo_server("Churn");
    let proxy_string = adapter
        .create_direct_proxy(Identity::new("echo"))
        .unwrap()
        .to_string();

    let stats = ConcurrentStats::new();
    let start = Instant::now();
    for round in 0..ROUNDS {
        let client = communicator(&[]);
        let proxy = client.string_to_proxy(&proxy_string).unwrap();
        let params = payload(64, round as u8);
        let started = Instant::now();
        match client
            .invoke(&proxy, "echo", OperationMode::Normal, params.clone())
            .await
        {
            Ok(reply) if reply == params => stats.record_success(started.elapsed()),
            Ok(_) => stats.record_data_corruption(),
            Err(_) => stats.record_failure(),
        }
        tokio::task::spawn_blocking(move || client.destroy())
            .await
            .unwrap();
    }

    stats.print_report("Client churn", start.elapsed());
    assert_eq!(stats.success_count(), ROUNDS as u64);

    // Closed client connections are drained from the listener
    let deactivating = adapter.clone();
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || {
            deactivating.deactivate();
            deactivating.wait_for_deactivate();
        }),
    )
    .await
    .unwrap()
    .unwrap();

    server.destroy();
}
