//! Shared helpers for the integration scenarios

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpcnet::{Identity, Properties};
use rpcobj::{Communicator, ObjectAdapter, OperationTable, Servant};

static INIT: Once = Once::new();

/// Install the fmt subscriber once per test binary. `RUST_LOG` selects the
/// categories, e.g. `RUST_LOG=rpcnet::network=debug`.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub const LOOPBACK: &str = "tcp -h 127.0.0.1 -p 0";

pub fn communicator(pairs: &[(&str, &str)]) -> Communicator {
    Communicator::new(Properties::from_pairs(pairs.iter().copied())).expect("communicator")
}

/// Servant answering `echo` with its parameters and `slow` after a delay
pub fn echo_servant() -> Arc<dyn Servant> {
    OperationTable::builder()
        .operation("echo", |_current, params| async move { Ok(params) })
        .operation("slow", |_current, params| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(params)
        })
        .build_arc()
}

/// Communicator with an activated adapter `name` serving `echo_servant` as
/// `echo` on a loopback endpoint
pub fn echo_server(name: &str) -> (Communicator, Arc<ObjectAdapter>) {
    let communicator = communicator(&[]);
    let adapter = communicator
        .create_object_adapter_with_endpoints(name, LOOPBACK)
        .expect("adapter");
    adapter
        .add(echo_servant(), Identity::new("echo"))
        .expect("add servant");
    adapter.activate().expect("activate");
    (communicator, adapter)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn payload(len: usize, seed: u8) -> Bytes {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect::<Vec<u8>>().into()
}

/// Counters shared by concurrent clients
#[derive(Debug, Default)]
pub struct ConcurrentStats {
    successes: AtomicU64,
    failures: AtomicU64,
    corruptions: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn data_corruption_count(&self) -> u64 {
        self.corruptions.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let count = self.success_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us.load(Ordering::Relaxed) / count)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count() + self.failure_count();
        if total == 0 {
            return 0.0;
        }
        self.success_count() as f64 / total as f64 * 100.0
    }

    pub fn print_report(&self, name: &str, elapsed: Duration) {
        println!("\n=== {} ===", name);
        println!("  successes:   {}", self.success_count());
        println!("  failures:    {}", self.failure_count());
        println!("  corruptions: {}", self.data_corruption_count());
        println!("  success:     {:.2}%", self.success_rate());
        println!("  avg latency: {:?}", self.avg_latency());
        println!("  max latency: {:?}", self.max_latency());
        println!("  elapsed:     {:?}", elapsed);
    }
}
