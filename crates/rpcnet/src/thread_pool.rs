//! Worker thread pools
//!
//! Each pool is a dedicated multi-threaded tokio runtime. Incoming connection
//! factories run their accept loops and dispatches on the pool of the adapter
//! that owns them; outgoing connections run on the client pool.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LocalError, Result};
use crate::properties::Properties;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    pub size: usize,
    pub size_max: usize,
    /// Bytes, 0 keeps the runtime default
    pub stack_size: usize,
}

impl ThreadPoolConfig {
    /// Read `<prefix>.Size`, `<prefix>.SizeMax` and `<prefix>.StackSize`
    pub fn from_properties(props: &Properties, prefix: &str, default_size: usize) -> Self {
        let mut size = props.get_property_as_int_with_default(&format!("{}.Size", prefix), default_size as i64);
        if size < 1 {
            warn!("{}.Size < 1; size adjusted to 1", prefix);
            size = 1;
        }
        let mut size_max = props.get_property_as_int_with_default(&format!("{}.SizeMax", prefix), size);
        if size_max < size {
            warn!("{}.SizeMax < {}.Size; SizeMax adjusted to Size ({})", prefix, prefix, size);
            size_max = size;
        }
        let stack_size = props
            .get_property_as_int(&format!("{}.StackSize", prefix))
            .max(0);
        Self {
            size: size as usize,
            size_max: size_max as usize,
            stack_size: stack_size as usize,
        }
    }
}

pub struct ThreadPool {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, config: ThreadPoolConfig) -> Result<Self> {
        let name = name.into();
        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(config.size_max.max(config.size).max(1))
            .thread_name(name.clone())
            .enable_all();
        if config.stack_size > 0 {
            builder.thread_stack_size(config.stack_size);
        }
        let runtime = builder.build().map_err(|e| {
            LocalError::Initialization(format!("cannot create thread pool `{}': {}", name, e))
        })?;
        debug!("created thread pool `{}' with {} threads", name, config.size_max.max(1));

        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run a future to completion from a thread outside any runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn is_destroyed(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Stop every worker thread. Outstanding tasks are dropped.
    pub fn destroy(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            debug!("destroying thread pool `{}'", self.name);
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").field("name", &self.name).finish()
    }
}
