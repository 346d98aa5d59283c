//! Batched oneway requests
//!
//! A [`BatchRequestQueue`] accumulates the encoded bodies of oneway requests
//! behind a single batch header so they can be sent in one write. One caller
//! at a time owns the stream while encoding a request. A flush may detach the
//! complete requests while that caller finishes, but only once the caller has
//! signalled that its request is fully written.

use std::mem;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{LocalError, Result};
use crate::properties::Properties;
use crate::protocol::{self, BATCH_HEADER_SIZE};

/// IP + UDP header overhead subtracted from the datagram send size
const UDP_OVERHEAD: usize = 20 + 8;

/// Something that can flush a batch without blocking the caller
pub trait BatchFlushTarget: Send + Sync {
    /// Start flushing the batch queue. Failures are reported by the target
    /// itself and never reach the caller that triggered the flush.
    fn flush_batch_requests_async(&self);
}

/// Request handed to a [`BatchRequestInterceptor`]
pub struct BatchRequest<'a> {
    queue: &'a BatchRequestQueue,
    target: &'a dyn BatchFlushTarget,
    operation: &'a str,
    size: usize,
}

impl<'a> BatchRequest<'a> {
    /// Accept the request into the batch
    pub fn enqueue(&self) {
        self.queue.enqueue_batch_request();
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Encoded size of this request in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn target(&self) -> &dyn BatchFlushTarget {
        self.target
    }
}

/// Decides whether and when finished requests join the batch
pub trait BatchRequestInterceptor: Send + Sync {
    /// `count` and `queue_size` describe the batch before this request.
    /// Call `request.enqueue()` to accept it; otherwise it is discarded.
    fn enqueue(&self, request: &BatchRequest<'_>, count: usize, queue_size: usize);
}

/// Auto-flush limits, from `Rpc.BatchAutoFlushSize` and `Rpc.UDP.SndSize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Bytes, 0 disables size-triggered flushing
    pub auto_flush_size: usize,
    pub udp_send_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            auto_flush_size: 1024 * 1024,
            udp_send_size: 65535 - UDP_OVERHEAD,
        }
    }
}

impl BatchConfig {
    pub fn from_properties(props: &Properties) -> Self {
        let kb = props.get_property_as_int_with_default("Rpc.BatchAutoFlushSize", 1024);
        let auto_flush_size = if kb < 1 {
            0
        } else {
            (kb as u64)
                .saturating_mul(1024)
                .min(i32::MAX as u64) as usize
        };
        let udp = props
            .get_property_as_int_with_default("Rpc.UDP.SndSize", (65535 - UDP_OVERHEAD) as i64);
        Self {
            auto_flush_size,
            udp_send_size: udp.max(0) as usize,
        }
    }

    /// Effective flush threshold for a connection
    pub fn max_size(&self, datagram: bool) -> usize {
        if self.auto_flush_size > 0 && datagram && self.udp_send_size < self.auto_flush_size {
            self.udp_send_size
        } else {
            self.auto_flush_size
        }
    }
}

/// Buffer lent to the caller between `prepare_request` and
/// `finish_request`/`abort_request`. Dropping it unfinished aborts the
/// request.
#[must_use = "a batch stream must be finished or aborted"]
pub struct BatchStream<'a> {
    buf: BytesMut,
    queue: Option<&'a BatchRequestQueue>,
}

impl BatchStream<'_> {
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn into_buffer(mut self) -> BytesMut {
        self.queue = None;
        mem::take(&mut self.buf)
    }
}

impl Drop for BatchStream<'_> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.restore(mem::take(&mut self.buf));
        }
    }
}

impl std::fmt::Debug for BatchStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream").field("len", &self.buf.len()).finish()
    }
}

struct QueueState {
    stream: BytesMut,
    in_use: bool,
    can_flush: bool,
    request_num: usize,
    marker: usize,
    error: Option<LocalError>,
}

pub struct BatchRequestQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    max_size: usize,
    interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
}

/// Releases the stream when `finish_request` exits, including by unwinding
struct ReleaseGuard<'a> {
    queue: &'a BatchRequestQueue,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        let marker = state.marker;
        state.stream.truncate(marker);
        state.in_use = false;
        state.can_flush = false;
        self.queue.cond.notify_all();
    }
}

impl BatchRequestQueue {
    pub fn new(
        config: &BatchConfig,
        datagram: bool,
        interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    ) -> Self {
        let mut stream = BytesMut::with_capacity(1024);
        protocol::write_batch_header(&mut stream);
        Self {
            state: Mutex::new(QueueState {
                stream,
                in_use: false,
                can_flush: false,
                request_num: 0,
                marker: BATCH_HEADER_SIZE,
                error: None,
            }),
            cond: Condvar::new(),
            max_size: config.max_size(datagram),
            interceptor,
        }
    }

    /// Size that triggers an automatic flush, 0 if disabled
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Take exclusive use of the batch stream.
    ///
    /// Blocks while another caller holds it. Fails with the latched error once
    /// the queue is destroyed.
    pub fn prepare_request(&self) -> Result<BatchStream<'_>> {
        let mut state = self.state.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        while state.in_use {
            self.cond.wait(&mut state);
        }
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        state.in_use = true;
        Ok(BatchStream {
            buf: mem::take(&mut state.stream),
            queue: Some(self),
        })
    }

    /// Commit the request written into `stream` since `prepare_request`.
    ///
    /// Triggers an asynchronous flush on `target` once the batch reaches the
    /// configured size. Without an interceptor the request is always
    /// accepted; with one, the interceptor decides.
    pub fn finish_request(
        &self,
        stream: BatchStream<'_>,
        target: &dyn BatchFlushTarget,
        operation: &str,
    ) -> Result<()> {
        let buf = stream.into_buffer();
        let _release = ReleaseGuard { queue: self };

        let flush = {
            let mut state = self.state.lock();
            debug_assert!(state.in_use);
            state.stream = buf;
            state.can_flush = true;
            if state.stream.len() <= state.marker {
                return Err(LocalError::Marshal(format!(
                    "batch request `{}' has no encoded body",
                    operation
                )));
            }
            self.max_size > 0 && state.stream.len() >= self.max_size
        };

        if flush {
            trace!(
                "batch for `{}' reached {} bytes, flushing",
                operation,
                self.max_size
            );
            target.flush_batch_requests_async();
        }

        match &self.interceptor {
            Some(interceptor) => {
                // A flush started above may already have detached the batch
                let (request_size, count, marker) = {
                    let state = self.state.lock();
                    (
                        state.stream.len() - state.marker,
                        state.request_num,
                        state.marker,
                    )
                };
                let request = BatchRequest {
                    queue: self,
                    target,
                    operation,
                    size: request_size,
                };
                interceptor.enqueue(&request, count, marker);
            }
            None => self.enqueue_batch_request(),
        }
        Ok(())
    }

    /// Give the stream back without committing the pending request
    pub fn abort_request(&self, stream: BatchStream<'_>) {
        self.restore(stream.into_buffer());
    }

    fn restore(&self, buf: BytesMut) {
        let mut state = self.state.lock();
        if !state.in_use {
            return;
        }
        state.stream = buf;
        let marker = state.marker;
        state.stream.truncate(marker);
        state.in_use = false;
        state.can_flush = false;
        self.cond.notify_all();
    }

    /// Detach the complete requests into `out` as a ready-to-send batch
    /// message and return how many it holds.
    ///
    /// Returns 0 without waiting when nothing is queued. A request still being
    /// encoded is carried over into the fresh batch.
    pub fn swap(&self, out: &mut BytesMut) -> usize {
        let mut state = self.state.lock();
        if state.request_num == 0 {
            return 0;
        }

        while state.in_use && !state.can_flush {
            self.cond.wait(&mut state);
        }
        if state.request_num == 0 {
            return 0;
        }

        let marker = state.marker;
        let partial = if state.stream.len() > marker {
            Some(state.stream.split_off(marker))
        } else {
            None
        };

        let count = state.request_num;
        let mut fresh = BytesMut::with_capacity(1024);
        protocol::write_batch_header(&mut fresh);
        let mut batch = mem::replace(&mut state.stream, fresh);
        protocol::finish_batch(&mut batch, count);
        *out = batch;

        state.request_num = 0;
        state.marker = BATCH_HEADER_SIZE;
        if let Some(partial) = partial {
            state.stream.put_slice(&partial);
        }
        count
    }

    /// True when the stream holds only the batch header. While a caller has
    /// the stream lent out, only complete requests are visible here.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        if state.in_use && !state.can_flush {
            state.marker == BATCH_HEADER_SIZE
        } else {
            state.stream.len() == BATCH_HEADER_SIZE
        }
    }

    /// Number of complete requests queued
    pub fn request_count(&self) -> usize {
        self.state.lock().request_num
    }

    /// Latch a permanent failure. Every later `prepare_request` fails with it.
    pub fn destroy(&self, err: LocalError) {
        let mut state = self.state.lock();
        state.error = Some(err);
        self.cond.notify_all();
    }

    fn enqueue_batch_request(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.marker < state.stream.len());
        state.marker = state.stream.len();
        state.request_num += 1;
    }
}
