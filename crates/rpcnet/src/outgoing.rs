//! Outgoing connections
//!
//! An [`OutgoingConnection`] multiplexes twoway requests over one socket by
//! request id and owns the batch queue of that connection. Replies are read
//! by a background task; writes go through a shared write half.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::batch::{BatchConfig, BatchFlushTarget, BatchRequestInterceptor, BatchRequestQueue};
use crate::endpoint::Endpoint;
use crate::error::{LocalError, Result, RpcError};
use crate::incoming::RequestHandler;
use crate::network;
use crate::properties::Properties;
use crate::protocol::{self, decode_batch, decode_reply, encode_reply, MessageReader, MessageType, Request};
use crate::timer::{Timer, TimerHandle};
use crate::trace::{TraceLevels, NETWORK_CATEGORY};

type ReplySender = oneshot::Sender<std::result::Result<Bytes, RpcError>>;

/// Client-side connection settings
#[derive(Debug, Clone)]
pub struct OutgoingSettings {
    pub message_size_max: usize,
    pub batch: BatchConfig,
    /// Period of the background batch flush, if any
    pub flush_interval: Option<Duration>,
    pub traces: TraceLevels,
}

impl Default for OutgoingSettings {
    fn default() -> Self {
        Self {
            message_size_max: 1024 * 1024,
            batch: BatchConfig::default(),
            flush_interval: None,
            traces: TraceLevels::default(),
        }
    }
}

impl OutgoingSettings {
    pub fn from_properties(props: &Properties) -> Self {
        let interval = props.get_property_as_int("Rpc.BatchFlushInterval");
        Self {
            message_size_max: protocol::message_size_limit(
                props.get_property_as_int_with_default("Rpc.MessageSizeMax", 1024),
            ),
            batch: BatchConfig::from_properties(props),
            flush_interval: (interval > 0).then(|| Duration::from_millis(interval as u64)),
            traces: TraceLevels::from_properties(props),
        }
    }
}

enum Link {
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
    Udp(UdpSocket),
}

struct ConnectionState {
    next_id: i32,
    pending: HashMap<i32, ReplySender>,
    closed: Option<LocalError>,
}

pub struct OutgoingConnection {
    endpoint: Endpoint,
    link: Link,
    runtime: Handle,
    weak_self: Weak<OutgoingConnection>,
    state: Mutex<ConnectionState>,
    drained: Notify,
    batch: BatchRequestQueue,
    /// Held from swap to write so batches hit the wire in swap order
    flushing: tokio::sync::Mutex<()>,
    adapter: Mutex<Option<Arc<dyn RequestHandler>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    message_size_max: usize,
    udp_send_size: usize,
    traces: TraceLevels,
}

/// Try every address the endpoint host resolves to, in order
async fn open_tcp(endpoint: &Endpoint, traces: TraceLevels) -> Result<TcpStream> {
    let addrs = network::connect_addresses(endpoint.host(), endpoint.port()).await?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if traces.network >= 2 {
                    debug!(target: NETWORK_CATEGORY, "failed to connect to {}: {}", addr, e);
                }
                last = Some(LocalError::from(e));
            }
        }
    }
    Err(last.unwrap_or_else(|| LocalError::ConnectFailed(endpoint.to_string())))
}

impl OutgoingConnection {
    /// Connect to `endpoint` and complete the connection validation
    /// handshake. Must be called from within a tokio runtime.
    pub async fn connect(endpoint: &Endpoint, settings: &OutgoingSettings) -> Result<Arc<Self>> {
        Self::connect_with_interceptor(endpoint, settings, None).await
    }

    pub async fn connect_with_interceptor(
        endpoint: &Endpoint,
        settings: &OutgoingSettings,
        interceptor: Option<Arc<dyn BatchRequestInterceptor>>,
    ) -> Result<Arc<Self>> {
        let timeout = (endpoint.timeout() >= 0).then(|| Duration::from_millis(endpoint.timeout() as u64));

        if settings.traces.network >= 2 {
            debug!(target: NETWORK_CATEGORY, "trying to establish {} connection to {}", endpoint.transport().name(), endpoint);
        }

        let (link, reader) = match endpoint {
            Endpoint::Tcp(_) => {
                let stream = match timeout {
                    Some(t) => tokio::time::timeout(t, open_tcp(endpoint, settings.traces))
                        .await
                        .map_err(|_| LocalError::ConnectTimeout)??,
                    None => open_tcp(endpoint, settings.traces).await?,
                };
                stream.set_nodelay(true)?;
                let (read_half, write_half) = stream.into_split();
                let mut reader = MessageReader::new(read_half).with_max_size(settings.message_size_max);

                let first = match timeout {
                    Some(t) => tokio::time::timeout(t, reader.read_message())
                        .await
                        .map_err(|_| LocalError::ConnectTimeout)??,
                    None => reader.read_message().await?,
                };
                match first {
                    Some((header, _)) if header.message_type == MessageType::ValidateConnection => {}
                    Some((header, _)) => {
                        return Err(LocalError::Protocol(format!(
                            "expected validate connection message, got {:?}",
                            header.message_type
                        )));
                    }
                    None => {
                        return Err(LocalError::ConnectionLost(
                            "connection closed before validation".into(),
                        ));
                    }
                }
                (Link::Tcp(tokio::sync::Mutex::new(write_half)), Some(reader))
            }
            Endpoint::Udp(_) => {
                let addr = network::connect_addresses(endpoint.host(), endpoint.port())
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| LocalError::ConnectFailed(endpoint.to_string()))?;
                let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                (Link::Udp(socket), None)
            }
            Endpoint::Opaque(_) => {
                return Err(LocalError::NoEndpoint(format!(
                    "cannot connect to opaque endpoint `{}'",
                    endpoint
                )));
            }
        };

        let runtime = Handle::current();
        let datagram = endpoint.datagram();
        let connection = Arc::new_cyclic(|weak_self| Self {
            endpoint: endpoint.clone(),
            link,
            runtime: runtime.clone(),
            weak_self: weak_self.clone(),
            state: Mutex::new(ConnectionState {
                next_id: 1,
                pending: HashMap::new(),
                closed: None,
            }),
            drained: Notify::new(),
            batch: BatchRequestQueue::new(&settings.batch, datagram, interceptor),
            flushing: tokio::sync::Mutex::new(()),
            adapter: Mutex::new(None),
            reader: Mutex::new(None),
            message_size_max: settings.message_size_max,
            udp_send_size: settings.batch.udp_send_size,
            traces: settings.traces,
        });

        if let Some(reader) = reader {
            let task = runtime.spawn(read_loop(Arc::downgrade(&connection), reader));
            *connection.reader.lock() = Some(task);
        }

        if settings.traces.network >= 1 {
            info!(target: NETWORK_CATEGORY, "established {} connection to {}", endpoint.transport().name(), endpoint);
        }
        Ok(connection)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Number of twoway requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn batch_queue(&self) -> &BatchRequestQueue {
        &self.batch
    }

    /// Adapter that receives requests sent back over this connection
    pub fn set_adapter(&self, adapter: Option<Arc<dyn RequestHandler>>) {
        *self.adapter.lock() = adapter;
    }

    pub fn adapter(&self) -> Option<Arc<dyn RequestHandler>> {
        self.adapter.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        match &self.state.lock().closed {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn send(&self, message: &[u8]) -> Result<()> {
        if message.len() > self.message_size_max {
            return Err(LocalError::MemoryLimit {
                size: message.len(),
                max: self.message_size_max,
            });
        }
        match &self.link {
            Link::Tcp(writer) => {
                let mut writer = writer.lock().await;
                protocol::write_message(&mut *writer, message).await
            }
            Link::Udp(socket) => {
                if message.len() > self.udp_send_size {
                    return Err(LocalError::DatagramLimit {
                        size: message.len(),
                        max: self.udp_send_size,
                    });
                }
                socket.send(message).await?;
                Ok(())
            }
        }
    }

    /// Send a twoway request and wait for its reply
    pub async fn invoke(
        &self,
        mut request: Request,
        timeout: Option<Duration>,
    ) -> std::result::Result<Bytes, RpcError> {
        if self.endpoint.datagram() {
            return Err(LocalError::FeatureNotSupported(
                "twoway invocation over a datagram connection".into(),
            )
            .into());
        }

        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut state = self.state.lock();
            if let Some(err) = &state.closed {
                return Err(err.clone().into());
            }
            let id = state.next_id;
            state.next_id = if id == i32::MAX { 1 } else { id + 1 };
            state.pending.insert(id, tx);
            id
        };
        request.request_id = request_id;

        trace!("sending request {} `{}' to {}", request_id, request.operation, self.endpoint);
        if let Err(e) = self.send(&request.to_message()).await {
            self.remove_pending(request_id);
            if e.is_connection_error() {
                self.fail(e.clone());
            }
            return Err(e.into());
        }

        let reply = async {
            rx.await.unwrap_or_else(|_| {
                Err(LocalError::ConnectionLost("connection dropped the request".into()).into())
            })
        };
        match timeout {
            Some(t) => match tokio::time::timeout(t, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.remove_pending(request_id);
                    Err(LocalError::InvocationTimeout.into())
                }
            },
            None => reply.await,
        }
    }

    pub async fn send_oneway(&self, mut request: Request) -> Result<()> {
        self.check_open()?;
        request.request_id = 0;
        self.send(&request.to_message()).await
    }

    /// Queue a oneway request in this connection's batch
    pub fn batch_request(&self, request: &Request) -> Result<()> {
        let mut stream = self.batch.prepare_request()?;
        let before = stream.len();
        request.encode_body(stream.buffer(), false);
        let size = protocol::BATCH_HEADER_SIZE + stream.len() - before;
        if size > self.message_size_max {
            self.batch.abort_request(stream);
            return Err(LocalError::MemoryLimit {
                size,
                max: self.message_size_max,
            });
        }
        self.batch.finish_request(stream, self, &request.operation)
    }

    /// Send every queued batch request in a single write
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let mut message = BytesMut::new();
        let count = self.batch.swap(&mut message);
        if count == 0 {
            return Ok(());
        }
        self.check_open()?;
        if self.traces.network >= 3 {
            trace!(target: NETWORK_CATEGORY, "flushing {} batch requests to {}", count, self.endpoint);
        }
        self.send(&message).await
    }

    /// Close the connection. A graceful close waits for pending replies and
    /// tells the peer with a CloseConnection message.
    pub async fn close(&self, graceful: bool) {
        if graceful {
            loop {
                let drained = self.drained.notified();
                if self.state.lock().pending.is_empty() {
                    break;
                }
                drained.await;
            }
            if let Err(e) = self.flush_batch_requests().await {
                debug!("cannot flush batch before closing {}: {}", self.endpoint, e);
            }
        }
        self.fail(LocalError::ConnectionManuallyClosed { graceful });
        if let Link::Tcp(writer) = &self.link {
            let mut writer = writer.lock().await;
            if graceful {
                let _ = protocol::write_message(&mut *writer, &protocol::close_connection_message()).await;
            }
            let _ = writer.shutdown().await;
        }
    }

    /// Close without waiting, failing outstanding work with `err`
    pub fn abort(&self, err: LocalError) {
        self.fail(err);
        if let Some(this) = self.weak_self.upgrade() {
            self.runtime.spawn(async move {
                if let Link::Tcp(writer) = &this.link {
                    let _ = writer.lock().await.shutdown().await;
                }
            });
        }
    }

    fn remove_pending(&self, request_id: i32) -> Option<ReplySender> {
        let mut state = self.state.lock();
        let sender = state.pending.remove(&request_id);
        if state.pending.is_empty() {
            self.drained.notify_waiters();
        }
        sender
    }

    fn complete(&self, request_id: i32, outcome: std::result::Result<Bytes, RpcError>) {
        match self.remove_pending(request_id) {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => debug!("discarding reply {} from {}: no pending request", request_id, self.endpoint),
        }
    }

    /// Latch `err`, fail every pending request with it and destroy the batch
    /// queue. Only the first call has an effect.
    fn fail(&self, err: LocalError) {
        let pending = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(err.clone());
            mem::take(&mut state.pending)
        };

        if self.traces.network >= 1 {
            info!(target: NETWORK_CATEGORY, "closing connection to {}: {}", self.endpoint, err);
        }
        for (_, sender) in pending {
            let _ = sender.send(Err(err.clone().into()));
        }
        self.drained.notify_waiters();
        self.batch.destroy(err);
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }

    /// Run a request sent to us by the peer through the callback adapter
    fn dispatch_callback(&self, request: Request) {
        let handler = self.adapter();
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let request_id = request.request_id;
            let outcome = match handler {
                Some(handler) => handler.dispatch(request).await,
                None => Err(LocalError::ObjectNotExist {
                    identity: request.identity.to_string(),
                    facet: request.facet,
                    operation: request.operation,
                }
                .into()),
            };
            if request_id != 0 {
                if let Err(e) = this.send(&encode_reply(request_id, &outcome)).await {
                    debug!("cannot send callback reply to {}: {}", this.endpoint, e);
                }
            }
        });
    }
}

impl BatchFlushTarget for OutgoingConnection {
    fn flush_batch_requests_async(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            if let Err(e) = this.flush_batch_requests().await {
                warn!("batch flush to {} failed: {}", this.endpoint, e);
            }
        });
    }
}

impl Drop for OutgoingConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for OutgoingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingConnection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(weak: Weak<OutgoingConnection>, mut reader: MessageReader<OwnedReadHalf>) {
    let error = loop {
        let message = reader.read_message().await;
        let Some(connection) = weak.upgrade() else {
            return;
        };
        match message {
            Ok(None) => break LocalError::ConnectionLost("connection closed by peer".into()),
            Err(e) => break e,
            Ok(Some((header, body))) => match header.message_type {
                MessageType::Reply => match decode_reply(body) {
                    Ok((request_id, outcome)) => connection.complete(request_id, outcome),
                    Err(e) => break e,
                },
                MessageType::Request => {
                    let mut body = body;
                    match Request::decode_body(&mut body, true) {
                        Ok(request) => connection.dispatch_callback(request),
                        Err(e) => break e,
                    }
                }
                MessageType::BatchRequest => match decode_batch(body) {
                    Ok(requests) => {
                        for request in requests {
                            connection.dispatch_callback(request);
                        }
                    }
                    Err(e) => break e,
                },
                MessageType::ValidateConnection => {
                    trace!("received heartbeat from {}", connection.endpoint);
                }
                MessageType::CloseConnection => break LocalError::CloseConnection,
            },
        }
    };

    if let Some(connection) = weak.upgrade() {
        // Take our own handle first so `fail` does not abort this task
        connection.reader.lock().take();
        connection.fail(error);
    }
}

struct CachedConnection {
    connection: Arc<OutgoingConnection>,
    flush_timer: Option<TimerHandle>,
}

struct FactoryInner {
    connections: HashMap<Endpoint, CachedConnection>,
    /// Callback adapters keyed by the router client endpoints they serve
    router_adapters: Vec<(Vec<Endpoint>, Arc<dyn RequestHandler>)>,
    destroyed: bool,
}

/// Creates and caches outgoing connections by endpoint
pub struct OutgoingConnectionFactory {
    settings: OutgoingSettings,
    timer: Option<Arc<Timer>>,
    state: Mutex<FactoryInner>,
}

impl OutgoingConnectionFactory {
    /// `timer` drives the periodic batch flush when
    /// `settings.flush_interval` is set.
    pub fn new(settings: OutgoingSettings, timer: Option<Arc<Timer>>) -> Self {
        Self {
            settings,
            timer,
            state: Mutex::new(FactoryInner {
                connections: HashMap::new(),
                router_adapters: Vec::new(),
                destroyed: false,
            }),
        }
    }

    pub fn settings(&self) -> &OutgoingSettings {
        &self.settings
    }

    /// Return a live connection to the first reachable endpoint, reusing a
    /// cached one when possible
    pub async fn create(&self, endpoints: &[Endpoint]) -> Result<Arc<OutgoingConnection>> {
        if endpoints.is_empty() {
            return Err(LocalError::NoEndpoint("no endpoints to connect to".into()));
        }

        {
            let state = self.state.lock();
            if state.destroyed {
                return Err(LocalError::CommunicatorDestroyed);
            }
            for endpoint in endpoints {
                if let Some(cached) = state.connections.get(endpoint) {
                    if !cached.connection.is_closed() {
                        return Ok(Arc::clone(&cached.connection));
                    }
                }
            }
        }

        let mut last_error = None;
        for endpoint in endpoints {
            match OutgoingConnection::connect(endpoint, &self.settings).await {
                Ok(connection) => return self.insert(endpoint, connection),
                Err(e) => {
                    if self.settings.traces.network >= 2 {
                        debug!(target: NETWORK_CATEGORY, "connection to {} failed: {}", endpoint, e);
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| LocalError::NoEndpoint("no endpoints to connect to".into())))
    }

    fn insert(&self, endpoint: &Endpoint, connection: Arc<OutgoingConnection>) -> Result<Arc<OutgoingConnection>> {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            connection.abort(LocalError::CommunicatorDestroyed);
            return Err(LocalError::CommunicatorDestroyed);
        }

        let adapter = state
            .router_adapters
            .iter()
            .find(|(endpoints, _)| endpoints.iter().any(|e| e.equivalent(endpoint)))
            .map(|(_, adapter)| Arc::clone(adapter));
        connection.set_adapter(adapter);

        let flush_timer = self.schedule_flush(&connection);
        if let Some(old) = state.connections.insert(
            endpoint.clone(),
            CachedConnection {
                connection: Arc::clone(&connection),
                flush_timer,
            },
        ) {
            self.release(old);
        }
        Ok(connection)
    }

    fn schedule_flush(&self, connection: &Arc<OutgoingConnection>) -> Option<TimerHandle> {
        let (timer, period) = match (&self.timer, self.settings.flush_interval) {
            (Some(timer), Some(period)) => (timer, period),
            _ => return None,
        };
        let weak = Arc::downgrade(connection);
        let task = Arc::new(move || {
            if let Some(connection) = weak.upgrade() {
                if !connection.batch_queue().is_empty() {
                    connection.flush_batch_requests_async();
                }
            }
        });
        match timer.schedule_repeated(task, period) {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!("cannot schedule batch flush for {}: {}", connection.endpoint(), e);
                None
            }
        }
    }

    fn release(&self, cached: CachedConnection) {
        if let (Some(timer), Some(handle)) = (&self.timer, cached.flush_timer) {
            timer.cancel(handle);
        }
        if !cached.connection.is_closed() {
            cached.connection.abort(LocalError::ConnectionManuallyClosed { graceful: false });
        }
    }

    /// Route requests arriving on connections to `endpoints` to `adapter`
    pub fn set_router_info(&self, endpoints: &[Endpoint], adapter: Arc<dyn RequestHandler>) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        for cached in state.connections.values() {
            if endpoints.iter().any(|e| e.equivalent(cached.connection.endpoint())) {
                cached.connection.set_adapter(Some(Arc::clone(&adapter)));
            }
        }
        state.router_adapters.push((endpoints.to_vec(), adapter));
    }

    /// Detach `adapter` from every connection that routes to it
    pub fn remove_adapter(&self, adapter: &Arc<dyn RequestHandler>) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.router_adapters.retain(|(_, a)| !Arc::ptr_eq(a, adapter));
        for cached in state.connections.values() {
            if let Some(current) = cached.connection.adapter() {
                if Arc::ptr_eq(&current, adapter) {
                    cached.connection.set_adapter(None);
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| !c.connection.is_closed())
            .count()
    }

    /// Flush the batch queue of every live connection
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let connections: Vec<_> = self
            .state
            .lock()
            .connections
            .values()
            .map(|c| Arc::clone(&c.connection))
            .collect();
        for connection in connections {
            if !connection.is_closed() {
                connection.flush_batch_requests().await?;
            }
        }
        Ok(())
    }

    /// Close every connection. Later `create` calls fail.
    pub fn destroy(&self) {
        let (connections, timers) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.router_adapters.clear();
            let drained: Vec<_> = state.connections.drain().map(|(_, c)| c).collect();
            let timers: Vec<_> = drained.iter().filter_map(|c| c.flush_timer).collect();
            (drained, timers)
        };

        if let Some(timer) = &self.timer {
            for handle in timers {
                timer.cancel(handle);
            }
        }
        for cached in connections {
            cached.connection.abort(LocalError::CommunicatorDestroyed);
        }
        debug!("outgoing connection factory destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}
