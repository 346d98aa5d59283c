//! Listening transports
//!
//! An incoming connection factory owns one listening socket. It starts out
//! holding: the socket is bound, so the port is known, but nothing is
//! accepted or read until [`IncomingConnectionFactory::activate`] is called.
//!
//! # Lifecycle
//!
//! - `activate`: accept connections and read requests
//! - `hold`: stop accepting and stop reading; dispatches already running
//!   complete
//! - `destroy`: stop accepting and close every connection once its
//!   dispatches complete
//!
//! `wait_until_holding` and `wait_until_finished` block the calling thread
//! until dispatches drain or every task is gone. All socket work runs on the
//! tokio runtime handed to the factory.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::acm::{AcmConfig, AcmHeartbeat};
use crate::endpoint::Endpoint;
use crate::error::{LocalError, Result, RpcError};
use crate::network;
use crate::protocol::{
    self, decode_batch, encode_reply, Header, MessageReader, MessageType, Request, HEADER_SIZE,
};
use crate::trace::{TraceLevels, NETWORK_CATEGORY};

/// Dispatches requests read by a listening transport
pub trait RequestHandler: Send + Sync {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, std::result::Result<Bytes, RpcError>>;
}

/// A listening endpoint owned by an object adapter
pub trait IncomingConnectionFactory: Send + Sync {
    fn activate(&self);
    fn hold(&self);
    fn destroy(&self);
    /// Block until the factory is not active and no dispatch is running
    fn wait_until_holding(&self);
    /// Block until the factory is destroyed and all its tasks have exited
    fn wait_until_finished(&self);
    /// The bound endpoint, with the real port filled in
    fn endpoint(&self) -> Endpoint;
    fn state(&self) -> FactoryState;
    fn stats(&self) -> IncomingStatsSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryState {
    Holding,
    Active,
    Closed,
}

/// Per-adapter settings applied to accepted connections
#[derive(Debug, Clone)]
pub struct IncomingSettings {
    pub message_size_max: usize,
    pub acm: AcmConfig,
    pub traces: TraceLevels,
}

impl Default for IncomingSettings {
    fn default() -> Self {
        Self {
            message_size_max: 1024 * 1024,
            acm: AcmConfig::new(true),
            traces: TraceLevels::default(),
        }
    }
}

/// Factory statistics
#[derive(Debug, Default)]
pub struct IncomingStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_dispatched: AtomicU64,
    pub requests_failed: AtomicU64,
}

impl IncomingStats {
    pub fn snapshot(&self) -> IncomingStatsSnapshot {
        IncomingStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub requests_received: u64,
    pub requests_dispatched: u64,
    pub requests_failed: u64,
}

#[derive(Default)]
struct Activity {
    dispatching: usize,
    tasks: usize,
}

/// State shared between a factory and its tasks
struct Monitor {
    state: watch::Sender<FactoryState>,
    activity: Mutex<Activity>,
    cond: Condvar,
    stats: IncomingStats,
}

impl Monitor {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(FactoryState::Holding);
        Arc::new(Self {
            state,
            activity: Mutex::new(Activity::default()),
            cond: Condvar::new(),
            stats: IncomingStats::default(),
        })
    }

    fn current(&self) -> FactoryState {
        *self.state.borrow()
    }

    fn set_state(&self, next: FactoryState) -> bool {
        let _activity = self.activity.lock();
        let current = *self.state.borrow();
        if current == FactoryState::Closed || current == next {
            return false;
        }
        self.state.send_replace(next);
        self.cond.notify_all();
        true
    }

    fn wait_until_holding(&self) {
        let mut activity = self.activity.lock();
        while self.current() == FactoryState::Active || activity.dispatching > 0 {
            self.cond.wait(&mut activity);
        }
    }

    fn wait_until_finished(&self) {
        let mut activity = self.activity.lock();
        while self.current() != FactoryState::Closed || activity.tasks > 0 {
            self.cond.wait(&mut activity);
        }
    }

    fn task(self: &Arc<Self>) -> TaskGuard {
        self.activity.lock().tasks += 1;
        TaskGuard {
            monitor: Arc::clone(self),
        }
    }

    fn dispatch(self: &Arc<Self>) -> DispatchGuard {
        self.activity.lock().dispatching += 1;
        DispatchGuard {
            monitor: Arc::clone(self),
        }
    }
}

/// Counts a live task for `wait_until_finished`
struct TaskGuard {
    monitor: Arc<Monitor>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut activity = self.monitor.activity.lock();
        activity.tasks -= 1;
        if activity.tasks == 0 {
            self.monitor.cond.notify_all();
        }
    }
}

/// Counts a running dispatch for `wait_until_holding`
struct DispatchGuard {
    monitor: Arc<Monitor>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let mut activity = self.monitor.activity.lock();
        activity.dispatching -= 1;
        if activity.dispatching == 0 {
            self.monitor.cond.notify_all();
        }
    }
}

/// Wait until the factory is active. Returns false once it is closed.
async fn wait_active(state_rx: &mut watch::Receiver<FactoryState>) -> bool {
    loop {
        match *state_rx.borrow_and_update() {
            FactoryState::Active => return true,
            FactoryState::Closed => return false,
            FactoryState::Holding => {}
        }
        if state_rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Run one request through the handler, counting it as a dispatch
async fn dispatch_one(
    monitor: &Arc<Monitor>,
    handler: &Arc<dyn RequestHandler>,
    request: Request,
) -> std::result::Result<Bytes, RpcError> {
    let _dispatch = monitor.dispatch();
    let operation = request.operation.clone();
    let result = handler.dispatch(request).await;
    monitor.stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = &result {
        monitor.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        debug!("dispatch of `{}' failed: {}", operation, e);
    }
    result
}

/// Create the listening factory for an adapter endpoint
pub fn create_incoming_factory(
    endpoint: &Endpoint,
    runtime: Handle,
    handler: Arc<dyn RequestHandler>,
    settings: IncomingSettings,
) -> Result<Arc<dyn IncomingConnectionFactory>> {
    match endpoint {
        Endpoint::Tcp(_) => Ok(TcpIncomingFactory::new(endpoint, runtime, handler, settings)?),
        Endpoint::Udp(_) => Ok(UdpIncomingFactory::new(endpoint, runtime, handler, settings)?),
        Endpoint::Opaque(_) => Err(LocalError::EndpointParse(format!(
            "cannot listen on opaque endpoint `{}'",
            endpoint
        ))),
    }
}

/// TCP listening factory
pub struct TcpIncomingFactory {
    endpoint: Endpoint,
    monitor: Arc<Monitor>,
}

impl TcpIncomingFactory {
    /// Bind the socket and start the (holding) accept task
    pub fn new(
        endpoint: &Endpoint,
        runtime: Handle,
        handler: Arc<dyn RequestHandler>,
        settings: IncomingSettings,
    ) -> Result<Arc<Self>> {
        let addr = network::bind_address(endpoint.host(), endpoint.port())?;
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let endpoint = endpoint.with_port(local.port());

        if settings.traces.network >= 1 {
            info!(target: NETWORK_CATEGORY, "listening for tcp connections at {}", endpoint);
        }

        let monitor = Monitor::new();
        let guard = monitor.task();
        let task_monitor = Arc::clone(&monitor);
        runtime.spawn(async move {
            let _guard = guard;
            let listener = match TcpListener::from_std(listener) {
                Ok(l) => l,
                Err(e) => {
                    warn!("cannot register listener at {}: {}", local, e);
                    return;
                }
            };
            accept_loop(listener, task_monitor, handler, settings).await;
        });

        Ok(Arc::new(Self { endpoint, monitor }))
    }
}

impl IncomingConnectionFactory for TcpIncomingFactory {
    fn activate(&self) {
        if self.monitor.set_state(FactoryState::Active) {
            debug!(target: NETWORK_CATEGORY, "accepting tcp connections at {}", self.endpoint);
        }
    }

    fn hold(&self) {
        if self.monitor.set_state(FactoryState::Holding) {
            debug!(target: NETWORK_CATEGORY, "holding tcp connections at {}", self.endpoint);
        }
    }

    fn destroy(&self) {
        if self.monitor.set_state(FactoryState::Closed) {
            debug!(target: NETWORK_CATEGORY, "stopping to accept tcp connections at {}", self.endpoint);
        }
    }

    fn wait_until_holding(&self) {
        self.monitor.wait_until_holding();
    }

    fn wait_until_finished(&self) {
        self.monitor.wait_until_finished();
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn state(&self) -> FactoryState {
        self.monitor.current()
    }

    fn stats(&self) -> IncomingStatsSnapshot {
        self.monitor.stats.snapshot()
    }
}

async fn accept_loop(
    listener: TcpListener,
    monitor: Arc<Monitor>,
    handler: Arc<dyn RequestHandler>,
    settings: IncomingSettings,
) {
    let mut state_rx = monitor.state.subscribe();

    loop {
        if !wait_active(&mut state_rx).await {
            break;
        }

        tokio::select! {
            biased;

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("error accepting tcp connection: {}", e);
                        continue;
                    }
                };

                monitor.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                monitor.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                if settings.traces.network >= 2 {
                    debug!(target: NETWORK_CATEGORY, "accepted tcp connection from {}", peer);
                }

                let guard = monitor.task();
                let monitor = Arc::clone(&monitor);
                let handler = Arc::clone(&handler);
                let settings = settings.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = run_connection(stream, peer, &monitor, handler, &settings).await;
                    monitor.stats.connections_active.fetch_sub(1, Ordering::Relaxed);

                    match result {
                        Ok(()) => debug!("connection closed normally from {}", peer),
                        Err(LocalError::ConnectionLost(_)) => {
                            debug!("connection lost from {}", peer);
                        }
                        Err(e) => warn!("connection error from {}: {}", peer, e),
                    }
                });
            }
        }
    }

    debug!("accept loop exiting");
}

enum Event {
    StateChanged,
    DispatchDone,
    Idle,
    Heartbeat,
    Message(Result<Option<(Header, Bytes)>>),
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) -> Result<()> {
    while let Some(message) = rx.recv().await {
        protocol::write_message(&mut writer, &message).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn run_connection(
    stream: TcpStream,
    peer: SocketAddr,
    monitor: &Arc<Monitor>,
    handler: Arc<dyn RequestHandler>,
    settings: &IncomingSettings,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    protocol::write_message(&mut writer, &protocol::validate_connection_message()).await?;

    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut reader = MessageReader::new(reader).with_max_size(settings.message_size_max);
    let mut state_rx = monitor.state.subscribe();
    let mut dispatches: JoinSet<()> = JoinSet::new();
    let idle_timeout = settings.acm.idle_timeout();
    let heartbeat_period = settings.acm.heartbeat_interval();
    let mut heartbeat = tokio::time::interval(heartbeat_period.unwrap_or(Duration::from_secs(3600)));
    heartbeat.reset();
    let mut last_activity = Instant::now();
    let mut peer_closed = false;

    let outcome: Result<()> = loop {
        let state = *state_rx.borrow_and_update();
        if state == FactoryState::Closed {
            break Ok(());
        }
        let active = state == FactoryState::Active;
        let idle_deadline = idle_timeout
            .filter(|_| dispatches.is_empty())
            .map(|t| last_activity + t);

        let event = tokio::select! {
            biased;

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                Event::StateChanged
            }

            Some(_) = dispatches.join_next(), if !dispatches.is_empty() => Event::DispatchDone,

            _ = async {
                match idle_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => Event::Idle,

            _ = heartbeat.tick(), if heartbeat_period.is_some() => Event::Heartbeat,

            message = reader.read_message(), if active => Event::Message(message),
        };

        match event {
            Event::StateChanged => {}
            Event::DispatchDone => last_activity = Instant::now(),
            Event::Idle => {
                if settings.traces.network >= 1 {
                    debug!(target: NETWORK_CATEGORY, "closing idle connection from {}", peer);
                }
                break Ok(());
            }
            Event::Heartbeat => {
                let send = match settings.acm.heartbeat {
                    AcmHeartbeat::Always => true,
                    AcmHeartbeat::OnIdle => dispatches.is_empty(),
                    AcmHeartbeat::OnDispatch => !dispatches.is_empty(),
                    AcmHeartbeat::Off => false,
                };
                if send {
                    let _ = tx.send(protocol::validate_connection_message());
                }
            }
            Event::Message(Err(e)) => break Err(e),
            Event::Message(Ok(None)) => {
                peer_closed = true;
                break Ok(());
            }
            Event::Message(Ok(Some((header, body)))) => {
                last_activity = Instant::now();
                match header.message_type {
                    MessageType::Request => {
                        let mut body = body;
                        let request = match Request::decode_body(&mut body, true) {
                            Ok(r) => r,
                            Err(e) => break Err(e),
                        };
                        monitor.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                        let monitor = Arc::clone(monitor);
                        let handler = Arc::clone(&handler);
                        let tx = tx.clone();
                        dispatches.spawn(async move {
                            let request_id = request.request_id;
                            let result = dispatch_one(&monitor, &handler, request).await;
                            if request_id != 0 {
                                let _ = tx.send(encode_reply(request_id, &result));
                            }
                        });
                    }
                    MessageType::BatchRequest => {
                        let requests = match decode_batch(body) {
                            Ok(r) => r,
                            Err(e) => break Err(e),
                        };
                        monitor
                            .stats
                            .requests_received
                            .fetch_add(requests.len() as u64, Ordering::Relaxed);
                        let monitor = Arc::clone(monitor);
                        let handler = Arc::clone(&handler);
                        dispatches.spawn(async move {
                            for request in requests {
                                let _ = dispatch_one(&monitor, &handler, request).await;
                            }
                        });
                    }
                    MessageType::ValidateConnection => {}
                    MessageType::CloseConnection => {
                        peer_closed = true;
                        break Ok(());
                    }
                    MessageType::Reply => {
                        break Err(LocalError::Protocol(
                            "unexpected reply on an incoming connection".into(),
                        ));
                    }
                }
            }
        }
    };

    // Finish what is running before saying goodbye
    while dispatches.join_next().await.is_some() {}
    if !peer_closed && outcome.is_ok() {
        let _ = tx.send(protocol::close_connection_message());
    }
    drop(tx);
    match writer_task.await {
        Ok(Err(e)) if outcome.is_ok() && !peer_closed => return Err(e),
        _ => {}
    }
    outcome
}

/// UDP listening factory. Datagram requests are always oneway.
pub struct UdpIncomingFactory {
    endpoint: Endpoint,
    monitor: Arc<Monitor>,
}

impl UdpIncomingFactory {
    pub fn new(
        endpoint: &Endpoint,
        runtime: Handle,
        handler: Arc<dyn RequestHandler>,
        settings: IncomingSettings,
    ) -> Result<Arc<Self>> {
        let addr = network::bind_address(endpoint.host(), endpoint.port())?;
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let endpoint = endpoint.with_port(local.port());

        if settings.traces.network >= 1 {
            info!(target: NETWORK_CATEGORY, "starting to receive udp packets at {}", endpoint);
        }

        let monitor = Monitor::new();
        let guard = monitor.task();
        let task_monitor = Arc::clone(&monitor);
        runtime.spawn(async move {
            let _guard = guard;
            let socket = match UdpSocket::from_std(socket) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot register udp socket at {}: {}", local, e);
                    return;
                }
            };
            receive_loop(socket, task_monitor, handler, settings).await;
        });

        Ok(Arc::new(Self { endpoint, monitor }))
    }
}

impl IncomingConnectionFactory for UdpIncomingFactory {
    fn activate(&self) {
        self.monitor.set_state(FactoryState::Active);
    }

    fn hold(&self) {
        self.monitor.set_state(FactoryState::Holding);
    }

    fn destroy(&self) {
        if self.monitor.set_state(FactoryState::Closed) {
            debug!(target: NETWORK_CATEGORY, "stopping to receive udp packets at {}", self.endpoint);
        }
    }

    fn wait_until_holding(&self) {
        self.monitor.wait_until_holding();
    }

    fn wait_until_finished(&self) {
        self.monitor.wait_until_finished();
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn state(&self) -> FactoryState {
        self.monitor.current()
    }

    fn stats(&self) -> IncomingStatsSnapshot {
        self.monitor.stats.snapshot()
    }
}

async fn receive_loop(
    socket: UdpSocket,
    monitor: Arc<Monitor>,
    handler: Arc<dyn RequestHandler>,
    settings: IncomingSettings,
) {
    let mut state_rx = monitor.state.subscribe();
    let mut buf = vec![0u8; 65536];

    loop {
        if !wait_active(&mut state_rx).await {
            break;
        }

        let (len, peer) = tokio::select! {
            biased;

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }

            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("error receiving udp packet: {}", e);
                    continue;
                }
            },
        };

        let requests = match parse_datagram(&buf[..len], settings.message_size_max) {
            Ok(r) => r,
            Err(e) => {
                warn!("discarding malformed datagram from {}: {}", peer, e);
                continue;
            }
        };
        if requests.is_empty() {
            continue;
        }

        monitor
            .stats
            .requests_received
            .fetch_add(requests.len() as u64, Ordering::Relaxed);
        let guard = monitor.task();
        let monitor = Arc::clone(&monitor);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let _guard = guard;
            for request in requests {
                let _ = dispatch_one(&monitor, &handler, request).await;
            }
        });
    }

    debug!("udp receive loop exiting");
}

fn parse_datagram(data: &[u8], message_size_max: usize) -> Result<Vec<Request>> {
    let header = Header::decode(data)?;
    if header.size > message_size_max {
        return Err(LocalError::MemoryLimit {
            size: header.size,
            max: message_size_max,
        });
    }
    if header.size != data.len() {
        return Err(LocalError::Protocol(format!(
            "datagram of {} bytes announces {} bytes",
            data.len(),
            header.size
        )));
    }
    let body = Bytes::copy_from_slice(&data[HEADER_SIZE..]);
    match header.message_type {
        MessageType::Request => {
            let mut body = body;
            let mut request = Request::decode_body(&mut body, true)?;
            if request.request_id != 0 {
                debug!("twoway request `{}' received over udp, no reply will be sent", request.operation);
                request.request_id = 0;
            }
            Ok(vec![request])
        }
        MessageType::BatchRequest => decode_batch(body),
        MessageType::ValidateConnection | MessageType::CloseConnection => Ok(Vec::new()),
        MessageType::Reply => Err(LocalError::Protocol("unexpected reply datagram".into())),
    }
}
