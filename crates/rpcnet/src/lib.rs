//! Network layer of the object RPC runtime
//!
//! This crate provides the pieces that move requests between processes:
//! endpoints and their string form, message framing, listening and outgoing
//! connections, the batch request queue, the timer and worker thread pools.
//! The object layer (`rpcobj`) builds adapters and servants on top of it.
//!
//! # Features
//!
//! - TCP and UDP transports, plus opaque endpoints for unknown transports
//! - Twoway requests multiplexed by request id, oneway and batched requests
//! - Connection validation, graceful close and idle connection management
//! - Retry classification for local errors
//!
//! # Example
//!
//! ## Listening factory and client connection
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use futures::future::BoxFuture;
//! use rpcnet::{
//!     EndpointFactoryManager, Identity, IncomingConnectionFactory, IncomingSettings,
//!     OutgoingConnection, OutgoingSettings, Request, RequestHandler, RpcError,
//!     TcpIncomingFactory,
//! };
//!
//! struct Echo;
//!
//! impl RequestHandler for Echo {
//!     fn dispatch(&self, request: Request) -> BoxFuture<'static, Result<Bytes, RpcError>> {
//!         Box::pin(async move { Ok(request.params) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let endpoint = EndpointFactoryManager::default()
//!         .create("tcp -h 127.0.0.1 -p 0", true)
//!         .unwrap()
//!         .unwrap();
//!     let factory = TcpIncomingFactory::new(
//!         &endpoint,
//!         tokio::runtime::Handle::current(),
//!         Arc::new(Echo),
//!         IncomingSettings::default(),
//!     )
//!     .unwrap();
//!     factory.activate();
//!
//!     let connection = OutgoingConnection::connect(&factory.endpoint(), &OutgoingSettings::default())
//!         .await
//!         .unwrap();
//!     let request = Request::new(Identity::new("echo"), "echo", Bytes::from("hello"));
//!     let reply = connection.invoke(request, None).await.unwrap();
//!     assert_eq!(reply.as_ref(), b"hello");
//! }
//! ```

pub mod error;
pub mod properties;
pub mod trace;

pub mod identity;
pub mod retry;

// Endpoints and addressing
pub mod endpoint;
pub mod network;

// Wire protocol
pub mod protocol;

// Runtime services
pub mod acm;
pub mod batch;
pub mod thread_pool;
pub mod timer;

// Connections
pub mod incoming;
pub mod outgoing;

// Re-export error types
pub use error::{ErrorKind, LocalError, Result, RpcError, UserError};

pub use acm::{AcmClose, AcmConfig, AcmHeartbeat};
pub use batch::{
    BatchConfig, BatchFlushTarget, BatchRequest, BatchRequestInterceptor, BatchRequestQueue,
    BatchStream,
};
pub use endpoint::{
    Endpoint, EndpointDefaults, EndpointFactoryManager, OpaqueEndpoint, TcpEndpoint, Transport,
    UdpEndpoint,
};
pub use identity::Identity;
pub use incoming::{
    create_incoming_factory, FactoryState, IncomingConnectionFactory, IncomingSettings,
    IncomingStatsSnapshot, RequestHandler, TcpIncomingFactory, UdpIncomingFactory,
};
pub use outgoing::{OutgoingConnection, OutgoingConnectionFactory, OutgoingSettings};
pub use properties::Properties;
pub use protocol::{MessageType, ReplyStatus, Request, HEADER_SIZE};
pub use retry::{OperationMode, RetryContext, RetryPolicy};
pub use thread_pool::{ThreadPool, ThreadPoolConfig};
pub use timer::{Timer, TimerHandle, TimerTask};
pub use trace::TraceLevels;
