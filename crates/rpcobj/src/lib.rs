//! Object layer of the RPC runtime
//!
//! Builds on `rpcnet` to provide object adapters: named dispatch endpoints
//! that own listening transports and a registry of servants keyed by identity
//! and facet.
//!
//! # Features
//!
//! - Adapter lifecycle with activation, hold, deactivation and destruction
//! - Servant registry with facets, default servants and servant locators
//! - Direct and indirect proxies, locator registration and routers
//! - Collocated dispatch for objects served in the same process
//! - Orderly shutdown of every adapter through the communicator
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use rpcnet::{Identity, OperationMode, Properties};
//! use rpcobj::{Communicator, OperationTable};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Communicator::new(Properties::new())?;
//!     let adapter = server.create_object_adapter_with_endpoints("Hello", "tcp -h 127.0.0.1 -p 0")?;
//!     let servant = OperationTable::builder()
//!         .operation("sayHello", |_current, params| async move { Ok(params) })
//!         .build_arc();
//!     let proxy = adapter.add(servant, Identity::new("hello"))?;
//!     adapter.activate()?;
//!
//!     let client = Communicator::new(Properties::new())?;
//!     let proxy = client.string_to_proxy(&proxy.to_string())?;
//!     let reply = client
//!         .invoke(&proxy, "sayHello", OperationMode::Normal, Bytes::from("hi"))
//!         .await?;
//!     assert_eq!(reply.as_ref(), b"hi");
//!
//!     client.destroy();
//!     server.destroy();
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod factory;
pub mod instance;

// Objects and references
pub mod reference;
pub mod servant;

// Collaborators
pub mod locator;
pub mod router;

pub use adapter::{AdapterState, DirectCountGuard, ObjectAdapter};
pub use factory::ObjectAdapterFactory;
pub use instance::{Communicator, Instance};
pub use locator::{LocalLocator, Locator, LocatorInfo, LocatorManager, LocatorRegistry, LocatorRegistryError};
pub use reference::{InvocationMode, Proxy, ProxyOptions, Target};
pub use router::{Router, RouterInfo, RouterManager};
pub use servant::{
    Cookie, Current, FacetMap, OperationHandler, OperationTable, OperationTableBuilder, Servant,
    ServantLocator, ServantManager,
};
