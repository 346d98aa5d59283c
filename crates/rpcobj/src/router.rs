//! Router collaborators
//!
//! A router forwards requests for clients that cannot accept incoming
//! connections. An adapter created with a router publishes the router's server
//! endpoints instead of listening itself, and receives its requests as
//! callbacks over the connections the client opened to the router.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use rpcnet::{Endpoint, Identity};

use crate::adapter::ObjectAdapter;

pub trait Router: Send + Sync {
    fn identity(&self) -> Identity;

    /// Endpoints clients use to reach the router
    fn client_endpoints(&self) -> Vec<Endpoint>;

    /// Endpoints servers behind the router are reachable at
    fn server_endpoints(&self) -> Vec<Endpoint>;
}

/// A router as seen by the runtime: its cached server endpoints and the one
/// adapter bound to it
pub struct RouterInfo {
    router: Arc<dyn Router>,
    server_endpoints: Mutex<Option<Vec<Endpoint>>>,
    adapter: Mutex<Option<Weak<ObjectAdapter>>>,
}

impl RouterInfo {
    fn new(router: Arc<dyn Router>) -> Self {
        Self {
            router,
            server_endpoints: Mutex::new(None),
            adapter: Mutex::new(None),
        }
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    pub fn identity(&self) -> Identity {
        self.router.identity()
    }

    pub fn client_endpoints(&self) -> Vec<Endpoint> {
        self.router.client_endpoints()
    }

    /// Server endpoints, sorted and without duplicates. Fetched once.
    pub fn server_endpoints(&self) -> Vec<Endpoint> {
        let mut cached = self.server_endpoints.lock();
        cached
            .get_or_insert_with(|| {
                let mut endpoints = self.router.server_endpoints();
                endpoints.sort();
                endpoints.dedup();
                endpoints
            })
            .clone()
    }

    pub fn adapter(&self) -> Option<Arc<ObjectAdapter>> {
        self.adapter.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter().is_some()
    }

    pub fn set_adapter(&self, adapter: Option<&Arc<ObjectAdapter>>) {
        *self.adapter.lock() = adapter.map(Arc::downgrade);
    }

    pub fn clear_cache(&self) {
        *self.server_endpoints.lock() = None;
    }
}

impl std::fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInfo")
            .field("router", &self.router.identity())
            .finish()
    }
}

/// One [`RouterInfo`] per router identity
#[derive(Default)]
pub struct RouterManager {
    table: Mutex<HashMap<Identity, Arc<RouterInfo>>>,
}

impl RouterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, router: Arc<dyn Router>) -> Arc<RouterInfo> {
        self.table
            .lock()
            .entry(router.identity())
            .or_insert_with(|| Arc::new(RouterInfo::new(router)))
            .clone()
    }

    pub fn erase(&self, identity: &Identity) -> Option<Arc<RouterInfo>> {
        self.table.lock().remove(identity)
    }

    pub fn destroy(&self) {
        self.table.lock().clear();
    }
}
