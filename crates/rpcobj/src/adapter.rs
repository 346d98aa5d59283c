//! Object adapters
//!
//! An adapter owns the listening factories for its endpoints and the servant
//! registry that requests arriving on them are dispatched to. Its lifecycle:
//!
//! ```text
//! Uninitialized -> Activating -> Active <-> Held
//!                     |
//!                     v
//! Deactivating -> Deactivated -> Destroying -> Destroyed
//! ```
//!
//! Every state change happens under the adapter mutex and is broadcast on its
//! condition variable. Locator updates and socket teardown run outside the
//! mutex so `is_local` and `get_thread_pool` never wait on them.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use rpcnet::endpoint::split_endpoint_list;
use rpcnet::protocol::message_size_limit;
use rpcnet::trace::{LOCATION_CATEGORY, NETWORK_CATEGORY};
use rpcnet::{
    create_incoming_factory, AcmConfig, Endpoint, EndpointFactoryManager, Identity,
    IncomingConnectionFactory, IncomingSettings, LocalError, Request, RequestHandler, Result,
    RpcError, ThreadPool, ThreadPoolConfig,
};

use crate::factory::ObjectAdapterFactory;
use crate::instance::Instance;
use crate::locator::{Locator, LocatorInfo, LocatorRegistryError};
use crate::reference::{Proxy, ProxyOptions};
use crate::router::{Router, RouterInfo};
use crate::servant::{Current, FacetMap, Servant, ServantLocator, ServantManager};

pub const ADAPTER_CATEGORY: &str = "rpcobj::adapter";

/// Property suffixes an adapter recognises under `<name>.`
const PROPERTY_SUFFIXES: &[&str] = &[
    "ACM",
    "ACM.Timeout",
    "ACM.Heartbeat",
    "ACM.Close",
    "AdapterId",
    "Endpoints",
    "Locator",
    "Locator.EncodingVersion",
    "Locator.EndpointSelection",
    "Locator.ConnectionCached",
    "Locator.PreferSecure",
    "Locator.CollocationOptimized",
    "Locator.Router",
    "MessageSizeMax",
    "PublishedEndpoints",
    "ReplicaGroupId",
    "Router",
    "Router.EncodingVersion",
    "Router.EndpointSelection",
    "Router.ConnectionCached",
    "Router.PreferSecure",
    "Router.CollocationOptimized",
    "Router.Locator",
    "Router.Locator.EndpointSelection",
    "Router.Locator.ConnectionCached",
    "Router.Locator.PreferSecure",
    "Router.Locator.CollocationOptimized",
    "Router.Locator.LocatorCacheTimeout",
    "Router.Locator.InvocationTimeout",
    "Router.LocatorCacheTimeout",
    "Router.InvocationTimeout",
    "ProxyOptions",
    "ThreadPool.Size",
    "ThreadPool.SizeMax",
    "ThreadPool.SizeWarn",
    "ThreadPool.StackSize",
    "ThreadPool.Serialize",
];

/// Property prefixes owned by the runtime itself
const RESERVED_PREFIXES: &[&str] = &["Rpc."];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdapterState {
    Uninitialized,
    Held,
    Activating,
    Active,
    Deactivating,
    Deactivated,
    Destroying,
    Destroyed,
}

struct Inner {
    state: AdapterState,
    /// The first activation (locator registration) completed
    registered: bool,
    incoming: Vec<Arc<dyn IncomingConnectionFactory>>,
    published: Vec<Endpoint>,
    router_endpoints: Vec<Endpoint>,
    router_info: Option<Arc<RouterInfo>>,
    locator_info: Option<Arc<LocatorInfo>>,
    direct_count: usize,
}

/// Settings read once at construction
struct AdapterConfig {
    id: String,
    replica_group_id: String,
    proxy_options: ProxyOptions,
    acm: AcmConfig,
    message_size_max: usize,
    thread_pool: Option<Arc<ThreadPool>>,
}

pub struct ObjectAdapter {
    name: String,
    /// Created without a name; reports an empty name and reads no properties
    no_config: bool,
    instance: Arc<Instance>,
    factory: Weak<ObjectAdapterFactory>,
    servants: ServantManager,
    id: String,
    replica_group_id: String,
    proxy_options: ProxyOptions,
    acm: AcmConfig,
    message_size_max: usize,
    thread_pool: Option<Arc<ThreadPool>>,
    handler: Arc<dyn RequestHandler>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

/// Routes requests from the listening factories into the adapter
struct AdapterDispatcher {
    adapter: Weak<ObjectAdapter>,
}

impl RequestHandler for AdapterDispatcher {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, std::result::Result<Bytes, RpcError>> {
        match self.adapter.upgrade() {
            Some(adapter) => adapter.dispatch_request(request).boxed(),
            None => {
                let current = Current::new("", &request);
                futures::future::ready(Err(current.object_not_exist())).boxed()
            }
        }
    }
}

/// Keeps the adapter's direct count raised while a collocated call runs
pub struct DirectCountGuard {
    adapter: Arc<ObjectAdapter>,
}

impl Drop for DirectCountGuard {
    fn drop(&mut self) {
        self.adapter.dec_direct_count();
    }
}

impl ObjectAdapter {
    pub(crate) fn create(
        instance: Arc<Instance>,
        factory: Weak<ObjectAdapterFactory>,
        name: String,
        no_config: bool,
        router: Option<Arc<dyn Router>>,
    ) -> Result<Arc<Self>> {
        let config = read_config(&instance, &name, no_config, router.is_some())?;

        let adapter = Arc::new_cyclic(|weak: &Weak<ObjectAdapter>| {
            let handler: Arc<dyn RequestHandler> = Arc::new(AdapterDispatcher {
                adapter: weak.clone(),
            });
            Self {
                servants: ServantManager::new(name.clone()),
                name,
                no_config,
                instance,
                factory,
                id: config.id,
                replica_group_id: config.replica_group_id,
                proxy_options: config.proxy_options,
                acm: config.acm,
                message_size_max: config.message_size_max,
                thread_pool: config.thread_pool,
                handler,
                inner: Mutex::new(Inner {
                    state: AdapterState::Uninitialized,
                    registered: false,
                    incoming: Vec::new(),
                    published: Vec::new(),
                    router_endpoints: Vec::new(),
                    router_info: None,
                    locator_info: None,
                    direct_count: 0,
                }),
                cond: Condvar::new(),
            }
        });

        if let Err(err) = adapter.initialize(router) {
            adapter.destroy();
            return Err(err);
        }
        Ok(adapter)
    }

    fn initialize(self: &Arc<Self>, router: Option<Arc<dyn Router>>) -> Result<()> {
        if self.no_config {
            return Ok(());
        }
        let props = self.instance.properties();

        let router = match router {
            Some(router) => Some(router),
            None => {
                let configured = props.get_property(&format!("{}.Router", self.name));
                if configured.is_empty() {
                    None
                } else {
                    Some(self.instance.find_router(&configured)?)
                }
            }
        };

        if let Some(router) = router {
            let info = self.instance.router_manager().get(router);
            if info.has_adapter() {
                return Err(LocalError::AlreadyRegistered {
                    kind: "object adapter with router".into(),
                    id: info.identity().to_string(),
                });
            }
            let router_endpoints = info.server_endpoints();
            info.set_adapter(Some(self));
            self.instance
                .outgoing_connection_factory()
                .set_router_info(&info.client_endpoints(), self.handler.clone());

            let mut inner = self.inner.lock();
            inner.router_endpoints = router_endpoints;
            inner.router_info = Some(info);
        } else {
            let endpoints = self.parse_endpoints(&props.get_property(&format!("{}.Endpoints", self.name)), true)?;
            let settings = IncomingSettings {
                message_size_max: self.message_size_max,
                acm: self.acm,
                traces: self.instance.traces(),
            };
            let pool = self.get_thread_pool();
            for endpoint in &endpoints {
                let factory =
                    create_incoming_factory(endpoint, pool.handle().clone(), self.handler.clone(), settings.clone())?;
                self.inner.lock().incoming.push(factory);
            }
            if endpoints.is_empty() && self.instance.traces().network >= 2 {
                debug!(target: NETWORK_CATEGORY, "created adapter `{}' without endpoints", self.name);
            }

            let incoming = self.inner.lock().incoming.clone();
            let published = self.compute_published_endpoints(&incoming)?;
            self.inner.lock().published = published;
        }

        let configured = props.get_property(&format!("{}.Locator", self.name));
        let locator = if configured.is_empty() {
            self.instance.default_locator()
        } else {
            Some(self.instance.find_locator(&configured)?)
        };
        if let Some(locator) = locator {
            self.inner.lock().locator_info = Some(self.instance.locator_manager().get(locator));
        }
        Ok(())
    }

    /// Name given at creation, empty for anonymous adapters
    pub fn get_name(&self) -> &str {
        if self.no_config {
            ""
        } else {
            &self.name
        }
    }

    /// Registry name; generated for anonymous adapters
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn adapter_id(&self) -> &str {
        &self.id
    }

    pub fn replica_group_id(&self) -> &str {
        &self.replica_group_id
    }

    pub fn state(&self) -> AdapterState {
        self.inner.lock().state
    }

    /// Start accepting requests. The first call registers the adapter with
    /// its locator before any listener is activated; if that fails the
    /// adapter goes back to `Uninitialized` and activation may be retried.
    pub fn activate(&self) -> Result<()> {
        let locator_info = {
            let mut inner = self.inner.lock();
            while inner.state == AdapterState::Activating {
                self.cond.wait(&mut inner);
            }
            self.check_for_deactivation(&inner)?;

            if inner.registered {
                for factory in &inner.incoming {
                    factory.activate();
                }
                inner.state = AdapterState::Active;
                self.cond.notify_all();
                return Ok(());
            }

            inner.state = AdapterState::Activating;
            inner.locator_info.clone()
        };

        let registration = self
            .new_direct_proxy_checked(Identity::new("dummy"), "")
            .and_then(|proxy| self.update_locator_registry(locator_info.as_ref(), Some(&proxy)));
        if let Err(err) = registration {
            let mut inner = self.inner.lock();
            inner.state = AdapterState::Uninitialized;
            self.cond.notify_all();
            return Err(err);
        }

        if !self.no_config && self.instance.properties().get_property_as_int("Rpc.PrintAdapterReady") > 0 {
            println!("{} ready", self.name);
        }

        let mut inner = self.inner.lock();
        for factory in &inner.incoming {
            factory.activate();
        }
        inner.state = AdapterState::Active;
        inner.registered = true;
        self.cond.notify_all();
        info!(target: ADAPTER_CATEGORY, "object adapter `{}' activated", self.get_name());
        Ok(())
    }

    /// Stop reading new requests without closing the listeners
    pub fn hold(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while inner.state == AdapterState::Activating {
            self.cond.wait(&mut inner);
        }
        self.check_for_deactivation(&inner)?;
        inner.state = AdapterState::Held;
        for factory in &inner.incoming {
            factory.hold();
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Wait until every listener is holding and in-flight dispatches are done
    pub fn wait_for_hold(&self) -> Result<()> {
        let incoming = {
            let inner = self.inner.lock();
            self.check_for_deactivation(&inner)?;
            inner.incoming.clone()
        };
        for factory in incoming {
            factory.wait_until_holding();
        }
        Ok(())
    }

    pub fn deactivate(&self) {
        let (router_info, locator_info, incoming) = {
            let mut inner = self.inner.lock();
            // Never overlap with an activation or another deactivation
            while matches!(inner.state, AdapterState::Activating | AdapterState::Deactivating) {
                self.cond.wait(&mut inner);
            }
            if inner.state > AdapterState::Deactivating {
                return;
            }
            inner.state = AdapterState::Deactivating;
            (
                inner.router_info.clone(),
                inner.locator_info.clone(),
                inner.incoming.clone(),
            )
        };

        if let Some(info) = router_info {
            self.instance.router_manager().erase(&info.identity());
            info.set_adapter(None);
        }

        if let Err(err) = self.update_locator_registry(locator_info.as_ref(), None) {
            debug!(
                target: ADAPTER_CATEGORY,
                "ignoring locator failure while deactivating object adapter `{}': {}",
                self.get_name(),
                err
            );
        }

        for factory in &incoming {
            factory.destroy();
        }

        self.instance
            .outgoing_connection_factory()
            .remove_adapter(&self.handler);

        let mut inner = self.inner.lock();
        inner.state = AdapterState::Deactivated;
        self.cond.notify_all();
        info!(target: ADAPTER_CATEGORY, "object adapter `{}' deactivated", self.get_name());
    }

    /// Block until deactivation completed, collocated calls returned and
    /// every listener finished its connections
    pub fn wait_for_deactivate(&self) {
        let incoming = {
            let mut inner = self.inner.lock();
            while inner.state < AdapterState::Deactivated || inner.direct_count > 0 {
                self.cond.wait(&mut inner);
            }
            if inner.state > AdapterState::Deactivated {
                return;
            }
            inner.incoming.clone()
        };
        for factory in incoming {
            factory.wait_until_finished();
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.inner.lock().state >= AdapterState::Deactivated
    }

    /// Deactivate, wait, then release everything the adapter owns. Safe to
    /// call concurrently; exactly one caller does the work.
    pub fn destroy(&self) {
        self.deactivate();
        self.wait_for_deactivate();

        {
            let mut inner = self.inner.lock();
            while inner.state == AdapterState::Destroying {
                self.cond.wait(&mut inner);
            }
            if inner.state == AdapterState::Destroyed {
                return;
            }
            inner.state = AdapterState::Destroying;
        }

        self.servants.destroy();
        if let Some(pool) = &self.thread_pool {
            pool.destroy();
        }
        if let Some(factory) = self.factory.upgrade() {
            factory.remove_object_adapter(self);
        }

        let mut inner = self.inner.lock();
        inner.incoming.clear();
        inner.published.clear();
        inner.router_endpoints.clear();
        inner.router_info = None;
        inner.locator_info = None;
        inner.state = AdapterState::Destroyed;
        self.cond.notify_all();
        debug!(target: ADAPTER_CATEGORY, "object adapter `{}' destroyed", self.get_name());
    }

    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<Proxy> {
        self.add_facet(servant, identity, "")
    }

    pub fn add_facet(&self, servant: Arc<dyn Servant>, identity: Identity, facet: &str) -> Result<Proxy> {
        let inner = self.inner.lock();
        self.check_for_deactivation(&inner)?;
        check_identity(&identity)?;
        check_servant(servant.as_ref())?;
        self.servants.add_servant(servant, &identity, facet)?;
        Ok(self.new_proxy(&inner, identity, facet))
    }

    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> Result<Proxy> {
        self.add_facet_with_uuid(servant, "")
    }

    pub fn add_facet_with_uuid(&self, servant: Arc<dyn Servant>, facet: &str) -> Result<Proxy> {
        self.add_facet(servant, Identity::new(uuid::Uuid::new_v4().to_string()), facet)
    }

    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        check_servant(servant.as_ref())?;
        let _inner = self.checked_lock()?;
        self.servants.add_default_servant(servant, category)
    }

    pub fn remove(&self, identity: &Identity) -> Result<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        let _inner = self.checked_lock()?;
        check_identity(identity)?;
        self.servants.remove_servant(identity, facet)
    }

    pub fn remove_all_facets(&self, identity: &Identity) -> Result<FacetMap> {
        let _inner = self.checked_lock()?;
        check_identity(identity)?;
        Ok(self.servants.remove_all_facets(identity))
    }

    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        let _inner = self.checked_lock()?;
        self.servants.remove_default_servant(category)
    }

    pub fn find(&self, identity: &Identity) -> Result<Option<Arc<dyn Servant>>> {
        self.find_facet(identity, "")
    }

    pub fn find_facet(&self, identity: &Identity, facet: &str) -> Result<Option<Arc<dyn Servant>>> {
        let _inner = self.checked_lock()?;
        check_identity(identity)?;
        Ok(self.servants.find_servant(identity, facet))
    }

    pub fn find_all_facets(&self, identity: &Identity) -> Result<FacetMap> {
        let _inner = self.checked_lock()?;
        check_identity(identity)?;
        Ok(self.servants.find_all_facets(identity))
    }

    pub fn find_by_proxy(&self, proxy: &Proxy) -> Result<Option<Arc<dyn Servant>>> {
        self.find_facet(proxy.identity(), proxy.facet())
    }

    pub fn find_default_servant(&self, category: &str) -> Result<Option<Arc<dyn Servant>>> {
        let _inner = self.checked_lock()?;
        Ok(self.servants.find_default_servant(category))
    }

    pub fn add_servant_locator(&self, locator: Arc<dyn ServantLocator>, category: &str) -> Result<()> {
        let _inner = self.checked_lock()?;
        self.servants.add_servant_locator(locator, category)
    }

    pub fn remove_servant_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>> {
        let _inner = self.checked_lock()?;
        self.servants.remove_servant_locator(category)
    }

    pub fn find_servant_locator(&self, category: &str) -> Result<Option<Arc<dyn ServantLocator>>> {
        let _inner = self.checked_lock()?;
        Ok(self.servants.find_servant_locator(category))
    }

    pub fn create_proxy(&self, identity: Identity) -> Result<Proxy> {
        let inner = self.checked_lock()?;
        check_identity(&identity)?;
        Ok(self.new_proxy(&inner, identity, ""))
    }

    pub fn create_direct_proxy(&self, identity: Identity) -> Result<Proxy> {
        self.new_direct_proxy_checked(identity, "")
    }

    pub fn create_indirect_proxy(&self, identity: Identity) -> Result<Proxy> {
        let _inner = self.checked_lock()?;
        check_identity(&identity)?;
        Ok(self.new_indirect_proxy(identity, "", &self.id))
    }

    pub fn set_locator(&self, locator: Option<Arc<dyn Locator>>) -> Result<()> {
        let mut inner = self.checked_lock()?;
        inner.locator_info = locator.map(|l| self.instance.locator_manager().get(l));
        Ok(())
    }

    pub fn get_locator(&self) -> Option<Arc<dyn Locator>> {
        self.inner
            .lock()
            .locator_info
            .as_ref()
            .map(|info| info.locator().clone())
    }

    /// Endpoints the listeners are bound to
    pub fn get_endpoints(&self) -> Vec<Endpoint> {
        self.inner.lock().incoming.iter().map(|f| f.endpoint()).collect()
    }

    /// Endpoints advertised in direct proxies and to the locator
    pub fn get_published_endpoints(&self) -> Vec<Endpoint> {
        self.inner.lock().published.clone()
    }

    /// Recompute the published endpoints and register them with the locator.
    /// On failure the previous list is restored.
    pub fn refresh_published_endpoints(&self) -> Result<()> {
        let (old, locator_info) = {
            let mut inner = self.checked_lock()?;
            let published = self.compute_published_endpoints(&inner.incoming)?;
            let old = std::mem::replace(&mut inner.published, published);
            (old, inner.locator_info.clone())
        };

        let result = self
            .new_direct_proxy_checked(Identity::new("dummy"), "")
            .and_then(|proxy| self.update_locator_registry(locator_info.as_ref(), Some(&proxy)));
        if let Err(err) = result {
            self.inner.lock().published = old;
            return Err(err);
        }
        Ok(())
    }

    /// Whether `proxy` designates an object this adapter can serve. Only
    /// takes the adapter mutex; never waits on I/O.
    pub fn is_local(&self, proxy: &Proxy) -> Result<bool> {
        let inner = self.checked_lock()?;
        if proxy.is_well_known() {
            return Ok(self.servants.has_servant(proxy.identity()));
        }
        if proxy.is_indirect() {
            let id = proxy.adapter_id();
            return Ok(id == self.id || (!self.replica_group_id.is_empty() && id == self.replica_group_id));
        }

        let listening: Vec<Endpoint> = inner.incoming.iter().map(|f| f.endpoint()).collect();
        for endpoint in proxy.endpoints() {
            if inner.published.iter().any(|p| endpoint.equivalent(p))
                || listening.iter().any(|l| endpoint.equivalent(l))
            {
                return Ok(true);
            }
        }

        if let (Some(router), Some(info)) = (proxy.router(), &inner.router_info) {
            if *router == info.identity() {
                for endpoint in proxy.endpoints() {
                    if inner.router_endpoints.iter().any(|r| endpoint.equivalent(r)) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    pub fn inc_direct_count(&self) -> Result<()> {
        let mut inner = self.checked_lock()?;
        inner.direct_count += 1;
        Ok(())
    }

    pub fn dec_direct_count(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.direct_count > 0);
        inner.direct_count = inner.direct_count.saturating_sub(1);
        if inner.direct_count == 0 {
            self.cond.notify_all();
        }
    }

    /// Raise the direct count for the lifetime of the returned guard
    pub fn direct_count_guard(self: &Arc<Self>) -> Result<DirectCountGuard> {
        self.inc_direct_count()?;
        Ok(DirectCountGuard {
            adapter: self.clone(),
        })
    }

    /// Dispatch a request from this process without going through a
    /// connection
    pub async fn invoke_collocated(self: &Arc<Self>, request: Request) -> std::result::Result<Bytes, RpcError> {
        let _guard = self.direct_count_guard()?;
        self.clone().dispatch_request(request).await
    }

    /// The adapter's own pool if it has one, otherwise the server pool
    pub fn get_thread_pool(&self) -> Arc<ThreadPool> {
        match &self.thread_pool {
            Some(pool) => pool.clone(),
            None => self.instance.server_thread_pool().clone(),
        }
    }

    pub fn get_acm(&self) -> AcmConfig {
        self.acm
    }

    pub fn message_size_max(&self) -> usize {
        self.message_size_max
    }

    async fn dispatch_request(self: Arc<Self>, request: Request) -> std::result::Result<Bytes, RpcError> {
        let current = Current::new(self.get_name(), &request);
        if let Some(servant) = self.servants.find_servant(&current.identity, &current.facet) {
            return servant.dispatch(&current, request.params).await;
        }

        let locator = self
            .servants
            .find_servant_locator(&current.identity.category)
            .or_else(|| self.servants.find_servant_locator(""));
        if let Some(locator) = locator {
            if let Some((servant, cookie)) = locator.locate(&current)? {
                let result = servant.dispatch(&current, request.params).await;
                locator.finished(&current, &servant, cookie);
                return result;
            }
        }

        if self.servants.has_servant(&current.identity) {
            Err(current.facet_not_exist())
        } else {
            Err(current.object_not_exist())
        }
    }

    fn checked_lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        self.check_for_deactivation(&inner)?;
        Ok(inner)
    }

    fn check_for_deactivation(&self, inner: &Inner) -> Result<()> {
        if inner.state >= AdapterState::Deactivating {
            return Err(LocalError::ObjectAdapterDeactivated(self.get_name().to_string()));
        }
        Ok(())
    }

    fn new_proxy(&self, inner: &Inner, identity: Identity, facet: &str) -> Proxy {
        if self.id.is_empty() {
            self.new_direct_proxy(inner, identity, facet)
        } else if !self.replica_group_id.is_empty() {
            self.new_indirect_proxy(identity, facet, &self.replica_group_id)
        } else {
            self.new_indirect_proxy(identity, facet, &self.id)
        }
    }

    fn new_direct_proxy_checked(&self, identity: Identity, facet: &str) -> Result<Proxy> {
        let inner = self.checked_lock()?;
        check_identity(&identity)?;
        Ok(self.new_direct_proxy(&inner, identity, facet))
    }

    fn new_direct_proxy(&self, inner: &Inner, identity: Identity, facet: &str) -> Proxy {
        let mut endpoints = inner.published.clone();
        endpoints.extend(inner.router_endpoints.iter().cloned());
        Proxy::direct(identity, endpoints)
            .with_facet(facet)
            .with_options(self.proxy_options)
    }

    fn new_indirect_proxy(&self, identity: Identity, facet: &str, id: &str) -> Proxy {
        Proxy::indirect(identity, id)
            .with_facet(facet)
            .with_options(self.proxy_options)
    }

    fn parse_endpoints(&self, list: &str, adapter_endpoints: bool) -> Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        for spec in split_endpoint_list(list) {
            match self.instance.endpoint_factory().create(spec, adapter_endpoints)? {
                Some(endpoint) => endpoints.push(endpoint),
                None if EndpointFactoryManager::is_unavailable_transport(spec) => {
                    warn!("ignoring endpoint `{}': transport not available", spec);
                }
                None => {
                    return Err(LocalError::EndpointParse(format!(
                        "invalid object adapter endpoint `{}'",
                        spec
                    )))
                }
            }
        }
        Ok(endpoints)
    }

    /// `<name>.PublishedEndpoints` if set, otherwise the listening endpoints
    /// with wildcard hosts expanded
    fn compute_published_endpoints(&self, incoming: &[Arc<dyn IncomingConnectionFactory>]) -> Result<Vec<Endpoint>> {
        let configured = if self.no_config {
            String::new()
        } else {
            self.instance
                .properties()
                .get_property(&format!("{}.PublishedEndpoints", self.name))
        };
        let mut endpoints = self.parse_endpoints(&configured, false)?;
        if endpoints.is_empty() {
            for factory in incoming {
                endpoints.extend(factory.endpoint().expand());
            }
        }

        if self.instance.traces().network >= 1 && !endpoints.is_empty() {
            debug!(
                target: NETWORK_CATEGORY,
                "published endpoints for object adapter `{}':\n{}",
                self.get_name(),
                join_endpoints(&endpoints)
            );
        }
        Ok(endpoints)
    }

    fn update_locator_registry(&self, locator_info: Option<&Arc<LocatorInfo>>, proxy: Option<&Proxy>) -> Result<()> {
        if self.id.is_empty() {
            return Ok(());
        }
        let Some(registry) = locator_info.and_then(|info| info.registry()) else {
            return Ok(());
        };

        let result = if self.replica_group_id.is_empty() {
            registry.set_adapter_direct_proxy(&self.id, proxy)
        } else {
            registry.set_replicated_adapter_direct_proxy(&self.id, &self.replica_group_id, proxy)
        };

        let traces = self.instance.traces();
        let err = match result {
            Ok(()) => None,
            Err(LocatorRegistryError::AdapterNotFound) => Some((
                "the object adapter is not known to the locator registry".to_string(),
                LocalError::NotRegistered {
                    kind: "object adapter".into(),
                    id: self.id.clone(),
                },
            )),
            Err(LocatorRegistryError::InvalidReplicaGroupId) => Some((
                format!("the replica group `{}' is not known to the locator registry", self.replica_group_id),
                LocalError::NotRegistered {
                    kind: "replica group".into(),
                    id: self.replica_group_id.clone(),
                },
            )),
            Err(LocatorRegistryError::AdapterAlreadyActive) => Some((
                "the object adapter endpoints are already set".to_string(),
                LocalError::ObjectAdapterIdInUse(self.id.clone()),
            )),
            Err(LocatorRegistryError::Local(
                LocalError::ObjectAdapterDeactivated(_) | LocalError::CommunicatorDestroyed,
            )) => return Ok(()),
            Err(LocatorRegistryError::Local(err)) => Some((err.to_string(), err)),
        };

        if let Some((reason, err)) = err {
            if traces.location >= 1 {
                debug!(
                    target: LOCATION_CATEGORY,
                    "couldn't update object adapter `{}' endpoints with the locator registry:\n{}",
                    self.id,
                    reason
                );
            }
            return Err(err);
        }

        if traces.location >= 1 {
            if let Some(proxy) = proxy {
                debug!(
                    target: LOCATION_CATEGORY,
                    "updated object adapter `{}' endpoints with the locator registry\nendpoints = {}",
                    self.id,
                    join_endpoints(proxy.endpoints())
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.get_name())
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

fn read_config(instance: &Instance, name: &str, no_config: bool, has_router: bool) -> Result<AdapterConfig> {
    if no_config {
        return Ok(AdapterConfig {
            id: String::new(),
            replica_group_id: String::new(),
            proxy_options: ProxyOptions::default(),
            acm: instance.server_acm(),
            message_size_max: instance.message_size_max(),
            thread_pool: None,
        });
    }

    let props = instance.properties();
    let unknown = unknown_properties(props, name);
    if !unknown.is_empty() && props.get_property_as_int_with_default("Rpc.Warn.UnknownProperties", 1) > 0 {
        warn!(
            "found unknown properties for object adapter `{}':\n    {}",
            name,
            unknown.join("\n    ")
        );
    }

    if !has_router && props.get_properties_for_prefix(&format!("{}.", name)).is_empty() {
        return Err(LocalError::Initialization(format!(
            "object adapter `{}' requires configuration",
            name
        )));
    }

    let options = props.get_property_with_default(&format!("{}.ProxyOptions", name), "-t");
    let proxy_options = ProxyOptions::parse(&options).map_err(|_| {
        LocalError::Initialization(format!(
            "invalid proxy options `{}' for object adapter `{}'",
            options, name
        ))
    })?;

    let size_key = format!("{}.MessageSizeMax", name);
    let message_size_max = if props.get_property(&size_key).is_empty() {
        instance.message_size_max()
    } else {
        message_size_limit(props.get_property_as_int(&size_key))
    };

    let pool_prefix = format!("{}.ThreadPool", name);
    let thread_pool = if props.get_property_as_int(&format!("{}.Size", pool_prefix)) > 0
        || props.get_property_as_int(&format!("{}.SizeMax", pool_prefix)) > 0
    {
        let config = ThreadPoolConfig::from_properties(props, &pool_prefix, 1);
        Some(Arc::new(ThreadPool::new(
            format!("{}-{}", instance.program_name(), pool_prefix),
            config,
        )?))
    } else {
        None
    };

    Ok(AdapterConfig {
        id: props.get_property(&format!("{}.AdapterId", name)),
        replica_group_id: props.get_property(&format!("{}.ReplicaGroupId", name)),
        proxy_options,
        acm: AcmConfig::from_properties(props, &format!("{}.ACM", name), &instance.server_acm()),
        message_size_max,
        thread_pool,
    })
}

/// Keys under `<name>.` that the adapter does not recognise
fn unknown_properties(props: &rpcnet::Properties, name: &str) -> Vec<String> {
    let prefix = format!("{}.", name);
    if RESERVED_PREFIXES.iter().any(|reserved| prefix.starts_with(reserved)) {
        return Vec::new();
    }
    props
        .get_properties_for_prefix(&prefix)
        .into_keys()
        .filter(|key| !PROPERTY_SUFFIXES.contains(&&key[prefix.len()..]))
        .collect()
}

fn check_identity(identity: &Identity) -> Result<()> {
    if identity.name.is_empty() {
        return Err(LocalError::IllegalIdentity(identity.to_string()));
    }
    Ok(())
}

fn check_servant(servant: &dyn Servant) -> Result<()> {
    if servant.is_empty() {
        return Err(LocalError::IllegalServant("servant has no operations".into()));
    }
    Ok(())
}

fn join_endpoints(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":")
}
