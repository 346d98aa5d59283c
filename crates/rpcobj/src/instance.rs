//! Runtime instance and communicator
//!
//! [`Instance`] holds everything shared by the adapters and outgoing
//! connections of one runtime: properties, the timer, the thread pools, the
//! outgoing connection factory and the router and locator tables.
//! [`Communicator`] is the application-facing handle that owns an instance and
//! its adapter factory and tears both down in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use rpcnet::protocol::message_size_limit;
use rpcnet::trace::LOCATION_CATEGORY;
use rpcnet::{
    AcmConfig, Endpoint, EndpointDefaults, EndpointFactoryManager, Identity, LocalError,
    OperationMode, OutgoingConnection, OutgoingConnectionFactory, OutgoingSettings, Properties,
    Request, Result, RetryContext, RetryPolicy, RpcError, ThreadPool, ThreadPoolConfig, Timer,
    TraceLevels,
};

use crate::adapter::ObjectAdapter;
use crate::factory::ObjectAdapterFactory;
use crate::locator::{Locator, LocatorManager};
use crate::reference::{InvocationMode, Proxy, Target};
use crate::router::{Router, RouterManager};

/// Shared runtime state
pub struct Instance {
    properties: Arc<Properties>,
    program_name: String,
    traces: TraceLevels,
    endpoint_factory: EndpointFactoryManager,
    retry_policy: RetryPolicy,
    server_acm: AcmConfig,
    message_size_max: usize,
    invocation_timeout: Option<Duration>,
    timer: Arc<Timer>,
    server_pool: Arc<ThreadPool>,
    client_pool: Arc<ThreadPool>,
    outgoing: Arc<OutgoingConnectionFactory>,
    router_manager: RouterManager,
    locator_manager: LocatorManager,
    routers: Mutex<HashMap<Identity, Arc<dyn Router>>>,
    locators: Mutex<HashMap<Identity, Arc<dyn Locator>>>,
    default_locator: Mutex<Option<Arc<dyn Locator>>>,
    destroyed: AtomicBool,
}

impl Instance {
    pub fn new(properties: Arc<Properties>) -> Result<Arc<Self>> {
        let program_name = properties.get_property_with_default("Rpc.ProgramName", "rpc");
        let traces = TraceLevels::from_properties(&properties);

        let client_acm = AcmConfig::from_properties(&properties, "Rpc.ACM", &AcmConfig::new(false));
        let server_acm = AcmConfig::from_properties(
            &properties,
            "Rpc.ACM.Server",
            &AcmConfig::from_properties(&properties, "Rpc.ACM", &AcmConfig::new(true)),
        );
        debug!("client ACM {:?}, server ACM {:?}", client_acm, server_acm);

        let timeout = properties.get_property_as_int_with_default("Rpc.Default.InvocationTimeout", -1);
        let invocation_timeout = (timeout > 0).then(|| Duration::from_millis(timeout as u64));

        let timer = Arc::new(Timer::new(format!("{}-Rpc.Timer", program_name))?);
        let server_pool = Arc::new(ThreadPool::new(
            format!("{}-Rpc.ThreadPool.Server", program_name),
            ThreadPoolConfig::from_properties(&properties, "Rpc.ThreadPool.Server", 1),
        )?);
        let client_pool = Arc::new(ThreadPool::new(
            format!("{}-Rpc.ThreadPool.Client", program_name),
            ThreadPoolConfig::from_properties(&properties, "Rpc.ThreadPool.Client", 1),
        )?);
        let outgoing = Arc::new(OutgoingConnectionFactory::new(
            OutgoingSettings::from_properties(&properties),
            Some(timer.clone()),
        ));

        Ok(Arc::new(Self {
            program_name,
            traces,
            endpoint_factory: EndpointFactoryManager::new(EndpointDefaults::from_properties(&properties)),
            retry_policy: RetryPolicy::from_properties(&properties, traces),
            server_acm,
            message_size_max: message_size_limit(
                properties.get_property_as_int_with_default("Rpc.MessageSizeMax", 1024),
            ),
            invocation_timeout,
            timer,
            server_pool,
            client_pool,
            outgoing,
            router_manager: RouterManager::new(),
            locator_manager: LocatorManager::new(),
            routers: Mutex::new(HashMap::new()),
            locators: Mutex::new(HashMap::new()),
            default_locator: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            properties,
        }))
    }

    pub fn properties(&self) -> &Arc<Properties> {
        &self.properties
    }

    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    pub fn traces(&self) -> TraceLevels {
        self.traces
    }

    pub fn endpoint_factory(&self) -> &EndpointFactoryManager {
        &self.endpoint_factory
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn server_acm(&self) -> AcmConfig {
        self.server_acm
    }

    /// Bytes, from `Rpc.MessageSizeMax`
    pub fn message_size_max(&self) -> usize {
        self.message_size_max
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn server_thread_pool(&self) -> &Arc<ThreadPool> {
        &self.server_pool
    }

    pub fn client_thread_pool(&self) -> &Arc<ThreadPool> {
        &self.client_pool
    }

    pub fn outgoing_connection_factory(&self) -> &Arc<OutgoingConnectionFactory> {
        &self.outgoing
    }

    pub fn router_manager(&self) -> &RouterManager {
        &self.router_manager
    }

    pub fn locator_manager(&self) -> &LocatorManager {
        &self.locator_manager
    }

    /// Make a router reachable through `<adapter>.Router` properties
    pub fn add_router(&self, router: Arc<dyn Router>) {
        self.routers.lock().insert(router.identity(), router);
    }

    /// Make a locator reachable through `<adapter>.Locator` and
    /// `Rpc.Default.Locator`
    pub fn add_locator(&self, locator: Arc<dyn Locator>) {
        self.locators.lock().insert(locator.identity(), locator);
    }

    /// Router named by a proxy string
    pub fn find_router(&self, proxy: &str) -> Result<Arc<dyn Router>> {
        let identity = Proxy::parse(proxy, &self.endpoint_factory)?.identity().clone();
        self.routers.lock().get(&identity).cloned().ok_or_else(|| {
            LocalError::Initialization(format!("no router registered for `{}'", proxy))
        })
    }

    /// Locator named by a proxy string
    pub fn find_locator(&self, proxy: &str) -> Result<Arc<dyn Locator>> {
        let identity = Proxy::parse(proxy, &self.endpoint_factory)?.identity().clone();
        self.locators.lock().get(&identity).cloned().ok_or_else(|| {
            LocalError::Initialization(format!("no locator registered for `{}'", proxy))
        })
    }

    pub fn set_default_locator(&self, locator: Option<Arc<dyn Locator>>) {
        *self.default_locator.lock() = locator;
    }

    /// The explicitly set default locator, else the one `Rpc.Default.Locator`
    /// names
    pub fn default_locator(&self) -> Option<Arc<dyn Locator>> {
        if let Some(locator) = self.default_locator.lock().clone() {
            return Some(locator);
        }
        let configured = self.properties.get_property("Rpc.Default.Locator");
        if configured.is_empty() {
            return None;
        }
        self.find_locator(&configured).ok()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Endpoints an invocation on `proxy` may connect to
    fn resolve_endpoints(&self, proxy: &Proxy) -> Result<Vec<Endpoint>> {
        let endpoints = if let Some(router) = proxy.router() {
            let router = self.routers.lock().get(router).cloned();
            match router {
                Some(router) => router.client_endpoints(),
                None => return Err(LocalError::NoEndpoint(proxy.to_string())),
            }
        } else {
            match proxy.target() {
                Target::Direct(endpoints) if !endpoints.is_empty() => endpoints.clone(),
                Target::Direct(_) => self.locate(proxy, "")?,
                Target::Indirect(adapter_id) => self.locate(proxy, adapter_id)?,
            }
        };

        let datagram = proxy.mode().is_datagram();
        let endpoints: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|e| e.datagram() == datagram)
            .collect();
        if endpoints.is_empty() {
            return Err(LocalError::NoEndpoint(proxy.to_string()));
        }
        Ok(endpoints)
    }

    fn locate(&self, proxy: &Proxy, adapter_id: &str) -> Result<Vec<Endpoint>> {
        let locator = self
            .default_locator()
            .ok_or_else(|| LocalError::NoEndpoint(proxy.to_string()))?;

        let mut adapter_id = adapter_id.to_string();
        if adapter_id.is_empty() {
            let object = locator
                .find_object_by_id(proxy.identity())?
                .ok_or_else(|| LocalError::NotRegistered {
                    kind: "object".into(),
                    id: proxy.identity().to_string(),
                })?;
            if !object.is_indirect() {
                return Ok(object.endpoints().to_vec());
            }
            adapter_id = object.adapter_id().to_string();
        }

        let resolved = locator
            .find_adapter_by_id(&adapter_id)?
            .ok_or_else(|| LocalError::NotRegistered {
                kind: "object adapter".into(),
                id: adapter_id.clone(),
            })?;
        if self.traces.location >= 1 {
            debug!(
                target: LOCATION_CATEGORY,
                "retrieved endpoints for adapter `{}' from the locator:\n{}",
                adapter_id,
                resolved
            );
        }
        Ok(resolved.endpoints().to_vec())
    }

    async fn connect(&self, proxy: &Proxy) -> Result<Arc<OutgoingConnection>> {
        let endpoints = self.resolve_endpoints(proxy)?;
        self.outgoing.create(&endpoints).await
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("program_name", &self.program_name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Send `request` over a connection, retrying per the retry policy
async fn invoke_remote(
    instance: Arc<Instance>,
    proxy: Proxy,
    request: Request,
) -> std::result::Result<Bytes, RpcError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut sent = false;
        let result = match instance.connect(&proxy).await {
            Err(err) => Err(RpcError::from(err)),
            Ok(connection) => {
                sent = true;
                let request = request.clone();
                match proxy.mode() {
                    InvocationMode::Twoway => connection.invoke(request, instance.invocation_timeout).await,
                    InvocationMode::Oneway | InvocationMode::Datagram => connection
                        .send_oneway(request)
                        .await
                        .map(|()| Bytes::new())
                        .map_err(RpcError::from),
                    InvocationMode::BatchOneway | InvocationMode::BatchDatagram => connection
                        .batch_request(&request)
                        .map(|()| Bytes::new())
                        .map_err(RpcError::from),
                }
            }
        };

        let err = match result {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };
        let ctx = RetryContext {
            sent,
            mode: request.mode,
            indirect: proxy.is_indirect(),
        };
        match instance.retry_policy.check_retry(&err, &ctx, attempt) {
            Some(delay) if !delay.is_zero() => tokio::time::sleep(delay).await,
            Some(_) => {}
            None => return Err(err),
        }
    }
}

/// Application handle on a runtime instance
pub struct Communicator {
    instance: Arc<Instance>,
    adapter_factory: Arc<ObjectAdapterFactory>,
}

impl Communicator {
    pub fn new(properties: Properties) -> Result<Self> {
        Self::with_properties(Arc::new(properties))
    }

    pub fn with_properties(properties: Arc<Properties>) -> Result<Self> {
        let instance = Instance::new(properties)?;
        let adapter_factory = ObjectAdapterFactory::new(instance.clone());
        info!("communicator `{}' initialized", instance.program_name());
        Ok(Self {
            instance,
            adapter_factory,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn properties(&self) -> &Arc<Properties> {
        self.instance.properties()
    }

    pub fn adapter_factory(&self) -> &Arc<ObjectAdapterFactory> {
        &self.adapter_factory
    }

    pub fn add_router(&self, router: Arc<dyn Router>) {
        self.instance.add_router(router);
    }

    pub fn add_locator(&self, locator: Arc<dyn Locator>) {
        self.instance.add_locator(locator);
    }

    pub fn set_default_locator(&self, locator: Option<Arc<dyn Locator>>) {
        self.instance.set_default_locator(locator);
    }

    pub fn get_default_locator(&self) -> Option<Arc<dyn Locator>> {
        self.instance.default_locator()
    }

    pub fn string_to_proxy(&self, s: &str) -> Result<Proxy> {
        Proxy::parse(s, self.instance.endpoint_factory())
    }

    /// Create an adapter configured by `<name>.*` properties. An empty name
    /// creates an anonymous adapter without endpoints.
    pub fn create_object_adapter(&self, name: &str) -> Result<Arc<ObjectAdapter>> {
        self.adapter_factory.create_object_adapter(name, None)
    }

    /// Create an adapter listening on `endpoints`. An empty name is replaced
    /// by a generated one.
    pub fn create_object_adapter_with_endpoints(&self, name: &str, endpoints: &str) -> Result<Arc<ObjectAdapter>> {
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        self.properties()
            .set_property(format!("{}.Endpoints", name), endpoints);
        self.adapter_factory.create_object_adapter(&name, None)
    }

    /// Create an adapter that receives its requests through `router`
    pub fn create_object_adapter_with_router(&self, name: &str, router: Arc<dyn Router>) -> Result<Arc<ObjectAdapter>> {
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        self.properties().set_property(
            format!("{}.Router", name),
            Proxy::well_known(router.identity()).to_string(),
        );
        self.instance.add_router(router.clone());
        self.adapter_factory.create_object_adapter(&name, Some(router))
    }

    pub fn find_object_adapter(&self, proxy: &Proxy) -> Option<Arc<ObjectAdapter>> {
        self.adapter_factory.find_object_adapter(proxy)
    }

    /// Invoke `operation` on the object `proxy` designates. Objects served by
    /// an adapter of this communicator are dispatched in-process; others go
    /// through an outgoing connection on the client thread pool.
    pub async fn invoke(
        &self,
        proxy: &Proxy,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> std::result::Result<Bytes, RpcError> {
        if self.instance.is_destroyed() {
            return Err(LocalError::CommunicatorDestroyed.into());
        }

        let mut request = Request::new(proxy.identity().clone(), operation, params);
        request.facet = proxy.facet().to_string();
        request.mode = mode;

        if let Some(adapter) = self.adapter_factory.find_object_adapter(proxy) {
            let reply = adapter.invoke_collocated(request).await;
            if proxy.mode().is_twoway() {
                return reply;
            }
            if let Err(err) = reply {
                debug!("collocated oneway `{}' failed: {}", operation, err);
            }
            return Ok(Bytes::new());
        }

        let instance = self.instance.clone();
        let proxy = proxy.clone();
        self.instance
            .client_thread_pool()
            .spawn(invoke_remote(instance, proxy, request))
            .await
            .unwrap_or_else(|_| Err(LocalError::CommunicatorDestroyed.into()))
    }

    /// Send every queued batch request
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let outgoing = self.instance.outgoing_connection_factory().clone();
        self.instance
            .client_thread_pool()
            .spawn(async move { outgoing.flush_batch_requests().await })
            .await
            .unwrap_or(Err(LocalError::CommunicatorDestroyed))
    }

    /// Deactivate every adapter
    pub fn shutdown(&self) {
        self.adapter_factory.shutdown();
    }

    pub fn wait_for_shutdown(&self) {
        self.adapter_factory.wait_for_shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.adapter_factory.is_shutdown()
    }

    /// Destroy the adapters, the outgoing connections, the timer and the
    /// thread pools, in that order. Idempotent.
    pub fn destroy(&self) {
        if self.instance.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.adapter_factory.shutdown();
        self.adapter_factory.destroy();
        self.instance.outgoing.destroy();
        self.instance.timer.destroy();
        self.instance.client_pool.destroy();
        self.instance.server_pool.destroy();
        self.instance.router_manager.destroy();
        self.instance.locator_manager.destroy();
        info!("communicator `{}' destroyed", self.instance.program_name());
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("instance", &self.instance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LocalLocator;
    use crate::servant::{OperationTable, Servant};

    fn echo() -> Arc<dyn Servant> {
        OperationTable::builder()
            .operation("echo", |_current, params| async move { Ok(params) })
            .operation("name", |current, _params| async move {
                Ok(Bytes::from(current.adapter_name.clone()))
            })
            .build_arc()
    }

    fn server(pairs: &[(&str, &str)]) -> (Communicator, Arc<ObjectAdapter>) {
        let communicator = Communicator::new(Properties::from_pairs(pairs.iter().copied())).unwrap();
        let adapter = communicator
            .create_object_adapter_with_endpoints("Server", "tcp -h 127.0.0.1 -p 0")
            .unwrap();
        adapter.add(echo(), Identity::new("echo")).unwrap();
        (communicator, adapter)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_invocation() {
        let (server, adapter) = server(&[]);
        adapter.activate().unwrap();
        let proxy = adapter.create_direct_proxy(Identity::new("echo")).unwrap();

        let client = Communicator::new(Properties::new()).unwrap();
        let proxy = client.string_to_proxy(&proxy.to_string()).unwrap();
        assert!(client.find_object_adapter(&proxy).is_none());

        let reply = client
            .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"ping");

        let reply = client
            .invoke(&proxy, "name", OperationMode::Idempotent, Bytes::new())
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"Server");

        let err = client
            .invoke(&proxy, "nope", OperationMode::Normal, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Local(LocalError::OperationNotExist { .. })));

        let unknown = client
            .string_to_proxy(&format!("ghost:{}", adapter.get_published_endpoints()[0]))
            .unwrap();
        let err = client
            .invoke(&unknown, "echo", OperationMode::Normal, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Local(LocalError::ObjectNotExist { .. })));

        client.destroy();
        server.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_indirect_invocation_through_locator() {
        let locator = LocalLocator::new(Identity::new("Locator"), true);
        let (server, adapter) = server(&[("Server.AdapterId", "EchoAdapter")]);
        adapter.set_locator(Some(locator.clone())).unwrap();
        adapter.activate().unwrap();
        assert!(locator.registered_proxy("EchoAdapter").is_some());

        let client = Communicator::new(Properties::new()).unwrap();
        client.set_default_locator(Some(locator.clone()));
        let proxy = client.string_to_proxy("echo @ EchoAdapter").unwrap();
        let reply = client
            .invoke(&proxy, "echo", OperationMode::Normal, Bytes::from_static(b"indirect"))
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"indirect");

        let unregistered = client.string_to_proxy("echo @ Nowhere").unwrap();
        let err = client
            .invoke(&unregistered, "echo", OperationMode::Normal, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Local(LocalError::NotRegistered { .. })));

        server.destroy();
        assert!(locator.registered_proxy("EchoAdapter").is_none());
        client.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Communicator::new(Properties::from_pairs([("Rpc.RetryIntervals", "0 10")])).unwrap();
        let proxy = client
            .string_to_proxy(&format!("echo:tcp -h 127.0.0.1 -p {} -t 1000", port))
            .unwrap();
        let err = client
            .invoke(&proxy, "echo", OperationMode::Normal, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Local(LocalError::ConnectionRefused(_) | LocalError::ConnectFailed(_) | LocalError::ConnectTimeout)
        ));
        client.destroy();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invoke_after_destroy() {
        let client = Communicator::new(Properties::new()).unwrap();
        let proxy = client.string_to_proxy("echo:tcp -h 127.0.0.1 -p 4061").unwrap();
        client.destroy();
        client.destroy();
        let err = client
            .invoke(&proxy, "echo", OperationMode::Normal, Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Local(LocalError::CommunicatorDestroyed));
        assert!(client.is_shutdown());
        assert!(matches!(
            client.create_object_adapter(""),
            Err(LocalError::CommunicatorDestroyed)
        ));
    }

    #[test]
    fn test_locator_from_property() {
        let communicator = Communicator::new(Properties::from_pairs([
            ("Located.AdapterId", "LocatedId"),
            ("Located.Locator", "Registry/Locator"),
            ("Unlocated.AdapterId", "UnlocatedId"),
            ("Unlocated.Locator", "Missing/Locator"),
        ]))
        .unwrap();
        let locator = LocalLocator::new(Identity::with_category("Locator", "Registry"), false);
        locator.add_adapter("LocatedId");
        communicator.add_locator(locator.clone());

        let adapter = communicator.create_object_adapter("Located").unwrap();
        adapter.activate().unwrap();
        assert_eq!(
            locator.registered_proxy("LocatedId").unwrap().endpoints(),
            adapter.get_published_endpoints().as_slice()
        );
        assert!(matches!(
            communicator.create_object_adapter("Unlocated"),
            Err(LocalError::Initialization(_))
        ));
        communicator.destroy();
    }

    #[test]
    fn test_static_locator_rejects_unknown_adapter() {
        let communicator = Communicator::new(Properties::from_pairs([("Stray.AdapterId", "StrayId")])).unwrap();
        communicator.set_default_locator(Some(LocalLocator::new(Identity::new("Locator"), false)));
        let adapter = communicator.create_object_adapter("Stray").unwrap();
        assert_eq!(
            adapter.activate().unwrap_err(),
            LocalError::NotRegistered {
                kind: "object adapter".into(),
                id: "StrayId".into()
            }
        );
        communicator.destroy();
    }

    #[test]
    fn test_wait_for_shutdown() {
        let communicator = Arc::new(Communicator::new(Properties::new()).unwrap());
        let adapter = communicator.create_object_adapter("").unwrap();
        adapter.activate().unwrap();

        let waiter = {
            let communicator = communicator.clone();
            std::thread::spawn(move || communicator.wait_for_shutdown())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        communicator.shutdown();
        waiter.join().unwrap();
        assert!(adapter.is_deactivated());
        communicator.destroy();
        assert_eq!(adapter.state(), crate::adapter::AdapterState::Destroyed);
    }
}
