//! Registry of the adapters of one communicator

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use rpcnet::{LocalError, Result};

use crate::adapter::{ObjectAdapter, ADAPTER_CATEGORY};
use crate::instance::Instance;
use crate::reference::Proxy;
use crate::router::Router;

#[derive(Default)]
struct Registry {
    shut_down: bool,
    adapters: Vec<Arc<ObjectAdapter>>,
    /// Names of created adapters and of adapters being constructed
    names: HashSet<String>,
}

pub struct ObjectAdapterFactory {
    instance: Arc<Instance>,
    weak_self: Weak<ObjectAdapterFactory>,
    registry: Mutex<Registry>,
    cond: Condvar,
}

impl ObjectAdapterFactory {
    pub fn new(instance: Arc<Instance>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            instance,
            weak_self: weak_self.clone(),
            registry: Mutex::new(Registry::default()),
            cond: Condvar::new(),
        })
    }

    /// Create and register an adapter. An empty name creates an anonymous
    /// adapter under a generated name.
    pub fn create_object_adapter(&self, name: &str, router: Option<Arc<dyn Router>>) -> Result<Arc<ObjectAdapter>> {
        let no_config = name.is_empty();
        let name = if no_config {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };

        {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                return Err(LocalError::CommunicatorDestroyed);
            }
            if !registry.names.insert(name.clone()) {
                return Err(LocalError::AlreadyRegistered {
                    kind: "object adapter".into(),
                    id: name,
                });
            }
        }

        // Construction binds sockets, so it runs with the name reserved but
        // outside the lock
        let created = ObjectAdapter::create(
            self.instance.clone(),
            self.weak_self.clone(),
            name.clone(),
            no_config,
            router,
        );

        let mut registry = self.registry.lock();
        match created {
            Err(err) => {
                registry.names.remove(&name);
                Err(err)
            }
            Ok(adapter) if registry.shut_down => {
                registry.names.remove(&name);
                drop(registry);
                adapter.destroy();
                Err(LocalError::CommunicatorDestroyed)
            }
            Ok(adapter) => {
                registry.adapters.push(adapter.clone());
                debug!(target: ADAPTER_CATEGORY, "created object adapter `{}'", adapter.get_name());
                Ok(adapter)
            }
        }
    }

    /// First adapter that can serve `proxy` locally
    pub fn find_object_adapter(&self, proxy: &Proxy) -> Option<Arc<ObjectAdapter>> {
        let adapters = {
            let registry = self.registry.lock();
            if registry.shut_down {
                return None;
            }
            registry.adapters.clone()
        };

        for adapter in adapters {
            match adapter.is_local(proxy) {
                Ok(true) => return Some(adapter),
                Ok(false) | Err(LocalError::ObjectAdapterDeactivated(_)) => {}
                Err(err) => debug!("is_local failed for object adapter `{}': {}", adapter.get_name(), err),
            }
        }
        None
    }

    pub(crate) fn remove_object_adapter(&self, adapter: &ObjectAdapter) {
        let mut registry = self.registry.lock();
        let before = registry.adapters.len();
        registry
            .adapters
            .retain(|a| !std::ptr::eq(Arc::as_ptr(a), adapter as *const ObjectAdapter));
        if registry.adapters.len() != before {
            registry.names.remove(adapter.name());
        }
    }

    /// Deactivate every adapter. Later creates fail.
    pub fn shutdown(&self) {
        let adapters = {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            self.cond.notify_all();
            registry.adapters.clone()
        };

        for adapter in adapters {
            adapter.deactivate();
        }
    }

    /// Block until `shutdown` was called and every adapter finished
    /// deactivating
    pub fn wait_for_shutdown(&self) {
        let adapters = {
            let mut registry = self.registry.lock();
            while !registry.shut_down {
                self.cond.wait(&mut registry);
            }
            registry.adapters.clone()
        };

        for adapter in adapters {
            adapter.wait_for_deactivate();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.registry.lock().shut_down
    }

    /// Destroy every adapter once shutdown completed
    pub fn destroy(&self) {
        self.wait_for_shutdown();

        let adapters = self.registry.lock().adapters.clone();
        for adapter in adapters {
            adapter.destroy();
        }

        let mut registry = self.registry.lock();
        registry.adapters.clear();
        registry.names.clear();
    }

    pub fn adapter_count(&self) -> usize {
        self.registry.lock().adapters.len()
    }
}

impl std::fmt::Debug for ObjectAdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ObjectAdapterFactory")
            .field("shut_down", &registry.shut_down)
            .field("adapters", &registry.adapters.len())
            .finish()
    }
}
