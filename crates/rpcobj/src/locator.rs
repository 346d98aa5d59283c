//! Locator collaborators
//!
//! A locator resolves indirect proxies to endpoints; its registry is where
//! adapters with an adapter id publish their direct proxy on activation and
//! remove it on deactivation. The runtime only sees these traits; the
//! directory service behind them is external.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use rpcnet::{Identity, LocalError};

use crate::reference::Proxy;

/// Failures reported by a locator registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocatorRegistryError {
    #[error("adapter not found")]
    AdapterNotFound,

    #[error("invalid replica group id")]
    InvalidReplicaGroupId,

    #[error("adapter already active")]
    AdapterAlreadyActive,

    #[error(transparent)]
    Local(#[from] LocalError),
}

pub trait LocatorRegistry: Send + Sync {
    /// Publish (`Some`) or withdraw (`None`) the direct proxy of an adapter
    fn set_adapter_direct_proxy(
        &self,
        adapter_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError>;

    /// Same for an adapter that is a member of a replica group
    fn set_replicated_adapter_direct_proxy(
        &self,
        adapter_id: &str,
        replica_group_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError>;
}

pub trait Locator: Send + Sync {
    fn identity(&self) -> Identity;

    /// The registry adapters publish to, if the locator has one
    fn registry(&self) -> Option<Arc<dyn LocatorRegistry>>;

    /// Direct proxy currently registered for an adapter or replica group id
    fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Proxy>, LocalError>;

    /// Proxy registered for a well-known object
    fn find_object_by_id(&self, _identity: &Identity) -> Result<Option<Proxy>, LocalError> {
        Ok(None)
    }
}

/// A locator as used by one or more adapters
pub struct LocatorInfo {
    locator: Arc<dyn Locator>,
}

impl LocatorInfo {
    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    pub fn registry(&self) -> Option<Arc<dyn LocatorRegistry>> {
        self.locator.registry()
    }
}

impl std::fmt::Debug for LocatorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorInfo")
            .field("locator", &self.locator.identity())
            .finish()
    }
}

/// Shares one [`LocatorInfo`] per locator identity
#[derive(Default)]
pub struct LocatorManager {
    table: Mutex<HashMap<Identity, Arc<LocatorInfo>>>,
}

impl LocatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, locator: Arc<dyn Locator>) -> Arc<LocatorInfo> {
        self.table
            .lock()
            .entry(locator.identity())
            .or_insert_with(|| Arc::new(LocatorInfo { locator }))
            .clone()
    }

    pub fn destroy(&self) {
        self.table.lock().clear();
    }
}

#[derive(Debug, Default)]
struct Directory {
    adapters: HashMap<String, Option<Proxy>>,
    /// Replica group id to member adapter ids
    replica_groups: HashMap<String, Vec<String>>,
    objects: HashMap<Identity, Proxy>,
}

/// In-process locator and registry
///
/// With dynamic registration enabled any adapter id may publish itself;
/// otherwise ids must be declared up front with [`LocalLocator::add_adapter`]
/// and [`LocalLocator::add_replica_group`].
pub struct LocalLocator {
    weak_self: Weak<LocalLocator>,
    identity: Identity,
    dynamic: bool,
    directory: Mutex<Directory>,
}

impl LocalLocator {
    pub fn new(identity: Identity, dynamic: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            identity,
            dynamic,
            directory: Mutex::new(Directory::default()),
        })
    }

    pub fn add_adapter(&self, adapter_id: impl Into<String>) {
        self.directory.lock().adapters.entry(adapter_id.into()).or_insert(None);
    }

    pub fn add_replica_group(&self, replica_group_id: impl Into<String>) {
        self.directory
            .lock()
            .replica_groups
            .entry(replica_group_id.into())
            .or_default();
    }

    pub fn add_object(&self, proxy: Proxy) {
        self.directory.lock().objects.insert(proxy.identity().clone(), proxy);
    }

    /// Direct proxy registered for `adapter_id`
    pub fn registered_proxy(&self, adapter_id: &str) -> Option<Proxy> {
        self.directory.lock().adapters.get(adapter_id).cloned().flatten()
    }

    fn set_adapter(
        dir: &mut Directory,
        dynamic: bool,
        adapter_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError> {
        match dir.adapters.get_mut(adapter_id) {
            Some(slot) => *slot = proxy.cloned(),
            None if dynamic => {
                dir.adapters.insert(adapter_id.to_string(), proxy.cloned());
            }
            None => return Err(LocatorRegistryError::AdapterNotFound),
        }
        Ok(())
    }
}

impl LocatorRegistry for LocalLocator {
    fn set_adapter_direct_proxy(
        &self,
        adapter_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError> {
        let mut dir = self.directory.lock();
        Self::set_adapter(&mut dir, self.dynamic, adapter_id, proxy)
    }

    fn set_replicated_adapter_direct_proxy(
        &self,
        adapter_id: &str,
        replica_group_id: &str,
        proxy: Option<&Proxy>,
    ) -> Result<(), LocatorRegistryError> {
        let mut dir = self.directory.lock();
        if !dir.replica_groups.contains_key(replica_group_id) && !self.dynamic {
            return Err(LocatorRegistryError::InvalidReplicaGroupId);
        }
        Self::set_adapter(&mut dir, self.dynamic, adapter_id, proxy)?;
        let members = dir.replica_groups.entry(replica_group_id.to_string()).or_default();
        if !members.iter().any(|m| m == adapter_id) {
            members.push(adapter_id.to_string());
        }
        Ok(())
    }
}

impl Locator for LocalLocator {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn registry(&self) -> Option<Arc<dyn LocatorRegistry>> {
        // Serves as its own registry
        let registry: Arc<dyn LocatorRegistry> = self.weak_self.upgrade()?;
        Some(registry)
    }

    fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Proxy>, LocalError> {
        let dir = self.directory.lock();
        if let Some(Some(proxy)) = dir.adapters.get(adapter_id) {
            return Ok(Some(proxy.clone()));
        }
        // A replica group resolves to the union of its active members
        let Some(members) = dir.replica_groups.get(adapter_id) else {
            return Ok(None);
        };
        let mut merged: Option<Proxy> = None;
        for member in members {
            if let Some(Some(proxy)) = dir.adapters.get(member) {
                merged = Some(match merged {
                    None => proxy.clone(),
                    Some(acc) => {
                        let mut endpoints = acc.endpoints().to_vec();
                        endpoints.extend(proxy.endpoints().iter().cloned());
                        acc.with_endpoints(endpoints)
                    }
                });
            }
        }
        Ok(merged)
    }

    fn find_object_by_id(&self, identity: &Identity) -> Result<Option<Proxy>, LocalError> {
        Ok(self.directory.lock().objects.get(identity).cloned())
    }
}
