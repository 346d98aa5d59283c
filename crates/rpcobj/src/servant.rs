//! Servants and the per-adapter servant registry
//!
//! A servant is registered under an identity and a facet. Lookups fall back to
//! default servants registered per category, and finally to servant locators
//! that create servants on demand.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use rpcnet::{Identity, LocalError, OperationMode, Request, Result, RpcError};

/// Call context handed to a servant
#[derive(Debug, Clone)]
pub struct Current {
    pub adapter_name: String,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: BTreeMap<String, String>,
    /// 0 for oneway, batched and collocated oneway requests
    pub request_id: i32,
}

impl Current {
    pub fn new(adapter_name: impl Into<String>, request: &Request) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            mode: request.mode,
            context: request.context.clone(),
            request_id: request.request_id,
        }
    }

    pub fn object_not_exist(&self) -> RpcError {
        LocalError::ObjectNotExist {
            identity: self.identity.to_string(),
            facet: self.facet.clone(),
            operation: self.operation.clone(),
        }
        .into()
    }

    pub fn facet_not_exist(&self) -> RpcError {
        LocalError::FacetNotExist {
            identity: self.identity.to_string(),
            facet: self.facet.clone(),
            operation: self.operation.clone(),
        }
        .into()
    }

    pub fn operation_not_exist(&self) -> RpcError {
        LocalError::OperationNotExist {
            identity: self.identity.to_string(),
            facet: self.facet.clone(),
            operation: self.operation.clone(),
        }
        .into()
    }
}

/// Server-side implementation of an object
#[async_trait]
pub trait Servant: Send + Sync + 'static {
    /// Dispatch one operation. `params` is the opaque encoded argument blob.
    async fn dispatch(&self, current: &Current, params: Bytes) -> std::result::Result<Bytes, RpcError>;

    /// A servant with nothing to dispatch cannot be registered
    fn is_empty(&self) -> bool {
        false
    }
}

/// Handler for a single named operation
pub type OperationHandler =
    Arc<dyn Fn(Current, Bytes) -> BoxFuture<'static, std::result::Result<Bytes, RpcError>> + Send + Sync>;

/// Servant built from a table of operation handlers
pub struct OperationTable {
    operations: HashMap<String, OperationHandler>,
}

impl OperationTable {
    pub fn builder() -> OperationTableBuilder {
        OperationTableBuilder::default()
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}

#[async_trait]
impl Servant for OperationTable {
    async fn dispatch(&self, current: &Current, params: Bytes) -> std::result::Result<Bytes, RpcError> {
        match self.operations.get(&current.operation) {
            Some(handler) => handler(current.clone(), params).await,
            None => Err(current.operation_not_exist()),
        }
    }

    fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl std::fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.operations.keys().collect();
        names.sort();
        f.debug_struct("OperationTable").field("operations", &names).finish()
    }
}

#[derive(Default)]
pub struct OperationTableBuilder {
    operations: HashMap<String, OperationHandler>,
}

impl OperationTableBuilder {
    pub fn operation<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, RpcError>> + Send + 'static,
    {
        let handler: OperationHandler = Arc::new(move |current, params| Box::pin(handler(current, params)));
        self.operations.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> OperationTable {
        OperationTable {
            operations: self.operations,
        }
    }

    pub fn build_arc(self) -> Arc<dyn Servant> {
        Arc::new(self.build())
    }
}

/// Opaque value a locator passes from `locate` to `finished`
pub type Cookie = Option<Box<dyn Any + Send>>;

/// Creates servants on demand for a category
pub trait ServantLocator: Send + Sync {
    /// Find or create the servant for `current`. `Ok(None)` means no such
    /// object.
    fn locate(&self, current: &Current) -> std::result::Result<Option<(Arc<dyn Servant>, Cookie)>, RpcError>;

    /// Called after a located servant finished dispatching
    fn finished(&self, _current: &Current, _servant: &Arc<dyn Servant>, _cookie: Cookie) {}

    /// Called once when the owning adapter is destroyed
    fn deactivate(&self, category: &str);
}

pub type FacetMap = HashMap<String, Arc<dyn Servant>>;

#[derive(Default)]
struct Tables {
    servants: HashMap<Identity, FacetMap>,
    default_servants: HashMap<String, Arc<dyn Servant>>,
    locators: HashMap<String, Arc<dyn ServantLocator>>,
}

/// Identity/facet to servant registry of one adapter
pub struct ServantManager {
    adapter_name: String,
    tables: Mutex<Tables>,
}

fn servant_id(identity: &Identity, facet: &str) -> String {
    if facet.is_empty() {
        identity.to_string()
    } else {
        format!("{} -f {}", identity, facet)
    }
}

impl ServantManager {
    pub fn new(adapter_name: impl Into<String>) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn add_servant(&self, servant: Arc<dyn Servant>, identity: &Identity, facet: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let facets = tables.servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(LocalError::AlreadyRegistered {
                kind: "servant".into(),
                id: servant_id(identity, facet),
            });
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.default_servants.contains_key(category) {
            return Err(LocalError::AlreadyRegistered {
                kind: "default servant".into(),
                id: category.to_string(),
            });
        }
        tables.default_servants.insert(category.to_string(), servant);
        Ok(())
    }

    pub fn remove_servant(&self, identity: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        let mut tables = self.tables.lock();
        let not_registered = || LocalError::NotRegistered {
            kind: "servant".into(),
            id: servant_id(identity, facet),
        };
        let facets = tables.servants.get_mut(identity).ok_or_else(not_registered)?;
        let servant = facets.remove(facet).ok_or_else(not_registered)?;
        if facets.is_empty() {
            tables.servants.remove(identity);
        }
        Ok(servant)
    }

    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.tables
            .lock()
            .default_servants
            .remove(category)
            .ok_or_else(|| LocalError::NotRegistered {
                kind: "default servant".into(),
                id: category.to_string(),
            })
    }

    /// Remove every facet of `identity`, returning whatever was registered
    pub fn remove_all_facets(&self, identity: &Identity) -> FacetMap {
        self.tables.lock().servants.remove(identity).unwrap_or_default()
    }

    /// Servant for `identity`/`facet`, falling back to the default servant of
    /// the identity's category and then to the default servant for all
    /// categories. An identity with registered facets never falls back.
    pub fn find_servant(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let tables = self.tables.lock();
        match tables.servants.get(identity) {
            Some(facets) => facets.get(facet).cloned(),
            None => tables
                .default_servants
                .get(&identity.category)
                .or_else(|| tables.default_servants.get(""))
                .cloned(),
        }
    }

    pub fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        self.tables.lock().default_servants.get(category).cloned()
    }

    pub fn find_all_facets(&self, identity: &Identity) -> FacetMap {
        self.tables
            .lock()
            .servants
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_servant(&self, identity: &Identity) -> bool {
        self.tables
            .lock()
            .servants
            .get(identity)
            .map_or(false, |facets| !facets.is_empty())
    }

    pub fn add_servant_locator(&self, locator: Arc<dyn ServantLocator>, category: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.locators.contains_key(category) {
            return Err(LocalError::AlreadyRegistered {
                kind: "servant locator".into(),
                id: category.to_string(),
            });
        }
        tables.locators.insert(category.to_string(), locator);
        Ok(())
    }

    pub fn remove_servant_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>> {
        self.tables
            .lock()
            .locators
            .remove(category)
            .ok_or_else(|| LocalError::NotRegistered {
                kind: "servant locator".into(),
                id: category.to_string(),
            })
    }

    pub fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.tables.lock().locators.get(category).cloned()
    }

    /// Drop every servant and deactivate the servant locators
    pub fn destroy(&self) {
        let locators = {
            let mut tables = self.tables.lock();
            tables.servants.clear();
            tables.default_servants.clear();
            std::mem::take(&mut tables.locators)
        };
        for (category, locator) in locators {
            debug!(
                "deactivating servant locator for category `{}' of object adapter `{}'",
                category, self.adapter_name
            );
            locator.deactivate(&category);
        }
    }
}

impl std::fmt::Debug for ServantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("ServantManager")
            .field("adapter_name", &self.adapter_name)
            .field("servants", &tables.servants.len())
            .field("default_servants", &tables.default_servants.len())
            .field("locators", &tables.locators.len())
            .finish()
    }
}
