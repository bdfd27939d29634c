//! API registry.
//!
//! Tracks the APIs this process serves (schema plus handlers) and the APIs it
//! only calls or listens to (schema alone). Written during setup, read on
//! every call, publish and inbound request afterwards.
//!
//! Resolution order: local APIs, then declared schemas, then schemas shared
//! by other processes through the broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{Api, ApiSchema, RpcHandler};
use crate::error::{BusError, Result};

#[derive(Debug, Default)]
pub struct ApiRegistry {
    local: BTreeMap<String, Arc<Api>>,
    remote: HashMap<String, Arc<ApiSchema>>,
    shared: HashMap<String, Arc<ApiSchema>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API served by this process.
    pub fn register(&mut self, api: Api) -> Result<Arc<Api>> {
        if self.local.contains_key(api.name()) {
            return Err(BusError::DuplicateApi(api.name().to_string()));
        }
        let api = Arc::new(api);
        self.local.insert(api.name().to_string(), api.clone());
        debug!(
            api = %api.name(),
            methods = api.schema().methods.len(),
            events = api.schema().events.len(),
            "Registered local API"
        );
        Ok(api)
    }

    /// Declare the schema of an API served by other processes.
    ///
    /// Re-declaring replaces the previous schema. A locally served API keeps
    /// precedence during resolution.
    pub fn declare_remote(&mut self, schema: ApiSchema) -> Result<()> {
        schema.validate()?;
        debug!(api = %schema.name, "Declared remote API");
        self.remote.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Record a schema shared by another process.
    ///
    /// Returns whether the schema was new or changed.
    pub fn learn_shared(&mut self, schema: ApiSchema) -> bool {
        if self.local.contains_key(&schema.name) {
            return false;
        }
        if self.shared.get(&schema.name).is_some_and(|known| **known == schema) {
            return false;
        }
        if let Err(e) = schema.validate() {
            warn!(api = %schema.name, error = %e, "Ignoring invalid shared schema");
            return false;
        }
        debug!(api = %schema.name, "Learned shared API schema");
        self.shared.insert(schema.name.clone(), Arc::new(schema));
        true
    }

    /// Resolve the schema of any known API.
    pub fn resolve(&self, name: &str) -> Result<&ApiSchema> {
        self.try_resolve(name)
            .ok_or_else(|| BusError::ApiNotFound(name.to_string()))
    }

    pub fn try_resolve(&self, name: &str) -> Option<&ApiSchema> {
        self.local
            .get(name)
            .map(|api| api.schema())
            .or_else(|| self.remote.get(name).map(|schema| schema.as_ref()))
            .or_else(|| self.shared.get(name).map(|schema| schema.as_ref()))
    }

    /// A locally served API.
    pub fn local(&self, name: &str) -> Result<Arc<Api>> {
        self.local
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::ApiNotFound(name.to_string()))
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.local.contains_key(name)
    }

    /// Handler for a method of a locally served API.
    pub fn handler(&self, api: &str, method: &str) -> Result<Arc<dyn RpcHandler>> {
        self.local(api)?
            .handler(method)
            .ok_or_else(|| BusError::MethodNotFound {
                api: api.to_string(),
                method: method.to_string(),
            })
    }

    /// Names of locally served APIs, sorted.
    pub fn local_names(&self) -> Vec<String> {
        self.local.keys().cloned().collect()
    }

    pub fn local_schemas(&self) -> Vec<ApiSchema> {
        self.local.values().map(|api| api.schema().clone()).collect()
    }
}
