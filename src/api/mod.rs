//! API declarations.
//!
//! An API is a named set of RPC methods and events, declared as data:
//!
//! ```ignore
//! let auth = Api::builder("auth")
//!     .method("check_password", ["user", "password"], |kwargs: Kwargs| async move {
//!         Ok(json!(kwargs["user"] == "admin" && kwargs["password"] == "secret"))
//!     })
//!     .event("user_registered", ["username", "email"])
//!     .build()?;
//! ```
//!
//! `ApiSchema` alone describes an API served elsewhere, so callers can validate
//! parameters locally.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BusError, HandlerError, Result};
use crate::message::Kwargs;

/// Handler for one RPC method.
pub trait RpcHandler: Send + Sync {
    /// Execute the method with the caller's keyword parameters.
    fn call(&self, kwargs: Kwargs) -> BoxFuture<'static, std::result::Result<Value, HandlerError>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(Kwargs) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, kwargs: Kwargs) -> BoxFuture<'static, std::result::Result<Value, HandlerError>> {
        Box::pin(self(kwargs))
    }
}

/// Declared RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSchema {
    pub name: String,
    pub parameters: Vec<String>,
}

/// Declared event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    pub name: String,
    pub parameters: Vec<String>,
}

/// Methods and events of an API, without implementations.
///
/// Serialized as JSON when shared through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSchema {
    pub name: String,
    pub methods: Vec<MethodSchema>,
    pub events: Vec<EventSchema>,
}

impl ApiSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn method<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = S>,
    ) -> Self {
        self.methods.push(MethodSchema {
            name: name.into(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn event<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = S>,
    ) -> Self {
        self.events.push(EventSchema {
            name: name.into(),
            parameters: parameters.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn get_method(&self, name: &str) -> Option<&MethodSchema> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn get_event(&self, name: &str) -> Option<&EventSchema> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Check every name in the schema and reject duplicates.
    pub fn validate(&self) -> Result<()> {
        validate_api_name(&self.name)?;

        let mut seen = BTreeSet::new();
        for method in &self.methods {
            validate_name(&method.name)?;
            if !seen.insert(method.name.as_str()) {
                return Err(duplicate(&self.name, &method.name));
            }
            validate_parameters(&method.parameters)?;
        }

        let mut seen = BTreeSet::new();
        for event in &self.events {
            validate_name(&event.name)?;
            if !seen.insert(event.name.as_str()) {
                return Err(duplicate(&self.name, &event.name));
            }
            validate_parameters(&event.parameters)?;
        }
        Ok(())
    }

    /// Check call parameters against a declared method.
    pub fn check_call(&self, method: &str, kwargs: &Kwargs) -> Result<()> {
        let schema = self
            .get_method(method)
            .ok_or_else(|| BusError::MethodNotFound {
                api: self.name.clone(),
                method: method.to_string(),
            })?;
        check_parameters(
            format!("{}.{}", self.name, method),
            &schema.parameters,
            kwargs,
        )
    }

    /// Check event parameters against a declared event.
    pub fn check_event(&self, event: &str, kwargs: &Kwargs) -> Result<()> {
        let schema = self.get_event(event).ok_or_else(|| BusError::UnknownEvent {
            api: self.name.clone(),
            event: event.to_string(),
        })?;
        check_parameters(
            format!("{}.{}", self.name, event),
            &schema.parameters,
            kwargs,
        )
    }
}

fn duplicate(api: &str, name: &str) -> BusError {
    BusError::InvalidName {
        name: format!("{}.{}", api, name),
        reason: "declared more than once".to_string(),
    }
}

fn validate_parameters(parameters: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for parameter in parameters {
        validate_name(parameter)?;
        if !seen.insert(parameter.as_str()) {
            return Err(BusError::InvalidName {
                name: parameter.clone(),
                reason: "parameter listed more than once".to_string(),
            });
        }
    }
    Ok(())
}

/// An API served by this process: its schema plus one handler per method.
pub struct Api {
    schema: ApiSchema,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api").field("schema", &self.schema).finish()
    }
}

impl Api {
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            schema: ApiSchema::new(name),
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &ApiSchema {
        &self.schema
    }

    pub fn handler(&self, method: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(method).cloned()
    }
}

/// Builder for [`Api`].
pub struct ApiBuilder {
    schema: ApiSchema,
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl ApiBuilder {
    /// Declare a method and its implementation.
    pub fn method<S, H>(
        mut self,
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = S>,
        handler: H,
    ) -> Self
    where
        S: Into<String>,
        H: RpcHandler + 'static,
    {
        let name = name.into();
        self.schema = self.schema.method(name.clone(), parameters);
        // A repeated name is reported by build(); keep the first handler.
        self.handlers.entry(name).or_insert_with(|| Arc::new(handler));
        self
    }

    /// Declare an event this API publishes.
    pub fn event<S: Into<String>>(
        mut self,
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = S>,
    ) -> Self {
        self.schema = self.schema.event(name, parameters);
        self
    }

    pub fn build(self) -> Result<Api> {
        self.schema.validate()?;
        Ok(Api {
            schema: self.schema,
            handlers: self.handlers,
        })
    }
}

/// Validate a method, event or parameter name.
///
/// Names must be non-empty, must not start with `_` and may only contain
/// ASCII letters, digits, `_` and `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(BusError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.starts_with('_') {
        return invalid("must not start with an underscore");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return invalid("may only contain letters, digits, '_' and '-'");
    }
    Ok(())
}

/// Validate an API name: one or more valid names joined by `.`.
pub fn validate_api_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BusError::InvalidName {
            name: String::new(),
            reason: "must not be empty".to_string(),
        });
    }
    name.split('.').try_for_each(|segment| {
        validate_name(segment).map_err(|_| BusError::InvalidName {
            name: name.to_string(),
            reason: format!("segment '{}' is not a valid name", segment),
        })
    })
}

/// Check that the supplied keyword parameters are exactly the declared ones.
pub fn check_parameters(target: String, expected: &[String], kwargs: &Kwargs) -> Result<()> {
    let declared: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let supplied: BTreeSet<&str> = kwargs.keys().map(String::as_str).collect();
    if declared == supplied {
        Ok(())
    } else {
        let mut expected = expected.to_vec();
        expected.sort();
        Err(BusError::InvalidParameters {
            target,
            expected,
            actual: kwargs.keys().cloned().collect(),
        })
    }
}
