//! Service providers.
//!
//! A [`ServiceProvider`] is an explicit capability table: a map from method
//! name to handler.  Tables are validated when they are built, so invoking a
//! method that was never declared yields [`DispatchError::MethodNotFound`]
//! instead of a runtime surprise.
//!
//! # Example
//!
//! ```rust
//! # use relay_kernel::provider::ServiceProvider;
//! # use serde_json::json;
//! let provider = ServiceProvider::builder()
//!     .method("returnFortyTwo", |_| Ok(json!(42)))
//!     .method("doubleArgument", |inv| {
//!         let n: i64 = inv.arg_as(0)?;
//!         Ok(json!(n * 2))
//!     })
//!     .build()
//!     .unwrap();
//! assert!(provider.has_method("doubleArgument"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channel::TransferList;
use crate::error::{DispatchError, Fault, Result};

/// What a provider method returns: a value, or a fault for the caller.
pub type MethodResult = std::result::Result<Value, Fault>;

/// A single operation in a capability table.
pub type MethodHandler = Arc<dyn Fn(Invocation) -> MethodResult + Send + Sync>;

/// Arguments of one method invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<Value>,
    /// Buffers moved to this invocation by the caller.
    pub transfer: TransferList,
}

impl Invocation {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            transfer: TransferList::new(),
        }
    }

    /// Borrow the positional argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Deserialize the positional argument at `index`; a missing argument is
    /// read as `null`.
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, Fault> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            Fault::named(
                "InvalidArgument",
                format!("{}: argument {index}: {e}", self.method),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceProvider
// ---------------------------------------------------------------------------

/// Validated capability table for one service.
#[derive(Clone)]
pub struct ServiceProvider {
    methods: HashMap<String, MethodHandler>,
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("methods", &self.method_names())
            .finish()
    }
}

impl ServiceProvider {
    /// Start declaring a capability table.
    pub fn builder() -> ProviderBuilder {
        ProviderBuilder::default()
    }

    /// Names of all declared methods, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Invoke a method synchronously.
    ///
    /// A handler that returns a fault, or panics, yields
    /// [`DispatchError::Remote`]; nothing escapes as a panic.
    pub fn invoke(&self, service: &str, invocation: Invocation) -> Result<Value> {
        let handler = self.methods.get(&invocation.method).ok_or_else(|| {
            DispatchError::MethodNotFound {
                service: service.to_owned(),
                method: invocation.method.clone(),
            }
        })?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => Err(DispatchError::Remote(fault)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(service = %service, panic = %message, "provider method panicked");
                Err(DispatchError::Remote(Fault::message(message)))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "provider method panicked".to_owned()
    }
}

/// Builder for [`ServiceProvider`].
#[derive(Default)]
pub struct ProviderBuilder {
    methods: Vec<(String, MethodHandler)>,
}

impl ProviderBuilder {
    /// Declare a method.
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Invocation) -> MethodResult + Send + Sync + 'static,
    {
        self.methods.push((name.into(), Arc::new(handler)));
        self
    }

    /// Validate and freeze the table.
    ///
    /// Rejects tables with no methods, empty method names, or the same name
    /// declared twice.
    pub fn build(self) -> Result<ServiceProvider> {
        let invalid = |reason: String| DispatchError::InvalidProvider {
            service: String::new(),
            reason,
        };

        if self.methods.is_empty() {
            return Err(invalid("provider declares no methods".into()));
        }

        let mut methods = HashMap::with_capacity(self.methods.len());
        for (name, handler) in self.methods {
            if name.is_empty() {
                return Err(invalid("method name must not be empty".into()));
            }
            if methods.insert(name.clone(), handler).is_some() {
                return Err(invalid(format!("method `{name}` declared twice")));
            }
        }

        Ok(ServiceProvider { methods })
    }
}

/// Reject empty service names before they reach a registry.
pub(crate) fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DispatchError::InvalidProvider {
            service: String::new(),
            reason: "service name must not be empty".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
