//! Extension sources.
//!
//! An extension is identified by a *location* string.  Turning a location into
//! runnable code is the job of an [`ExtensionSource`]; the code itself is an
//! [`ExtensionEntry`], a synchronous entry point that declares services
//! through a [`Registrar`].
//!
//! [`ExtensionCatalog`] is the in-memory source: a map from location to entry
//! point, populated up front.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use relay_kernel::Fault;

use crate::error::{ExtensionError, Result};
use crate::loader::Registrar;

/// Code run once inside a sandbox to declare an extension's services.
pub type EntryPoint = Arc<dyn Fn(&Registrar) -> std::result::Result<(), Fault> + Send + Sync>;

/// Runnable extension code fetched from a location.
#[derive(Clone)]
pub struct ExtensionEntry {
    location: String,
    entry: EntryPoint,
}

impl fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl ExtensionEntry {
    pub fn new<F>(location: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&Registrar) -> std::result::Result<(), Fault> + Send + Sync + 'static,
    {
        Self {
            location: location.into(),
            entry: Arc::new(entry),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run the entry point.  A panic is reported as a fault.
    pub fn run(&self, registrar: &Registrar) -> std::result::Result<(), Fault> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.entry)(registrar))) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Fault::named("Panic", panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "extension entry point panicked".to_owned())
}

/// Resolves extension locations to runnable code.
#[async_trait]
pub trait ExtensionSource: Send + Sync {
    /// Fetch the extension at `location`.
    async fn fetch(&self, location: &str) -> Result<ExtensionEntry>;
}

/// In-memory [`ExtensionSource`].
#[derive(Clone, Default)]
pub struct ExtensionCatalog {
    entries: HashMap<String, ExtensionEntry>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the extension at `location`.
    pub fn with_extension<F>(mut self, location: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&Registrar) -> std::result::Result<(), Fault> + Send + Sync + 'static,
    {
        let entry = ExtensionEntry::new(location, entry);
        self.entries.insert(entry.location.clone(), entry);
        self
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries.contains_key(location)
    }

    /// Known locations, sorted.
    pub fn locations(&self) -> Vec<&str> {
        let mut locations: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        locations.sort_unstable();
        locations
    }
}

#[async_trait]
impl ExtensionSource for ExtensionCatalog {
    async fn fetch(&self, location: &str) -> Result<ExtensionEntry> {
        self.entries
            .get(location)
            .cloned()
            .ok_or_else(|| ExtensionError::UnknownLocation {
                location: location.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ExtensionCatalog {
        ExtensionCatalog::new()
            .with_extension("demo/empty", |_| Ok(()))
            .with_extension("demo/broken", |_| Err(Fault::message("cannot start")))
            .with_extension("demo/panics", |_| panic!("entry point exploded"))
    }

    #[tokio::test]
    async fn fetch_known_location() {
        let entry = catalog().fetch("demo/empty").await.expect("fetch");
        assert_eq!(entry.location(), "demo/empty");
    }

    #[tokio::test]
    async fn fetch_unknown_location_fails() {
        let err = catalog().fetch("demo/missing").await.unwrap_err();
        assert!(matches!(err, ExtensionError::UnknownLocation { ref location } if location == "demo/missing"));
    }

    #[test]
    fn locations_are_sorted() {
        let catalog = catalog();
        assert_eq!(catalog.locations(), vec!["demo/broken", "demo/empty", "demo/panics"]);
        assert!(catalog.contains("demo/broken"));
        assert!(!catalog.contains("demo/other"));
    }
}
