//! relay extension loading.
//!
//! Extensions are units of code loaded into their own sandbox, where they
//! declare services that every other participant can then call by name.
//!
//! - **[`source`]** -- [`ExtensionSource`] resolves a location to an
//!   [`ExtensionEntry`]; [`ExtensionCatalog`] is the in-memory source.
//! - **[`loader`]** -- [`ExtensionLoader`] runs inside a sandbox: allocate,
//!   load, register, report.
//! - **[`manager`]** -- [`ExtensionManager`] is the coordinator's `extensions`
//!   service: queues locations and hands them to workers.
//! - **[`host`]** -- [`SandboxHost`] starts sandboxes; [`InProcessHost`] does so
//!   on tokio tasks.
//! - **[`error`]** -- [`ExtensionError`] enumerates every failure mode.

pub mod error;
pub mod host;
pub mod loader;
pub mod manager;
pub mod source;

// Re-export the most commonly used types at the crate root.
pub use error::{ExtensionError, Result};
pub use host::{InProcessHost, SandboxHost};
pub use loader::{ExtensionLoader, LoaderState, Registrar};
pub use manager::{ExtensionManager, WorkerId};
pub use source::{EntryPoint, ExtensionCatalog, ExtensionEntry, ExtensionSource};
