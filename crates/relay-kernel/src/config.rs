//! Dispatch configuration.
//!
//! [`DispatchConfig`] holds the knobs shared by coordinators, sandboxes and
//! the in-process channel.  Defaults come from the [`Default`]
//! implementation; a builder-style API customises individual fields.

use serde::{Deserialize, Serialize};

/// Tunables for a dispatch participant and its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Largest encoded frame a [`LocalChannel`](crate::channel::LocalChannel)
    /// will accept, in bytes.
    ///
    /// Default: **16 MiB**.
    pub max_frame_bytes: usize,

    /// Log a warning (rather than a debug line) when a service registration
    /// replaces an existing provider or directory entry.
    ///
    /// Default: **true**.
    pub warn_on_replace: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            warn_on_replace: true,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum encoded frame size (in bytes).
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    /// Choose whether replacements are logged at warn level.
    pub fn with_warn_on_replace(mut self, warn: bool) -> Self {
        self.warn_on_replace = warn;
        self
    }

    pub(crate) fn log_replacement(&self, what: &str, name: &str) {
        if self.warn_on_replace {
            tracing::warn!(service = %name, "{what} replacing existing provider");
        } else {
            tracing::debug!(service = %name, "{what} replacing existing provider");
        }
    }
}
