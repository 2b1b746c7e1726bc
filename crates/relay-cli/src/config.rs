//! Runtime configuration.
//!
//! Read from a TOML file (`config/relay.toml` by default):
//!
//! ```toml
//! log_level = "info"
//! json_logs = false
//! extensions = ["demo/arithmetic", "demo/greeter"]
//!
//! [dispatch]
//! max_frame_bytes = 16777216
//! warn_on_replace = true
//! ```
//!
//! Every key is optional; missing keys take their defaults.

use std::path::Path;

use anyhow::{Context, Result};
use relay_kernel::DispatchConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Default tracing filter; `RUST_LOG` overrides it.
    pub log_level: String,
    /// Emit logs as JSON lines instead of the compact format.
    pub json_logs: bool,
    /// Extension locations loaded at startup, in order.
    pub extensions: Vec<String>,
    pub dispatch: DispatchConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
            extensions: vec!["demo/arithmetic".into(), "demo/greeter".into()],
            dispatch: DispatchConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load `path`, falling back to defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_existing(path)
    }

    /// Load `path`, which must exist.
    pub fn load_existing(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse TOML")?;
        anyhow::ensure!(
            config.dispatch.max_frame_bytes > 0,
            "dispatch.max_frame_bytes must be positive"
        );
        Ok(config)
    }
}
