//! Process wiring: one coordinator, its extension manager, and an in-process
//! sandbox host serving the demo catalog.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_extensions::{ExtensionManager, InProcessHost};
use relay_kernel::{Coordinator, Dispatcher, LocalChannel, Sandbox};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::demos;

pub struct Relay {
    pub coordinator: Coordinator,
    pub manager: ExtensionManager,
    pub host: Arc<InProcessHost>,
}

impl Relay {
    /// Start a coordinator and load `config.extensions` one after another,
    /// so worker ids follow configuration order.
    ///
    /// Extensions that fail to load are logged and skipped.
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        let coordinator = Coordinator::new(config.dispatch.clone());
        let host = Arc::new(InProcessHost::new(Arc::new(demos::catalog())));
        let manager = ExtensionManager::install(&coordinator, host.clone())
            .context("failed to install the extension manager")?;

        for location in &config.extensions {
            match manager.load_extension(location).await {
                Ok(()) => info!(location = %location, "extension ready"),
                Err(err) => warn!(location = %location, error = %err, "failed to load extension, skipping"),
            }
        }

        Ok(Self {
            coordinator,
            manager,
            host,
        })
    }

    /// Attach a fresh sandbox with no services of its own, for making calls
    /// the way any other participant would.
    pub async fn client(&self) -> Sandbox {
        let config = self.coordinator.config().clone();
        let (coordinator_side, sandbox_side) = LocalChannel::pair(&config);
        self.coordinator
            .attach(coordinator_side.channel, coordinator_side.inbox);
        let client = Sandbox::new(sandbox_side.channel, config);
        client.connect(sandbox_side.inbox);
        client.wait_for_connection().await;
        client
    }

    /// Call `service.method` from a client sandbox.
    pub async fn call(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        let client = self.client().await;
        client
            .call(service, method, args)
            .await
            .with_context(|| format!("call to {service}.{method} failed"))
    }

    /// Terminate every sandbox; failures are logged.
    pub async fn shutdown(&self) {
        for (peer, result) in self.coordinator.terminate_all().await {
            if let Err(err) = result {
                warn!(peer = %peer, error = %err, "sandbox did not terminate cleanly");
            }
        }
        info!("all sandboxes terminated");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(extensions: &[&str]) -> RelayConfig {
        RelayConfig {
            extensions: extensions.iter().map(|s| (*s).to_owned()).collect(),
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn demo_services_are_named_in_load_order() {
        let relay = Relay::start(&config(&[demos::ARITHMETIC, demos::GREETER]))
            .await
            .unwrap();

        let mut services = relay.manager.loaded_services();
        services.sort();
        assert_eq!(services, vec!["extension.0.0", "extension.1.0", "extension.1.1"]);

        assert_eq!(
            relay.call("extension.0.0", "add", vec![json!(2), json!(3)]).await.unwrap(),
            json!(5.0)
        );
        let greeting = relay
            .call("extension.1.0", "greet", vec![json!("Ada")])
            .await
            .unwrap();
        assert_eq!(greeting, json!("Hello, Ada!"));

        relay.shutdown().await;
        assert_eq!(relay.coordinator.sandbox_count(), 0);
    }

    #[tokio::test]
    async fn broken_demo_is_skipped() {
        let relay = Relay::start(&config(&[demos::BROKEN, demos::ARITHMETIC]))
            .await
            .unwrap();
        assert!(!relay.manager.is_extension_loaded(demos::BROKEN));
        assert!(relay.manager.is_extension_loaded(demos::ARITHMETIC));
        assert_eq!(relay.manager.loaded_services(), vec!["extension.1.0"]);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn calling_an_unknown_service_fails_with_its_name() {
        let relay = Relay::start(&config(&[])).await.unwrap();
        let err = relay.call("nowhere", "m", vec![]).await.unwrap_err();
        assert!(format!("{err:#}").contains("nowhere"));
    }
}
