// Application-facing entry point owning connections and the event loop
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::endpoint::Endpoint;
use crate::envelope::ConnectionId;
use crate::event_loop::{EventLoop, LoopState, LoopStats};
use crate::registry::ConnectionRegistry;
use crate::subscription::Module;
use crate::telemetry;
use crate::transport::{ConnectParams, Connector, EventSource};
use crate::{CourierError, Result};

/// Owns the connector, the connection registry and the event loop.
///
/// Every operation except [`EndpointContainer::set_certs_path`] and the
/// listening controls requires the certificate path to have been set.
pub struct EndpointContainer {
    config: RuntimeConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    event_loop: EventLoop,
    initialized: AtomicBool,
}

impl EndpointContainer {
    /// Builds a container. When `config.certs_path` is set it is applied
    /// right away.
    pub fn new(
        config: RuntimeConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn EventSource>,
    ) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let event_loop = EventLoop::new(
            source,
            Arc::clone(&registry),
            config.wait_retry_backoff(),
        );
        let container = Self {
            config,
            connector,
            registry,
            event_loop,
            initialized: AtomicBool::new(false),
        };
        if let Some(path) = container.config.certs_path.clone() {
            container.set_certs_path(&path)?;
        }
        Ok(container)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Installs the global tracing subscriber with the configured
    /// `log_filter`. Returns `false` when one is already installed.
    pub fn init_tracing(&self) -> bool {
        telemetry::init_tracing(&self.config.log_filter)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Installs the certificate bundle. The file must exist.
    pub fn set_certs_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CourierError::CertsPathMissing(path.to_path_buf()));
        }
        self.connector.set_certs_path(path)?;
        self.initialized.store(true, Ordering::Release);
        info!(target: "container", path = %path.display(), "Certificate path set");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CourierError::NotInitialized)
        }
    }

    /// Opens a session with the given modules enabled and registers it.
    pub async fn connect(
        &self,
        modules: &HashSet<Module>,
        params: &ConnectParams,
    ) -> Result<Arc<Endpoint>> {
        self.ensure_initialized()?;
        let session = self.connector.connect(params, modules).await?;
        let endpoint = Arc::new(Endpoint::new(session));
        let id = endpoint.connection_id();

        if let Some(previous) = self.registry.add(Arc::clone(&endpoint)) {
            warn!(target: "container", connection_id = id, "Replacing existing connection with the same id");
            let _ = previous.close().await;
        }
        info!(target: "container", connection_id = id, modules = modules.len(), "Connected");
        Ok(endpoint)
    }

    pub fn endpoint(&self, id: ConnectionId) -> Result<Option<Arc<Endpoint>>> {
        self.ensure_initialized()?;
        Ok(self.registry.get(id))
    }

    pub fn endpoint_ids(&self) -> Result<Vec<ConnectionId>> {
        self.ensure_initialized()?;
        Ok(self.registry.ids())
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.ensure_initialized()?;
        if !self.registry.remove_and_close(id).await {
            return Err(CourierError::ConnectionNotFound(id));
        }
        info!(target: "container", connection_id = id, "Disconnected");
        Ok(())
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.registry.remove_and_close_all().await;
        Ok(())
    }

    /// Starts the event loop. Must be called from within a tokio runtime.
    pub fn start_listening(&self) {
        self.event_loop.start();
    }

    pub fn stop_listening(&self) -> Result<()> {
        self.event_loop.stop()?;
        Ok(())
    }

    pub fn listening_state(&self) -> LoopState {
        self.event_loop.state()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.event_loop.stats()
    }

    /// Stops the loop and closes every connection.
    pub async fn shutdown(&self) {
        if let Err(err) = self.event_loop.stop() {
            warn!(target: "container", error = %err, "Could not stop event loop");
        }
        self.registry.remove_and_close_all().await;
        info!(target: "container", "Container shut down");
    }
}

impl std::fmt::Debug for EndpointContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointContainer")
            .field("initialized", &self.is_initialized())
            .field("connections", &self.registry.len())
            .field("state", &self.listening_state())
            .finish()
    }
}
