// One connection: its session, module APIs and listener table
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatcher::{CallbackResult, DispatchReport, EventDispatcher, Identity, Listener};
use crate::envelope::{ConnectionId, EventEnvelope};
use crate::event_type::EventType;
use crate::subscription::{Module, SubscriptionCoordinator};
use crate::transport::{Connection, ModuleApi, Session};
use crate::Result;

/// Connection entry held by the [`crate::ConnectionRegistry`].
///
/// Application threads register listeners here; the event loop feeds it
/// envelopes through [`Endpoint::handle_event`].
pub struct Endpoint {
    connection: Arc<dyn Connection>,
    coordinator: SubscriptionCoordinator,
    closed: AtomicBool,
}

impl Endpoint {
    pub fn new(session: Session) -> Self {
        let id = session.connection.connection_id();
        Self {
            connection: session.connection,
            coordinator: SubscriptionCoordinator::new(id, session.modules),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn module(&self, module: Module) -> Option<Arc<dyn ModuleApi>> {
        self.coordinator.module(module)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        self.coordinator.dispatcher()
    }

    /// Registers a typed callback for `event`.
    ///
    /// Fails when the channel's remote subscription cannot be opened, or with
    /// [`crate::CourierError::ConnectionClosed`] once the entry is closed; in
    /// either case nothing stays registered.
    pub async fn register_listener<T, F>(
        &self,
        identity: Identity,
        event: &EventType<T>,
        callback: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> CallbackResult + Send + Sync + 'static,
    {
        self.coordinator
            .register(identity, event.channel(), event.kind(), Listener::typed(callback))
            .await
    }

    /// Registers a callback on an arbitrary `(channel, kind)` that receives
    /// the raw payload.
    pub async fn register_raw<F>(
        &self,
        identity: Identity,
        channel: &str,
        kind: &str,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        self.coordinator
            .register(identity, channel, kind, Listener::raw(callback))
            .await
    }

    pub async fn unregister_listener<T>(&self, identity: Identity, event: &EventType<T>) {
        self.coordinator
            .unregister(identity, event.channel(), event.kind())
            .await
    }

    /// Drops every callback registered with `identity`.
    pub async fn unregister_listeners(&self, identity: Identity) {
        self.coordinator.unregister_all(identity).await
    }

    pub async fn unregister_all_listeners(&self) {
        self.coordinator.unregister_everything().await
    }

    /// Emits an envelope to the matching listeners. Called by the event loop.
    pub fn handle_event(&self, envelope: &EventEnvelope) -> DispatchReport {
        self.coordinator.dispatcher().dispatch(envelope)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases module APIs, then the session. Listeners are dropped locally
    /// without remote unsubscribe calls. Idempotent; returns the first error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let id = self.connection_id();
        let dropped = self.coordinator.close().await;
        debug!(target: "registry", connection_id = id, channels = dropped.len(), "Dropped listeners");

        let mut modules = self.coordinator.modules();
        modules.sort_by_key(|api| api.module());

        let mut first_err = None;
        for api in modules {
            if let Err(err) = api.close().await {
                warn!(target: "registry", connection_id = id, module = %api.module(), error = %err, "Module close failed");
                first_err = first_err.or(Some(err));
            }
        }
        if let Err(err) = self.connection.close().await {
            warn!(target: "registry", connection_id = id, error = %err, "Connection close failed");
            first_err = first_err.or(Some(err));
        }

        info!(target: "registry", connection_id = id, "Connection closed");
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
