// Collaborator interfaces implemented by the transport layer
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{ConnectionId, EventEnvelope};
use crate::subscription::{Module, SubscriptionScope};

/// Error raised by a transport operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("certificate error: {0}")]
    Certificate(String),
}

/// Error raised while waiting on the shared event source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No more events will ever arrive; waiting again is pointless.
    #[error("event source invalidated")]
    Invalidated,

    #[error("event source failure: {0}")]
    Transient(String),
}

/// The process-wide queue every connection's events arrive on.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Resolves with the next envelope. Has no timeout.
    async fn wait_event(&self) -> Result<EventEnvelope, SourceError>;

    /// Injects a [`crate::envelope::kinds::BREAK`] envelope so a pending
    /// wait returns. The envelope must carry `generation`, as built by
    /// [`EventEnvelope::break_for`].
    fn emit_break(&self, generation: u64) -> Result<(), SourceError>;
}

/// Remote subscription calls and lifecycle of one module on one connection.
#[async_trait]
pub trait ModuleApi: Send + Sync {
    fn module(&self) -> Module;

    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<(), TransportError>;

    async fn unsubscribe(&self, scope: &SubscriptionScope) -> Result<(), TransportError>;

    /// Releases the module's native resources.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An established session.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Credentials and address for a new session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_private_key: String,
    pub solution_id: String,
    pub bridge_url: String,
}

impl ConnectParams {
    pub fn new(
        user_private_key: impl Into<String>,
        solution_id: impl Into<String>,
        bridge_url: impl Into<String>,
    ) -> Self {
        Self {
            user_private_key: user_private_key.into(),
            solution_id: solution_id.into(),
            bridge_url: bridge_url.into(),
        }
    }
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("user_private_key", &"<redacted>")
            .field("solution_id", &self.solution_id)
            .field("bridge_url", &self.bridge_url)
            .finish()
    }
}

/// What a successful connect hands back: the session and one API per
/// enabled module.
pub struct Session {
    pub connection: Arc<dyn Connection>,
    pub modules: Vec<Arc<dyn ModuleApi>>,
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Installs the certificate bundle used for every later connect.
    fn set_certs_path(&self, path: &Path) -> Result<(), TransportError>;

    async fn connect(
        &self,
        params: &ConnectParams,
        modules: &HashSet<Module>,
    ) -> Result<Session, TransportError>;
}
