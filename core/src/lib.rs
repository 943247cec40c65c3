// Courier Core Library
// Client-side event dispatch and connection lifecycle runtime

pub mod channel;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod endpoint;
pub mod envelope;
pub mod event_loop;
pub mod event_type;
pub mod model;
pub mod registry;
pub mod subscription;
pub mod telemetry;
pub mod transport;

// Export core types
pub use channel::{ChannelAddress, ChannelParseError};
pub use config::RuntimeConfig;
pub use container::EndpointContainer;
pub use dispatcher::{
    CallbackResult, DispatchReport, DispatchStats, EventDispatcher, Identity, Listener,
    ListenerError,
};
pub use endpoint::Endpoint;
pub use envelope::{kinds, ConnectionId, EventEnvelope};
pub use event_loop::{EventLoop, LoopState, LoopStats};
pub use event_type::EventType;
pub use registry::ConnectionRegistry;
pub use subscription::{Module, SubscriptionCoordinator, SubscriptionScope};
pub use transport::{
    ConnectParams, Connection, Connector, EventSource, ModuleApi, Session, SourceError,
    TransportError,
};

use std::path::PathBuf;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("container is not initialized: certificate path is not set")]
    NotInitialized,

    #[error("certificate file does not exist: {0}")]
    CertsPathMissing(PathBuf),

    #[error("no connection with id {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("module {module} is not enabled on this connection (channel `{channel}`)")]
    ModuleUnavailable { module: Module, channel: String },

    #[error("cannot subscribe event channel `{channel}`: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Event source error: {0}")]
    EventSource(#[from] SourceError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, CourierError>;
