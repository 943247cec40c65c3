use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier the transport assigns to one logical session.
pub type ConnectionId = i64;

/// Wire value meaning "not tied to a connection".
pub const NO_CONNECTION: ConnectionId = -1;

/// Reserved event kinds with loop-level meaning.
///
/// Everything else is an application event routed purely by
/// `(channel, kind)`.
pub mod kinds {
    /// A connection finished its handshake.
    pub const CONNECTED: &str = "libConnected";
    /// A connection was closed; the loop drops its registry entry after dispatch.
    pub const DISCONNECTED: &str = "libDisconnected";
    /// Disconnect of a transport the runtime manages internally. Never dispatched.
    pub const PLATFORM_DISCONNECTED: &str = "libPlatformDisconnected";
    /// Injected by `stop()` to release the pending wait.
    pub const BREAK: &str = "libBreak";
}

/// A single notification delivered by the event source.
///
/// Consumed exactly once by the event loop. `channel` is empty for
/// connection-scoped control events and `payload` is `Null` when the kind
/// carries no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(
        kind: impl Into<String>,
        channel: impl Into<String>,
        connection_id: Option<ConnectionId>,
        payload: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            channel: channel.into(),
            connection_id,
            payload,
        }
    }

    /// Control event that is not bound to any channel.
    pub fn control(kind: impl Into<String>, connection_id: Option<ConnectionId>) -> Self {
        Self::new(kind, String::new(), connection_id, Value::Null)
    }

    /// An untagged loop-break event. Honored by whichever run reads it.
    pub fn break_event() -> Self {
        Self::control(kinds::BREAK, None)
    }

    /// A loop-break event addressed to one run of the event loop.
    pub fn break_for(generation: u64) -> Self {
        Self {
            payload: serde_json::json!({ "generation": generation }),
            ..Self::break_event()
        }
    }

    /// Run a break event is addressed to, if it carries one.
    pub fn break_generation(&self) -> Option<u64> {
        if !self.is_kind(kinds::BREAK) {
            return None;
        }
        self.payload.get("generation").and_then(Value::as_u64)
    }

    /// Owning connection, with the `-1` sentinel folded into `None`.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.filter(|id| *id != NO_CONNECTION)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}
