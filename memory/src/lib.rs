// In-process transport for the Courier runtime
//
// Sessions, module APIs and the shared event queue all live in memory.
// Remote subscription calls are recorded instead of sent anywhere.

pub mod connector;
pub mod module;
pub mod source;

pub use connector::{MemoryConnection, MemoryConnector};
pub use module::{RecordingModule, SubscriptionCall};
pub use source::MemoryEventSource;
