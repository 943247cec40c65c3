// Remote subscription reference counting
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::ChannelAddress;
use crate::dispatcher::{EventDispatcher, Identity, Listener};
use crate::envelope::ConnectionId;
use crate::transport::ModuleApi;
use crate::{CourierError, Result};

/// Backend modules that stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Thread,
    Store,
    Inbox,
    Kvdb,
}

impl Module {
    pub const ALL: [Module; 4] = [Module::Thread, Module::Store, Module::Inbox, Module::Kvdb];

    pub fn as_str(self) -> &'static str {
        match self {
            Module::Thread => "thread",
            Module::Store => "store",
            Module::Inbox => "inbox",
            Module::Kvdb => "kvdb",
        }
    }

    /// Module named by a channel's first segment.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a remote subscribe/unsubscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// Events about the module's containers (created, updated, deleted...).
    Module,
    /// Events about one container's items, e.g. a thread's messages.
    Instance { instance_id: String, subtype: String },
}

impl SubscriptionScope {
    pub fn for_address(address: &ChannelAddress) -> Self {
        match (&address.instance_id, &address.subtype) {
            (Some(instance_id), Some(subtype)) => SubscriptionScope::Instance {
                instance_id: instance_id.clone(),
                subtype: subtype.clone(),
            },
            _ => SubscriptionScope::Module,
        }
    }
}

/// Where a channel's remote calls go, if anywhere.
enum Target {
    Remote {
        api: Arc<dyn ModuleApi>,
        scope: SubscriptionScope,
    },
    Skip,
}

/// Wraps a connection's [`EventDispatcher`] and keeps the remote side
/// streaming exactly the channels that have at least one listener.
///
/// Every operation runs under one async gate, so the remote subscribe and
/// unsubscribe calls for a channel are issued in the order the local table
/// changed. Dispatch reads the table directly and never waits on the gate.
pub struct SubscriptionCoordinator {
    connection_id: ConnectionId,
    dispatcher: EventDispatcher,
    modules: HashMap<Module, Arc<dyn ModuleApi>>,
    closed: AtomicBool,
    gate: Mutex<()>,
}

impl SubscriptionCoordinator {
    pub fn new(
        connection_id: ConnectionId,
        modules: impl IntoIterator<Item = Arc<dyn ModuleApi>>,
    ) -> Self {
        Self {
            connection_id,
            dispatcher: EventDispatcher::new(),
            modules: modules.into_iter().map(|api| (api.module(), api)).collect(),
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects every later registration and drops all listeners locally,
    /// without remote unsubscribe calls. Returns the channels that had
    /// listeners.
    pub async fn close(&self) -> Vec<String> {
        let _gate = self.gate.lock().await;
        self.closed.store(true, Ordering::Release);
        self.dispatcher.unregister_everything()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn module(&self, module: Module) -> Option<Arc<dyn ModuleApi>> {
        self.modules.get(&module).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<dyn ModuleApi>> {
        self.modules.values().cloned().collect()
    }

    /// Adds a listener and, if it is the channel's first, subscribes remotely.
    ///
    /// A failed remote subscribe removes the listener again and is returned
    /// to the caller. A channel that cannot be mapped to a remote call is
    /// logged and the listener is kept. Fails with
    /// [`CourierError::ConnectionClosed`] once [`Self::close`] has run.
    pub async fn register(
        &self,
        identity: Identity,
        channel: &str,
        kind: &str,
        listener: Listener,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.is_closed() {
            return Err(CourierError::ConnectionClosed(self.connection_id));
        }
        let (needs_subscribe, seq) = self.dispatcher.insert(identity, channel, kind, listener);
        if !needs_subscribe {
            return Ok(());
        }

        let outcome = match self.resolve(channel) {
            Ok(Target::Remote { api, scope }) => api
                .subscribe(&scope)
                .await
                .map(|()| info!(target: "subscription", channel, "Subscribed channel"))
                .map_err(|source| CourierError::Subscribe {
                    channel: channel.to_string(),
                    source,
                }),
            Ok(Target::Skip) => Ok(()),
            Err(err) => Err(err),
        };

        if outcome.is_err() {
            self.dispatcher.remove_registration(channel, kind, seq);
        }
        outcome
    }

    /// Removes `identity`'s listeners for one `(channel, kind)`.
    pub async fn unregister(&self, identity: Identity, channel: &str, kind: &str) {
        let _gate = self.gate.lock().await;
        if self.dispatcher.unregister(identity, channel, kind) {
            self.unsubscribe_channel(channel).await;
        }
    }

    /// Removes every listener of `identity` on this connection.
    pub async fn unregister_all(&self, identity: Identity) {
        let _gate = self.gate.lock().await;
        for channel in self.dispatcher.unregister_all(identity) {
            self.unsubscribe_channel(&channel).await;
        }
    }

    /// Removes every listener on this connection.
    pub async fn unregister_everything(&self) {
        let _gate = self.gate.lock().await;
        for channel in self.dispatcher.unregister_everything() {
            self.unsubscribe_channel(&channel).await;
        }
    }

    // Best effort: the listener is already gone locally.
    async fn unsubscribe_channel(&self, channel: &str) {
        match self.resolve(channel) {
            Ok(Target::Remote { api, scope }) => match api.unsubscribe(&scope).await {
                Ok(()) => info!(target: "subscription", channel, "Unsubscribed channel"),
                Err(err) => {
                    warn!(target: "subscription", channel, error = %err, "Cannot unsubscribe channel")
                }
            },
            Ok(Target::Skip) => {}
            Err(err) => warn!(target: "subscription", channel, error = %err, "Cannot unsubscribe channel"),
        }
    }

    fn resolve(&self, channel: &str) -> Result<Target> {
        if channel.is_empty() {
            debug!(target: "subscription", "Connection-scoped channel needs no remote subscription");
            return Ok(Target::Skip);
        }

        let address = match ChannelAddress::parse(channel) {
            Ok(address) => address,
            Err(err) => {
                warn!(target: "subscription", channel, error = %err, "Malformed events channel");
                return Ok(Target::Skip);
            }
        };

        let Some(module) = Module::from_name(&address.module) else {
            warn!(target: "subscription", channel, module = %address.module, "No remote subscription for unknown module");
            return Ok(Target::Skip);
        };

        let api = self
            .module(module)
            .ok_or_else(|| CourierError::ModuleUnavailable {
                module,
                channel: channel.to_string(),
            })?;

        Ok(Target::Remote {
            api,
            scope: SubscriptionScope::for_address(&address),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    mock! {
        pub ModuleApiImpl {}

        #[async_trait]
        impl ModuleApi for ModuleApiImpl {
            fn module(&self) -> Module;
            async fn subscribe(&self, scope: &SubscriptionScope) -> std::result::Result<(), TransportError>;
            async fn unsubscribe(&self, scope: &SubscriptionScope) -> std::result::Result<(), TransportError>;
            async fn close(&self) -> std::result::Result<(), TransportError>;
        }
    }

    fn module_mock(module: Module) -> MockModuleApiImpl {
        let mut api = MockModuleApiImpl::new();
        api.expect_module().return_const(module);
        api
    }

    fn coordinator(api: MockModuleApiImpl) -> SubscriptionCoordinator {
        SubscriptionCoordinator::new(1, [Arc::new(api) as Arc<dyn ModuleApi>])
    }

    fn instance(id: &str, subtype: &str) -> SubscriptionScope {
        SubscriptionScope::Instance {
            instance_id: id.into(),
            subtype: subtype.into(),
        }
    }

    fn noop() -> Listener {
        Listener::raw(|_| Ok(()))
    }

    #[tokio::test]
    async fn second_listener_on_channel_does_not_resubscribe() {
        let mut api = module_mock(Module::Store);
        api.expect_subscribe()
            .with(eq(SubscriptionScope::Module))
            .times(1)
            .returning(|_| Ok(()));
        let coord = coordinator(api);
        let id = Identity::new();

        coord.register(id, "store", "storeCreated", noop()).await.unwrap();
        coord.register(id, "store", "storeDeleted", noop()).await.unwrap();
        coord.register(Identity::new(), "store", "storeCreated", noop()).await.unwrap();
        assert_eq!(coord.dispatcher().listener_count(), 3);
    }

    #[tokio::test]
    async fn failed_subscribe_is_surfaced_and_rolled_back() {
        let mut api = module_mock(Module::Thread);
        let mut seq = mockall::Sequence::new();
        api.expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TransportError::Request("bridge unavailable".into())));
        api.expect_subscribe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let coord = coordinator(api);
        let id = Identity::new();

        let err = coord
            .register(id, "thread", "threadCreated", noop())
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Subscribe { ref channel, .. } if channel == "thread"));
        assert_eq!(coord.dispatcher().listener_count(), 0);

        // The channel is empty again, so the retry subscribes again.
        coord.register(id, "thread", "threadCreated", noop()).await.unwrap();
        assert!(coord.dispatcher().has_listeners("thread"));
    }

    #[tokio::test]
    async fn malformed_channel_keeps_local_state_without_remote_call() {
        let api = module_mock(Module::Thread);
        let coord = coordinator(api);
        let id = Identity::new();

        coord.register(id, "thread/123", "odd", noop()).await.unwrap();
        assert!(coord.dispatcher().has_listeners("thread/123"));

        coord.unregister_all(id).await;
        assert!(!coord.dispatcher().has_listeners("thread/123"));
    }

    #[tokio::test]
    async fn disabled_module_is_reported() {
        let api = module_mock(Module::Thread);
        let coord = coordinator(api);

        let err = coord
            .register(Identity::new(), "kvdb", "kvdbCreated", noop())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CourierError::ModuleUnavailable { module: Module::Kvdb, .. }
        ));
        assert_eq!(coord.dispatcher().listener_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_failure_is_not_surfaced() {
        let mut api = module_mock(Module::Inbox);
        api.expect_subscribe().times(1).returning(|_| Ok(()));
        api.expect_unsubscribe()
            .with(eq(instance("i1", "entries")))
            .times(1)
            .returning(|_| Err(TransportError::Request("timeout".into())));
        let coord = coordinator(api);
        let id = Identity::new();

        coord
            .register(id, "inbox/i1/entries", "inboxEntryCreated", noop())
            .await
            .unwrap();
        coord
            .unregister(id, "inbox/i1/entries", "inboxEntryCreated")
            .await;
        assert_eq!(coord.dispatcher().listener_count(), 0);
    }

    #[tokio::test]
    async fn unregister_everything_unsubscribes_each_channel() {
        let mut api = module_mock(Module::Kvdb);
        api.expect_subscribe().times(2).returning(|_| Ok(()));
        api.expect_unsubscribe()
            .with(eq(SubscriptionScope::Module))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_unsubscribe()
            .with(eq(instance("k1", "entries")))
            .times(1)
            .returning(|_| Ok(()));
        let coord = coordinator(api);

        coord.register(Identity::new(), "kvdb", "kvdbCreated", noop()).await.unwrap();
        coord
            .register(Identity::new(), "kvdb/k1/entries", "kvdbNewEntry", noop())
            .await
            .unwrap();
        coord.unregister_everything().await;
        assert!(coord.dispatcher().channels().is_empty());
    }

    #[tokio::test]
    async fn two_listeners_one_identity_removed() {
        let mut api = module_mock(Module::Thread);
        api.expect_subscribe()
            .with(eq(SubscriptionScope::Module))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_subscribe()
            .with(eq(instance("123", "messages")))
            .times(1)
            .returning(|_| Ok(()));
        api.expect_unsubscribe()
            .with(eq(instance("123", "messages")))
            .times(1)
            .returning(|_| Ok(()));
        let coord = coordinator(api);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, b) = (Identity::new(), Identity::new());
        let seen_a = Arc::clone(&seen);
        coord
            .register(
                a,
                "thread/123/messages",
                "newMessage",
                Listener::raw(move |p| {
                    seen_a.lock().unwrap().push(format!("A:{p}"));
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let seen_b = Arc::clone(&seen);
        coord
            .register(
                b,
                "thread",
                "threadCreated",
                Listener::raw(move |_| {
                    seen_b.lock().unwrap().push("B".to_string());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let msg = EventEnvelope::new("newMessage", "thread/123/messages", Some(7), json!("P"));
        coord.dispatcher().dispatch(&msg);
        assert_eq!(*seen.lock().unwrap(), vec!["A:\"P\"".to_string()]);

        coord.unregister_all(a).await;
        coord
            .dispatcher()
            .dispatch(&EventEnvelope::new("threadCreated", "thread", Some(7), json!({})));
        coord.dispatcher().dispatch(&msg);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["A:\"P\"".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn closed_coordinator_rejects_registration() {
        let mut api = module_mock(Module::Thread);
        api.expect_subscribe().times(1).returning(|_| Ok(()));
        let coord = coordinator(api);

        coord.register(Identity::new(), "thread", "threadCreated", noop()).await.unwrap();
        assert_eq!(coord.close().await, vec!["thread".to_string()]);
        assert!(coord.is_closed());

        // Connection-scoped and malformed channels need no remote call but
        // are refused all the same.
        for channel in ["", "thread/1", "thread"] {
            let err = coord
                .register(Identity::new(), channel, "libConnected", noop())
                .await
                .unwrap_err();
            assert!(matches!(err, CourierError::ConnectionClosed(1)));
        }
        assert_eq!(coord.dispatcher().listener_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_register_and_unregister_all_keep_remote_calls_paired() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut api = module_mock(Module::Thread);
        let log = Arc::clone(&calls);
        api.expect_subscribe()
            .with(eq(SubscriptionScope::Module))
            .returning(move |_| {
                log.lock().unwrap().push("subscribe");
                Ok(())
            });
        let log = Arc::clone(&calls);
        api.expect_unsubscribe()
            .with(eq(SubscriptionScope::Module))
            .returning(move |_| {
                log.lock().unwrap().push("unsubscribe");
                Ok(())
            });
        let coord = Arc::new(coordinator(api));

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move {
                    let kind = if task % 2 == 0 { "threadCreated" } else { "threadDeleted" };
                    for _ in 0..50 {
                        let identity = Identity::new();
                        coord.register(identity, "thread", kind, noop()).await.unwrap();
                        tokio::task::yield_now().await;
                        coord.unregister_all(identity).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let calls = calls.lock().unwrap().clone();
        assert!(!calls.is_empty());
        for (i, call) in calls.iter().enumerate() {
            let expected = if i % 2 == 0 { "subscribe" } else { "unsubscribe" };
            assert_eq!(*call, expected, "call {i} out of order: {calls:?}");
        }
        assert_eq!(calls.len() % 2, 0);
        assert!(!coord.dispatcher().has_listeners("thread"));
    }
}
