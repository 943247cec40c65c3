// Per-connection listener table and fan-out
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::EventEnvelope;

/// What a listener callback returns. Any error is logged and swallowed by the
/// dispatcher.
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Failure of a single listener invocation. Never leaves the dispatcher.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),

    #[error("callback panicked: {0}")]
    Panicked(String),

    #[error("payload does not decode as {expected}: {source}")]
    PayloadMismatch {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque token naming the owner of a group of registrations.
///
/// Only compared, never inspected. Tokens from [`Identity::new`] are unique
/// within the process; [`Identity::from_raw`] lets callers bring their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

impl Identity {
    pub fn new() -> Self {
        Self(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

type ListenerFn = dyn Fn(&Value) -> Result<(), ListenerError> + Send + Sync;

/// Type-erased callback stored in the dispatcher.
#[derive(Clone)]
pub struct Listener(Arc<ListenerFn>);

impl Listener {
    /// Callback receiving the raw payload.
    pub fn raw<F>(callback: F) -> Self
    where
        F: Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    {
        Self(Arc::new(move |payload| {
            callback(payload).map_err(ListenerError::Callback)
        }))
    }

    /// Callback receiving the payload decoded as `T`. A payload of the wrong
    /// shape is reported as [`ListenerError::PayloadMismatch`].
    pub fn typed<T, F>(callback: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(T) -> CallbackResult + Send + Sync + 'static,
    {
        Self(Arc::new(move |payload| {
            let data = T::deserialize(payload).map_err(|source| ListenerError::PayloadMismatch {
                expected: std::any::type_name::<T>(),
                source,
            })?;
            callback(data).map_err(ListenerError::Callback)
        }))
    }

    fn invoke(&self, payload: &Value) -> Result<(), ListenerError> {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(payload))) {
            Ok(result) => result,
            Err(panic) => Err(ListenerError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listener")
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone)]
struct Registration {
    seq: u64,
    identity: Identity,
    listener: Listener,
}

/// Outcome of one [`EventDispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub unmatched: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    unmatched: AtomicU64,
}

/// Listener table for one connection.
///
/// Registrations are grouped by channel, then by kind, in insertion order.
/// Each channel lives in a single map entry so "does this channel still have
/// any listener" is answered under the same lock that mutates it.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    // channel -> kind -> registrations
    channels: DashMap<String, HashMap<String, Vec<Registration>>>,
    next_seq: AtomicU64,
    counters: DispatchCounters,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a registration under `(channel, kind)`.
    ///
    /// Returns `true` when the channel had no listener of any kind before this
    /// call, i.e. the remote side has to be told to start streaming it.
    pub fn register(&self, identity: Identity, channel: &str, kind: &str, listener: Listener) -> bool {
        self.insert(identity, channel, kind, listener).0
    }

    pub(crate) fn insert(
        &self,
        identity: Identity,
        channel: &str,
        kind: &str,
        listener: Listener,
    ) -> (bool, u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut kinds = self.channels.entry(channel.to_string()).or_default();
        let first_for_channel = kinds.values().all(Vec::is_empty);
        kinds.entry(kind.to_string()).or_default().push(Registration {
            seq,
            identity,
            listener,
        });
        debug!(target: "dispatcher", channel, kind, first_for_channel, "Registered listener");
        (first_for_channel, seq)
    }

    /// Removes the single registration created by [`Self::insert`]. Returns
    /// `true` when this emptied the channel.
    pub(crate) fn remove_registration(&self, channel: &str, kind: &str, seq: u64) -> bool {
        self.remove_where(channel, kind, |reg| reg.seq == seq)
    }

    /// Removes every registration of `identity` under `(channel, kind)`.
    /// Returns `true` when the channel has no listener left as a result.
    pub fn unregister(&self, identity: Identity, channel: &str, kind: &str) -> bool {
        self.remove_where(channel, kind, |reg| reg.identity == identity)
    }

    fn remove_where<P>(&self, channel: &str, kind: &str, pred: P) -> bool
    where
        P: Fn(&Registration) -> bool,
    {
        let emptied = match self.channels.get_mut(channel) {
            Some(mut kinds) => {
                let Some(regs) = kinds.get_mut(kind) else {
                    return false;
                };
                let before = regs.len();
                regs.retain(|reg| !pred(reg));
                if regs.len() == before {
                    return false;
                }
                kinds.retain(|_, regs| !regs.is_empty());
                kinds.is_empty()
            }
            None => false,
        };
        if emptied {
            self.channels.remove_if(channel, |_, kinds| kinds.is_empty());
        }
        emptied
    }

    /// Removes every registration owned by `identity`, across all channels.
    ///
    /// Returns each channel that went from non-empty to empty, once. Entries
    /// are pruned with a re-check so a concurrent register on an emptied
    /// channel survives.
    pub fn unregister_all(&self, identity: Identity) -> Vec<String> {
        let mut emptied = Vec::new();
        for mut entry in self.channels.iter_mut() {
            let had_listeners = entry.values().any(|regs| !regs.is_empty());
            for regs in entry.values_mut() {
                regs.retain(|reg| reg.identity != identity);
            }
            entry.retain(|_, regs| !regs.is_empty());
            if had_listeners && entry.is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for channel in &emptied {
            self.channels.remove_if(channel, |_, kinds| kinds.is_empty());
        }
        debug!(target: "dispatcher", identity = identity.as_raw(), emptied = emptied.len(), "Unregistered identity");
        emptied
    }

    /// Drops every registration. Returns the channels that had listeners.
    pub fn unregister_everything(&self) -> Vec<String> {
        let keys: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|channel| {
                let (channel, kinds) = self.channels.remove(&channel)?;
                kinds
                    .values()
                    .any(|regs| !regs.is_empty())
                    .then_some(channel)
            })
            .collect()
    }

    /// Invokes every listener registered under the envelope's
    /// `(channel, kind)` with its payload, in registration order.
    ///
    /// The listener list is snapshotted first, so callbacks run without any
    /// table lock held and may register or unregister freely. A failing
    /// callback is logged and skipped; it stays registered.
    pub fn dispatch(&self, envelope: &EventEnvelope) -> DispatchReport {
        let listeners: Vec<Listener> = self
            .channels
            .get(&envelope.channel)
            .and_then(|kinds| {
                kinds
                    .get(&envelope.kind)
                    .map(|regs| regs.iter().map(|r| r.listener.clone()).collect())
            })
            .unwrap_or_default();

        let mut report = DispatchReport {
            matched: listeners.len(),
            ..Default::default()
        };
        if listeners.is_empty() {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            return report;
        }

        for listener in listeners {
            match listener.invoke(&envelope.payload) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "dispatcher",
                        channel = %envelope.channel,
                        kind = %envelope.kind,
                        error = %err,
                        "Cannot process event"
                    );
                }
            }
        }

        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    pub fn has_listeners(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|kinds| kinds.values().any(|regs| !regs.is_empty()))
            .unwrap_or(false)
    }

    /// Channels with at least one listener.
    pub fn channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|e| e.values().any(|regs| !regs.is_empty()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.channels
            .iter()
            .map(|e| e.values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }
}
