use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use courier_core::{ConnectionId, Module, ModuleApi, SubscriptionScope, TransportError};
use tracing::debug;

/// A remote subscription call as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCall {
    Subscribe(SubscriptionScope),
    Unsubscribe(SubscriptionScope),
}

/// Module API that records every remote call and can be told to fail.
#[derive(Debug)]
pub struct RecordingModule {
    module: Module,
    connection_id: ConnectionId,
    calls: Mutex<Vec<SubscriptionCall>>,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicBool,
}

impl RecordingModule {
    pub fn new(module: Module, connection_id: ConnectionId) -> Self {
        Self {
            module,
            connection_id,
            calls: Mutex::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Calls made so far, oldest first.
    pub fn calls(&self) -> Vec<SubscriptionCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SubscriptionCall::Subscribe(_)))
            .count()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SubscriptionCall::Unsubscribe(_)))
            .count()
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: SubscriptionCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed(self.connection_id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ModuleApi for RecordingModule {
    fn module(&self) -> Module {
        self.module
    }

    async fn subscribe(&self, scope: &SubscriptionScope) -> Result<(), TransportError> {
        self.check_open()?;
        debug!(target: "memory", module = %self.module, ?scope, "subscribe");
        self.record(SubscriptionCall::Subscribe(scope.clone()));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Request(format!("{} subscribe rejected", self.module)));
        }
        Ok(())
    }

    async fn unsubscribe(&self, scope: &SubscriptionScope) -> Result<(), TransportError> {
        self.check_open()?;
        debug!(target: "memory", module = %self.module, ?scope, "unsubscribe");
        self.record(SubscriptionCall::Unsubscribe(scope.clone()));
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Request(format!("{} unsubscribe rejected", self.module)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Request(format!("{} close failed", self.module)));
        }
        Ok(())
    }
}
