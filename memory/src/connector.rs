use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use courier_core::{
    ConnectParams, Connection, ConnectionId, Connector, Module, ModuleApi, Session,
    TransportError,
};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::module::RecordingModule;
use crate::source::MemoryEventSource;

/// Session handed out by [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    closed: AtomicBool,
    close_calls: AtomicI64,
}

impl MemoryConnection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            close_calls: AtomicI64::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> i64 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        debug!(target: "memory", connection_id = self.id, "Session closed");
        Ok(())
    }
}

/// Connector whose sessions live in-process and publish on one shared
/// [`MemoryEventSource`].
///
/// Keeps a handle to every session and module API it creates so callers
/// can inspect remote calls and inject failures.
#[derive(Debug)]
pub struct MemoryConnector {
    source: Arc<MemoryEventSource>,
    next_id: AtomicI64,
    certs_path: Mutex<Option<PathBuf>>,
    reject_connect: AtomicBool,
    connections: DashMap<ConnectionId, Arc<MemoryConnection>>,
    modules: DashMap<(ConnectionId, Module), Arc<RecordingModule>>,
}

impl MemoryConnector {
    pub fn new(source: Arc<MemoryEventSource>) -> Self {
        Self {
            source,
            next_id: AtomicI64::new(1),
            certs_path: Mutex::new(None),
            reject_connect: AtomicBool::new(false),
            connections: DashMap::new(),
            modules: DashMap::new(),
        }
    }

    pub fn source(&self) -> &Arc<MemoryEventSource> {
        &self.source
    }

    pub fn certs_path(&self) -> Option<PathBuf> {
        self.certs_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every later connect fail.
    pub fn set_reject_connect(&self, reject: bool) {
        self.reject_connect.store(reject, Ordering::SeqCst);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<MemoryConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn module(&self, id: ConnectionId, module: Module) -> Option<Arc<RecordingModule>> {
        self.modules.get(&(id, module)).map(|m| Arc::clone(m.value()))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn set_certs_path(&self, path: &Path) -> Result<(), TransportError> {
        *self
            .certs_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path.to_path_buf());
        Ok(())
    }

    async fn connect(
        &self,
        params: &ConnectParams,
        modules: &HashSet<Module>,
    ) -> Result<Session, TransportError> {
        if self.certs_path().is_none() {
            return Err(TransportError::Certificate("no certificate bundle installed".into()));
        }
        if self.reject_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "bridge {} refused the connection",
                params.bridge_url
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MemoryConnection::new(id));
        self.connections.insert(id, Arc::clone(&connection));

        let mut enabled: Vec<Module> = modules.iter().copied().collect();
        enabled.sort();
        let apis: Vec<Arc<dyn ModuleApi>> = enabled
            .into_iter()
            .map(|module| {
                let api = Arc::new(RecordingModule::new(module, id));
                self.modules.insert((id, module), Arc::clone(&api));
                api as Arc<dyn ModuleApi>
            })
            .collect();

        info!(target: "memory", connection_id = id, solution = %params.solution_id, modules = apis.len(), "Session opened");
        Ok(Session {
            connection,
            modules: apis,
        })
    }
}
