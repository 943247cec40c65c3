// Single-consumer event loop
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::envelope::{kinds, EventEnvelope};
use crate::registry::ConnectionRegistry;
use crate::transport::{EventSource, SourceError};

/// Lifecycle of the loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Stopped,
    /// A wait is outstanding or about to be issued.
    Listening,
    /// A break was dispatched; no further wait will be issued.
    Stopping,
}

/// Event loop statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub routed: u64,
    pub orphaned: u64,
    pub ignored: u64,
    pub wait_failures: u64,
}

#[derive(Debug, Default)]
struct LoopCounters {
    received: AtomicU64,
    routed: AtomicU64,
    orphaned: AtomicU64,
    ignored: AtomicU64,
    wait_failures: AtomicU64,
}

enum Flow {
    Continue,
    Break,
}

// `generation` and `break_pending` are only written while holding the
// state channel's lock, inside `send_if_modified`/`send_modify`.
struct LoopInner {
    source: Arc<dyn EventSource>,
    registry: Arc<ConnectionRegistry>,
    state: watch::Sender<LoopState>,
    generation: AtomicU64,
    break_pending: AtomicBool,
    retry_backoff: Duration,
    counters: LoopCounters,
}

/// Drains the shared [`EventSource`] on one task and routes each envelope to
/// the connection it belongs to.
///
/// `start` and `stop` may be called from any thread. At most one task ever
/// waits on the source. Every spawned run gets a new generation; a break
/// addressed to an earlier run is dropped.
pub struct EventLoop {
    inner: Arc<LoopInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        registry: Arc<ConnectionRegistry>,
        retry_backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            inner: Arc::new(LoopInner {
                source,
                registry,
                state,
                generation: AtomicU64::new(0),
                break_pending: AtomicBool::new(false),
                retry_backoff,
                counters: LoopCounters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.inner.state.borrow()
    }

    /// Starts listening. A no-op while already listening; during STOPPING it
    /// keeps the current task alive instead of spawning another.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut spawn = None;
        self.inner.state.send_if_modified(|state| match *state {
            LoopState::Listening => false,
            LoopState::Stopping => {
                *state = LoopState::Listening;
                true
            }
            LoopState::Stopped => {
                *state = LoopState::Listening;
                self.inner.break_pending.store(false, Ordering::Release);
                spawn = Some(self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1);
                true
            }
        });

        if let Some(generation) = spawn {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(async move { inner.run(generation).await });
            *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }

    /// Asks a listening loop to stop by injecting a break event on the
    /// source. Does not interrupt a callback that is already running.
    pub fn stop(&self) -> Result<(), SourceError> {
        let mut target = None;
        self.inner.state.send_if_modified(|state| {
            if *state == LoopState::Listening
                && !self.inner.break_pending.swap(true, Ordering::AcqRel)
            {
                target = Some(self.inner.generation.load(Ordering::Acquire));
            }
            false
        });
        let Some(generation) = target else {
            return Ok(());
        };

        info!(target: "event_loop", generation, "Requesting event loop stop");
        self.inner.source.emit_break(generation).map_err(|err| {
            self.inner.state.send_if_modified(|_| {
                if self.inner.generation.load(Ordering::Acquire) == generation {
                    self.inner.break_pending.store(false, Ordering::Release);
                }
                false
            });
            err
        })
    }

    /// Resolves once the loop reaches `target`.
    pub async fn wait_for_state(&self, target: LoopState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Waits for the most recently spawned loop task to finish.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(target: "event_loop", error = %err, "Event loop task failed");
            }
        }
    }

    pub fn stats(&self) -> LoopStats {
        let c = &self.inner.counters;
        LoopStats {
            received: c.received.load(Ordering::Relaxed),
            routed: c.routed.load(Ordering::Relaxed),
            orphaned: c.orphaned.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            wait_failures: c.wait_failures.load(Ordering::Relaxed),
        }
    }
}

// Leaves the loop restartable if the run ends without reaching its normal
// exit, e.g. when the task panics and tokio drops the future.
struct StopOnDrop<'a> {
    inner: &'a LoopInner,
    generation: u64,
    armed: bool,
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner;
        let generation = self.generation;
        inner.state.send_if_modified(|state| {
            if inner.generation.load(Ordering::Acquire) != generation
                || *state == LoopState::Stopped
            {
                return false;
            }
            error!(target: "event_loop", generation, "Event loop task ended abnormally");
            *state = LoopState::Stopped;
            inner.break_pending.store(false, Ordering::Release);
            true
        });
    }
}

impl LoopInner {
    async fn run(self: Arc<Self>, generation: u64) {
        let mut guard = StopOnDrop {
            inner: &self,
            generation,
            armed: true,
        };
        info!(target: "event_loop", generation, "Event loop started");

        loop {
            let exit = self.state.send_if_modified(|state| {
                if *state == LoopState::Stopping {
                    *state = LoopState::Stopped;
                    self.break_pending.store(false, Ordering::Release);
                    true
                } else {
                    false
                }
            });
            if exit {
                break;
            }

            match self.source.wait_event().await {
                Ok(envelope) => {
                    if let Flow::Break = self.on_event(envelope, generation).await {
                        self.state.send_if_modified(|state| {
                            self.break_pending.store(false, Ordering::Release);
                            if *state == LoopState::Listening {
                                *state = LoopState::Stopping;
                                true
                            } else {
                                false
                            }
                        });
                    }
                }
                Err(SourceError::Invalidated) => {
                    info!(target: "event_loop", "Event source invalidated");
                    self.state.send_modify(|state| {
                        *state = LoopState::Stopped;
                        self.break_pending.store(false, Ordering::Release);
                    });
                    break;
                }
                Err(err) => {
                    self.counters.wait_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "event_loop", error = %err, "Catch event exception, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }

        guard.armed = false;
        info!(target: "event_loop", generation, "Event loop stopped");
    }

    async fn on_event(&self, envelope: EventEnvelope, generation: u64) -> Flow {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if envelope.is_kind(kinds::PLATFORM_DISCONNECTED) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(target: "event_loop", "Skipping internal transport disconnect");
            return Flow::Continue;
        }

        if let Some(stale) = envelope.break_generation().filter(|g| *g != generation) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(target: "event_loop", stale, generation, "Dropping break addressed to an earlier run");
            return Flow::Continue;
        }

        if let Some(id) = envelope.connection_id() {
            match self.registry.get(id) {
                Some(endpoint) => {
                    let report = endpoint.handle_event(&envelope);
                    self.counters.routed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: "event_loop",
                        connection_id = id,
                        kind = %envelope.kind,
                        delivered = report.delivered,
                        failed = report.failed,
                        "Dispatched event"
                    );
                    if envelope.is_kind(kinds::DISCONNECTED) {
                        info!(target: "event_loop", connection_id = id, "Connection disconnected");
                        self.registry.remove_and_close(id).await;
                    }
                }
                None => {
                    self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
                    debug!(target: "event_loop", connection_id = id, kind = %envelope.kind, "No connection for event");
                }
            }
        }

        if envelope.is_kind(kinds::BREAK) {
            Flow::Break
        } else {
            Flow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Source fed from a channel; tracks how many waits overlap.
    struct ScriptedSource {
        tx: mpsc::UnboundedSender<Result<EventEnvelope, SourceError>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<EventEnvelope, SourceError>>>,
        waiting: AtomicUsize,
        max_waiting: AtomicUsize,
        breaks: AtomicUsize,
        panic_on_wait: AtomicBool,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                waiting: AtomicUsize::new(0),
                max_waiting: AtomicUsize::new(0),
                breaks: AtomicUsize::new(0),
                panic_on_wait: AtomicBool::new(false),
            })
        }

        fn push(&self, item: Result<EventEnvelope, SourceError>) {
            self.tx.send(item).unwrap();
        }

        /// Drops everything queued. Only valid while no wait is pending.
        fn drain(&self) -> usize {
            let mut rx = self.rx.try_lock().unwrap();
            let mut dropped = 0;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            dropped
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn wait_event(&self) -> Result<EventEnvelope, SourceError> {
            if self.panic_on_wait.load(Ordering::SeqCst) {
                panic!("source exploded");
            }
            let now = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_waiting.fetch_max(now, Ordering::SeqCst);
            let item = self.rx.lock().await.recv().await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            item.unwrap_or(Err(SourceError::Invalidated))
        }

        fn emit_break(&self, generation: u64) -> Result<(), SourceError> {
            self.breaks.fetch_add(1, Ordering::SeqCst);
            self.push(Ok(EventEnvelope::break_for(generation)));
            Ok(())
        }
    }

    fn event_loop(source: &Arc<ScriptedSource>) -> EventLoop {
        EventLoop::new(
            Arc::clone(source) as Arc<dyn EventSource>,
            Arc::new(ConnectionRegistry::new()),
            Duration::from_millis(1),
        )
    }

    async fn settle(lp: &EventLoop, target: LoopState) {
        tokio::time::timeout(Duration::from_secs(2), lp.wait_for_state(target))
            .await
            .expect("loop did not reach state");
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_breaks_the_wait() {
        let source = ScriptedSource::new();
        let lp = event_loop(&source);

        lp.start();
        lp.start();
        lp.start();
        assert_eq!(lp.state(), LoopState::Listening);
        tokio::time::sleep(Duration::from_millis(20)).await;

        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        lp.join().await;
        assert_eq!(source.max_waiting.load(Ordering::SeqCst), 1);
        assert_eq!(lp.stats().received, 1);
    }

    #[tokio::test]
    async fn stop_when_not_listening_emits_nothing() {
        let source = ScriptedSource::new();
        let lp = event_loop(&source);

        lp.stop().unwrap();
        assert_eq!(source.breaks.load(Ordering::SeqCst), 0);

        lp.start();
        lp.stop().unwrap();
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        assert_eq!(source.breaks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = ScriptedSource::new();
        source.push(Err(SourceError::Transient("glitch".into())));
        source.push(Err(SourceError::Transient("glitch".into())));
        source.push(Ok(EventEnvelope::control(kinds::PLATFORM_DISCONNECTED, None)));
        source.push(Ok(EventEnvelope::control(kinds::CONNECTED, Some(99))));
        let lp = event_loop(&source);

        lp.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lp.state(), LoopState::Listening);

        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        let stats = lp.stats();
        assert_eq!(stats.wait_failures, 2);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.orphaned, 1);
    }

    #[tokio::test]
    async fn invalidated_source_stops_and_loop_can_restart() {
        let source = ScriptedSource::new();
        source.push(Err(SourceError::Invalidated));
        let lp = event_loop(&source);

        lp.start();
        settle(&lp, LoopState::Stopped).await;
        lp.join().await;

        lp.start();
        assert_eq!(lp.state(), LoopState::Listening);
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
    }

    #[tokio::test]
    async fn break_left_over_from_an_invalidated_run_is_ignored() {
        let source = ScriptedSource::new();
        let lp = event_loop(&source);

        lp.start();
        source.push(Err(SourceError::Invalidated));
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        lp.join().await;

        // The first run's break is still queued.
        lp.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lp.state(), LoopState::Listening);
        assert_eq!(lp.stats().ignored, 1);

        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        assert_eq!(source.breaks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_after_invalidated_run_still_emits_a_break() {
        let source = ScriptedSource::new();
        let lp = event_loop(&source);

        lp.start();
        source.push(Err(SourceError::Invalidated));
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        lp.join().await;
        assert_eq!(source.drain(), 1);

        lp.start();
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        assert_eq!(source.breaks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_after_stopped_queues_no_stale_break() {
        let source = ScriptedSource::new();
        let lp = event_loop(&source);

        lp.start();
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
        lp.stop().unwrap();
        assert_eq!(source.breaks.load(Ordering::SeqCst), 1);

        // Nothing stale may be waiting for the next run.
        lp.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lp.state(), LoopState::Listening);
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
    }

    #[tokio::test]
    async fn panicked_run_leaves_loop_restartable() {
        let source = ScriptedSource::new();
        source.panic_on_wait.store(true, Ordering::SeqCst);
        let lp = event_loop(&source);

        lp.start();
        settle(&lp, LoopState::Stopped).await;
        lp.join().await;

        source.panic_on_wait.store(false, Ordering::SeqCst);
        lp.start();
        assert_eq!(lp.state(), LoopState::Listening);
        lp.stop().unwrap();
        settle(&lp, LoopState::Stopped).await;
    }
}
