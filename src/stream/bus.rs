use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::{StreamEvent, StreamMode};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Snapshot of bus health for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBusMetrics {
    /// Events accepted by `push` while the bus was open.
    pub pushed: usize,
    /// Events discarded because the bus was closed or had no live subscriber.
    pub discarded: usize,
}

struct Subscriber {
    id: usize,
    modes: Option<FxHashSet<StreamMode>>,
    tx: mpsc::Sender<StreamEvent>,
}

impl Subscriber {
    fn wants(&self, mode: StreamMode) -> bool {
        // Terminal errors bypass mode filters.
        mode == StreamMode::Error
            || self
                .modes
                .as_ref()
                .is_none_or(|modes| modes.contains(&mode))
    }
}

struct BusInner {
    // None once closed; push becomes a no-op, never an error.
    subscribers: RwLock<Option<Vec<Subscriber>>>,
    next_id: AtomicUsize,
    pushed: AtomicUsize,
    discarded: AtomicUsize,
    had_subscribers: AtomicBool,
    cancel_on_abandon: RwLock<Option<CancellationToken>>,
    // Level-triggered close signal; releases subscriber watchers so their
    // sender clones never keep a closed stream alive.
    closed: CancellationToken,
}

/// Multi-producer, multi-consumer event stream for one invocation.
///
/// Every subscriber owns a bounded queue; `push` awaits delivery into each
/// matching queue, so one slow consumer back-pressures all producers. Closing
/// is idempotent and pushing after close is a silent no-op. If every
/// subscriber that ever existed goes away, the bus fires its abandonment
/// token so the run driving it can cancel.
#[derive(Clone)]
pub struct StreamBus {
    inner: Arc<BusInner>,
}

impl Default for StreamBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Some(Vec::new())),
                next_id: AtomicUsize::new(0),
                pushed: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                had_subscribers: AtomicBool::new(false),
                cancel_on_abandon: RwLock::new(None),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Register the token to fire when the last subscriber disappears.
    pub fn cancel_on_abandon(&self, token: CancellationToken) {
        *self.inner.cancel_on_abandon.write() = Some(token);
    }

    /// Subscribe with the default buffer capacity.
    ///
    /// `modes = None` receives every mode.
    #[must_use]
    pub fn subscribe(&self, modes: Option<&[StreamMode]>) -> StreamReceiver {
        self.subscribe_with_capacity(modes, DEFAULT_BUFFER_CAPACITY)
    }

    /// Subscribe with an explicit per-subscriber buffer capacity.
    #[must_use]
    pub fn subscribe_with_capacity(
        &self,
        modes: Option<&[StreamMode]>,
        capacity: usize,
    ) -> StreamReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Subscriber {
            id,
            modes: modes.map(|modes| modes.iter().copied().collect()),
            tx: tx.clone(),
        };
        let registered = {
            let mut guard = self.inner.subscribers.write();
            match guard.as_mut() {
                Some(subscribers) => {
                    subscribers.push(subscriber);
                    self.inner.had_subscribers.store(true, Ordering::SeqCst);
                    true
                }
                // Closed bus: drop the sender so the receiver ends immediately.
                None => {
                    drop(subscriber);
                    false
                }
            }
        };
        // Watch for the receiver going away so an abandoned run cancels even
        // while no producer is pushing.
        if registered {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let bus = self.clone();
                handle.spawn(async move {
                    tokio::select! {
                        _ = tx.closed() => bus.remove_subscriber(id),
                        _ = bus.inner.closed.cancelled() => {}
                    }
                });
            }
        }
        StreamReceiver { rx }
    }

    fn remove_subscriber(&self, id: usize) {
        if let Some(subscribers) = self.inner.subscribers.write().as_mut() {
            subscribers.retain(|s| s.id != id);
        }
        self.maybe_abandoned();
    }

    /// Deliver an event to every matching subscriber, awaiting queue space.
    ///
    /// Never fails: a closed bus or an absence of subscribers discards the
    /// event silently.
    pub async fn push(&self, event: StreamEvent) {
        let targets: Vec<(usize, mpsc::Sender<StreamEvent>)> = {
            let guard = self.inner.subscribers.read();
            match guard.as_ref() {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| s.wants(event.mode))
                    .map(|s| (s.id, s.tx.clone()))
                    .collect(),
                None => {
                    self.inner.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };
        if targets.is_empty() {
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            self.maybe_abandoned();
            return;
        }
        self.inner.pushed.fetch_add(1, Ordering::Relaxed);

        let mut dead: Vec<usize> = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            if let Some(subscribers) = self.inner.subscribers.write().as_mut() {
                subscribers.retain(|s| !dead.contains(&s.id));
            }
            self.maybe_abandoned();
        }
    }

    /// Convenience for the loop's terminal error record.
    pub async fn push_error(&self, namespace: impl Into<String>, message: impl Into<String>) {
        self.push(StreamEvent::new(
            namespace,
            StreamMode::Error,
            Value::String(message.into()),
        ))
        .await;
    }

    /// Close the bus. Idempotent; subsequent `push` calls are no-ops and
    /// subscribers observe end-of-stream once their queues drain.
    pub fn close(&self) {
        self.inner.subscribers.write().take();
        self.inner.closed.cancel();
    }

    /// Returns `true` once `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.subscribers.read().is_none()
    }

    #[must_use]
    pub fn metrics(&self) -> StreamBusMetrics {
        StreamBusMetrics {
            pushed: self.inner.pushed.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Handle for producers inside one namespace.
    #[must_use]
    pub fn emitter(&self, namespace: impl Into<String>) -> StreamEmitter {
        StreamEmitter {
            bus: self.clone(),
            namespace: namespace.into(),
        }
    }

    fn maybe_abandoned(&self) {
        if !self.inner.had_subscribers.load(Ordering::SeqCst) {
            return;
        }
        let abandoned = self
            .inner
            .subscribers
            .read()
            .as_ref()
            .is_some_and(|subscribers| subscribers.is_empty());
        if abandoned {
            if let Some(token) = self.inner.cancel_on_abandon.read().as_ref() {
                tracing::debug!(target: "stepweave::stream", "all subscribers gone; cancelling run");
                token.cancel();
            }
        }
    }
}

/// Producer handle bound to one subgraph namespace.
#[derive(Clone)]
pub struct StreamEmitter {
    bus: StreamBus,
    namespace: String,
}

impl StreamEmitter {
    pub async fn emit(&self, mode: StreamMode, payload: Value) {
        self.bus
            .push(StreamEvent::new(self.namespace.clone(), mode, payload))
            .await;
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Emitter for a child namespace under this one.
    #[must_use]
    pub fn child(&self, segment: &str) -> StreamEmitter {
        StreamEmitter {
            bus: self.bus.clone(),
            namespace: crate::types::child_namespace(&self.namespace, segment),
        }
    }
}

impl std::fmt::Debug for StreamEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEmitter")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Consumer side of the bus.
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamReceiver {
    /// Receive the next event; `None` once the bus closes and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Convert into a boxed stream so callers can plug into combinators
    /// without worrying about pinning at the call site.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }

    /// Drain everything currently queued plus anything until close.
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.recv().await {
            out.push(event);
        }
        out
    }
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver").finish()
    }
}
