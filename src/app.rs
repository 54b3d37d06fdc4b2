//! Consumer-facing invocation surface.
//!
//! An [`App`] binds a compiled [`GraphSpec`] to its runtime collaborators
//! (checkpointer, store, cache) and constructs a fresh [`GraphRunner`] per
//! invocation. One `App` can serve many concurrent invocations; the graph is
//! shared read-only and every run owns its own channels, bus, and loop state.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::checkpoint::{CheckpointConfig, Checkpointer, ListOptions};
use crate::command::GraphInput;
use crate::graph::GraphSpec;
use crate::runtimes::{
    self, CheckpointerOption, GraphRunner, LoopError, RunConfig, RunOutcome, StateError,
    StateSnapshot, StateUpdate,
};
use crate::schedulers::SchedulerError;
use crate::store::{Cache, Store};
use crate::stream::{StreamBus, StreamReceiver};
use crate::types::{NS_SEP, TASK_SEP};

/// A running `stream` invocation: the event side and the join side.
pub struct StreamRun {
    /// Back-pressured event stream; dropping it cancels the run.
    pub events: StreamReceiver,
    handle: JoinHandle<Result<RunOutcome, LoopError>>,
}

impl StreamRun {
    /// Await the run's completion, draining any unread events first so a
    /// full subscriber queue can never deadlock the producer side.
    pub async fn join(mut self) -> Result<RunOutcome, LoopError> {
        while self.events.recv().await.is_some() {}
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(LoopError::Scheduler(SchedulerError::Join(err))),
        }
    }

    /// Split into the event stream and a join future, for consumers that
    /// process events and await completion concurrently.
    #[must_use]
    pub fn into_parts(self) -> (StreamReceiver, JoinHandle<Result<RunOutcome, LoopError>>) {
        (self.events, self.handle)
    }
}

/// Compiled graph bound to its runtime collaborators.
#[derive(Clone)]
pub struct App {
    graph: Arc<GraphSpec>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    store: Option<Arc<dyn Store>>,
    cache: Option<Arc<dyn Cache>>,
}

impl App {
    #[must_use]
    pub fn new(graph: GraphSpec) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpointer: None,
            store: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<GraphSpec> {
        &self.graph
    }

    fn effective_checkpointer(&self, config: &RunConfig) -> Option<Arc<dyn Checkpointer>> {
        match &config.checkpointer {
            CheckpointerOption::Inherit => self.checkpointer.clone(),
            CheckpointerOption::Disabled => None,
            CheckpointerOption::Override(checkpointer) => Some(Arc::clone(checkpointer)),
        }
    }

    fn runner(&self, bus: StreamBus, config: RunConfig) -> GraphRunner {
        let checkpointer = self.effective_checkpointer(&config);
        GraphRunner::new(
            Arc::clone(&self.graph),
            checkpointer,
            self.store.clone(),
            self.cache.clone(),
            bus,
            config,
            String::new(),
        )
    }

    /// Run to completion and return the final output projection.
    #[instrument(skip(self, input, config), fields(thread = %config.configurable.thread_id))]
    pub async fn invoke(
        &self,
        input: impl Into<GraphInput>,
        config: RunConfig,
    ) -> Result<RunOutcome, LoopError> {
        let runner = self.runner(StreamBus::new(), config);
        runner.run(input.into()).await
    }

    /// Run in the background and stream events as they are produced.
    ///
    /// The subscriber is registered before the loop starts, so no event is
    /// missed. Dropping [`StreamRun::events`] cancels the run; loop errors
    /// arrive as a terminal `error` event before the stream ends.
    #[must_use]
    pub fn stream(&self, input: impl Into<GraphInput>, config: RunConfig) -> StreamRun {
        let bus = StreamBus::new();
        bus.cancel_on_abandon(config.cancel.clone());
        let mut modes = config.stream_modes.clone();
        if modes.is_empty() {
            modes.push(crate::stream::StreamMode::Values);
        }
        let events = bus.subscribe(Some(modes.as_slice()));
        let runner = self.runner(bus, config);
        let input = input.into();
        let handle = tokio::spawn(async move { runner.run(input).await });
        StreamRun { events, handle }
    }

    /// Resolve the graph a namespaced config addresses: empty namespace is
    /// the root; each segment descends into the named node's subgraph.
    fn route(&self, config: &CheckpointConfig) -> Result<Arc<GraphSpec>, StateError> {
        if config.checkpoint_ns.is_empty() {
            return Ok(Arc::clone(&self.graph));
        }
        let mut graph = Arc::clone(&self.graph);
        for segment in config.checkpoint_ns.split(NS_SEP) {
            let name = segment.split(TASK_SEP).next().unwrap_or(segment);
            graph = graph.subgraph(name).ok_or_else(|| StateError::UnknownNode {
                name: name.to_string(),
            })?;
        }
        Ok(graph)
    }

    fn require_checkpointer(&self) -> Result<Arc<dyn Checkpointer>, StateError> {
        self.checkpointer
            .clone()
            .ok_or(StateError::MissingCheckpointer)
    }

    /// Latest (or addressed) state of a thread.
    pub async fn get_state(&self, config: &CheckpointConfig) -> Result<StateSnapshot, StateError> {
        let checkpointer = self.require_checkpointer()?;
        let graph = self.route(config)?;
        runtimes::get_state(&graph, &checkpointer, config).await
    }

    /// Lazy reverse-chronological snapshots of a thread.
    pub async fn get_state_history(
        &self,
        config: &CheckpointConfig,
        options: ListOptions,
    ) -> Result<BoxStream<'static, Result<StateSnapshot, StateError>>, StateError> {
        let checkpointer = self.require_checkpointer()?;
        let graph = self.route(config)?;
        runtimes::get_state_history(graph, checkpointer, config, options).await
    }

    /// Apply an update attributed to `as_node`; see
    /// [`runtimes::update_state`].
    pub async fn update_state(
        &self,
        config: &CheckpointConfig,
        values: serde_json::Value,
        as_node: Option<String>,
    ) -> Result<CheckpointConfig, StateError> {
        let checkpointer = self.require_checkpointer()?;
        let graph = self.route(config)?;
        runtimes::update_state(&graph, &checkpointer, config, values, as_node).await
    }

    /// Apply a sequence of update supersteps; see
    /// [`runtimes::bulk_update_state`].
    pub async fn bulk_update_state(
        &self,
        config: &CheckpointConfig,
        supersteps: Vec<Vec<StateUpdate>>,
    ) -> Result<CheckpointConfig, StateError> {
        let checkpointer = self.require_checkpointer()?;
        let graph = self.route(config)?;
        runtimes::bulk_update_state(&graph, &checkpointer, config, supersteps).await
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("graph", &self.graph)
            .field("checkpointer", &self.checkpointer.is_some())
            .field("store", &self.store.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
