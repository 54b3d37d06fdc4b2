use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointConfig, Checkpointer};
use crate::stream::StreamMode;

/// When checkpoint commits happen relative to task execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Await every commit before running the step's tasks.
    Sync,
    /// Fire-and-track commits; the loop still awaits them before returning.
    #[default]
    Async,
    /// Commit only once, at graph termination (or halt).
    Exit,
}

/// Interrupt gate: which nodes pause the run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InterruptNodes {
    #[default]
    None,
    All,
    Nodes(Vec<String>),
}

impl InterruptNodes {
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        match self {
            InterruptNodes::None => false,
            InterruptNodes::All => true,
            InterruptNodes::Nodes(names) => names.iter().any(|n| n == name),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, InterruptNodes::None)
    }
}

/// Per-invocation checkpointer binding.
#[derive(Clone, Default)]
pub enum CheckpointerOption {
    /// Use the checkpointer bound to the `App`.
    #[default]
    Inherit,
    /// Run without persistence even if the `App` has a checkpointer.
    Disabled,
    /// Use this checkpointer for this invocation only.
    Override(Arc<dyn Checkpointer>),
}

impl std::fmt::Debug for CheckpointerOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointerOption::Inherit => write!(f, "Inherit"),
            CheckpointerOption::Disabled => write!(f, "Disabled"),
            CheckpointerOption::Override(_) => write!(f, "Override(..)"),
        }
    }
}

/// Options for one invocation.
///
/// The default configuration streams `values`, commits asynchronously,
/// allows 25 supersteps, and addresses a freshly generated thread id.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub stream_modes: Vec<StreamMode>,
    /// Restrict which channels graph input may seed; defaults to the graph's
    /// registered input channels.
    pub input_keys: Option<Vec<String>>,
    /// Restrict the final/streamed `values` projection; defaults to the
    /// graph's registered output channels.
    pub output_keys: Option<Vec<String>>,
    pub interrupt_before: InterruptNodes,
    pub interrupt_after: InterruptNodes,
    /// Maximum supersteps per invocation, at least 1.
    pub recursion_limit: usize,
    pub durability: Durability,
    /// Maximum parallel tasks per superstep.
    pub max_concurrency: usize,
    /// Wall-clock budget per superstep; firing cancels in-flight tasks.
    pub step_timeout: Option<Duration>,
    /// External cancellation signal.
    pub cancel: CancellationToken,
    /// Include subgraph namespaces in streamed events.
    pub subgraphs: bool,
    /// Per-invocation checkpointer binding.
    pub checkpointer: CheckpointerOption,
    /// Thread addressing: `thread_id`, `checkpoint_ns`, optional
    /// `checkpoint_id` for time travel.
    pub configurable: CheckpointConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stream_modes: vec![StreamMode::Values],
            input_keys: None,
            output_keys: None,
            interrupt_before: InterruptNodes::None,
            interrupt_after: InterruptNodes::None,
            recursion_limit: 25,
            durability: Durability::default(),
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            step_timeout: None,
            cancel: CancellationToken::new(),
            subgraphs: false,
            checkpointer: CheckpointerOption::Inherit,
            configurable: CheckpointConfig::new(Uuid::new_v4().to_string()),
        }
    }
}

impl RunConfig {
    /// Config addressing an explicit thread.
    #[must_use]
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            configurable: CheckpointConfig::new(thread_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stream_modes<I>(mut self, modes: I) -> Self
    where
        I: IntoIterator<Item = StreamMode>,
    {
        self.stream_modes = modes
            .into_iter()
            .filter(|mode| *mode != StreamMode::Error)
            .collect();
        self
    }

    #[must_use]
    pub fn with_interrupt_before(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_before = nodes;
        self
    }

    #[must_use]
    pub fn with_interrupt_after(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_after = nodes;
        self
    }

    /// Clamped to at least 1.
    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = Some(step_timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_checkpointer(mut self, option: CheckpointerOption) -> Self {
        self.checkpointer = option;
        self
    }

    #[must_use]
    pub fn with_output_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn at_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.configurable.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}
