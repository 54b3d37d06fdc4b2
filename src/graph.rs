//! Compiled graph description consumed by the runtime.
//!
//! Graph construction and topology validation tooling live outside the
//! engine; what the engine consumes is this immutable description: a set of
//! named nodes with channel subscriptions, the channel declarations
//! themselves, and the input/output projections. A [`GraphSpec`] is built
//! once, validated, wrapped in an `Arc`, and shared read-only by every
//! invocation; the loop never mutates it.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::channels::{self, BoxedChannel, ChannelError, EphemeralValue};
use crate::node::{CachePolicy, Node, RetryPolicy};
use crate::types::{self, START};

/// Declaration of one executable node.
///
/// `triggers` are the channels whose version bumps schedule the node;
/// `channels` are the input projection. A node subscribed to exactly one
/// channel receives the bare value, otherwise a JSON object keyed by channel
/// name. A node with an empty (or unreadable) subscribed channel is skipped
/// for that step without error.
pub struct NodeSpec {
    pub name: String,
    pub node: Arc<dyn Node>,
    pub triggers: Vec<String>,
    pub channels: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    /// Deferred nodes only run in steps where no non-deferred task is
    /// planned, i.e. when the graph is about to settle.
    pub defer: bool,
    /// Child graph executed under this node's namespace, when present.
    pub subgraph: Option<Arc<GraphSpec>>,
}

impl NodeSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        Self {
            name: name.into(),
            node,
            triggers: vec![START.to_string()],
            channels: Vec::new(),
            retry_policy: None,
            cache_policy: None,
            defer: false,
            subgraph: None,
        }
    }

    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.defer = true;
        self
    }

    #[must_use]
    pub fn with_subgraph(mut self, subgraph: Arc<GraphSpec>) -> Self {
        self.subgraph = Some(subgraph);
        self
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("channels", &self.channels)
            .field("defer", &self.defer)
            .field("subgraph", &self.subgraph.is_some())
            .finish()
    }
}

/// Validation failures for a compiled graph description.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    #[error("invalid name `{name}`: {reason}")]
    #[diagnostic(
        code(stepweave::graph::invalid_name),
        help("Names must be non-empty, non-reserved, and free of `|` and `:`.")
    )]
    InvalidName { name: String, reason: &'static str },

    #[error("duplicate node `{name}`")]
    #[diagnostic(code(stepweave::graph::duplicate_node))]
    DuplicateNode { name: String },

    #[error("node `{node}` references unknown channel `{channel}`")]
    #[diagnostic(code(stepweave::graph::unknown_channel))]
    UnknownChannel { node: String, channel: String },

    #[error("conflicting declarations for channel `{name}`")]
    #[diagnostic(
        code(stepweave::graph::conflicting_channel),
        help("Declarations of the same channel must be equal; only LastValue may coexist as a read-only view.")
    )]
    ConflictingChannel { name: String },

    #[error("{projection} projection references unregistered channel `{channel}`")]
    #[diagnostic(code(stepweave::graph::unknown_projection))]
    UnknownProjection {
        projection: &'static str,
        channel: String,
    },
}

/// Immutable, validated graph description.
pub struct GraphSpec {
    nodes: FxHashMap<String, NodeSpec>,
    /// Deterministic planning order: node names sorted lexicographically.
    node_order: Vec<String>,
    channels: FxHashMap<String, BoxedChannel>,
    input_channels: Vec<String>,
    output_channels: Vec<String>,
}

impl GraphSpec {
    /// Build and validate a description.
    ///
    /// Duplicate channel declarations are permitted when compatible (the
    /// conflict rule of the channel module); the reserved `__start__` entry
    /// channel is registered automatically.
    pub fn new(
        nodes: Vec<NodeSpec>,
        channel_decls: Vec<(String, BoxedChannel)>,
        input_channels: Vec<String>,
        output_channels: Vec<String>,
    ) -> Result<Self, GraphValidationError> {
        let mut channels: FxHashMap<String, BoxedChannel> = FxHashMap::default();
        channels.insert(START.to_string(), Box::new(EphemeralValue::new()));

        for (name, decl) in channel_decls {
            if name != START && !types::is_valid_name(&name) {
                return Err(GraphValidationError::InvalidName {
                    name,
                    reason: "reserved or contains a namespace separator",
                });
            }
            match channels.get(&name) {
                None => {
                    channels.insert(name, decl);
                }
                Some(existing) => {
                    if !channels::check_compatible(existing.as_ref(), decl.as_ref()) {
                        return Err(GraphValidationError::ConflictingChannel { name });
                    }
                    // First non-LastValue declaration wins as the owner.
                    if matches!(existing.kind(), channels::ChannelKind::LastValue)
                        && !matches!(decl.kind(), channels::ChannelKind::LastValue)
                    {
                        channels.insert(name, decl);
                    }
                }
            }
        }

        let mut node_map: FxHashMap<String, NodeSpec> = FxHashMap::default();
        for spec in nodes {
            if !types::is_valid_name(&spec.name) {
                return Err(GraphValidationError::InvalidName {
                    name: spec.name,
                    reason: "reserved or contains a namespace separator",
                });
            }
            for channel in spec.triggers.iter().chain(spec.channels.iter()) {
                if !channels.contains_key(channel) {
                    return Err(GraphValidationError::UnknownChannel {
                        node: spec.name.clone(),
                        channel: channel.clone(),
                    });
                }
            }
            if node_map.contains_key(&spec.name) {
                return Err(GraphValidationError::DuplicateNode { name: spec.name });
            }
            node_map.insert(spec.name.clone(), spec);
        }

        for channel in &input_channels {
            if !channels.contains_key(channel) {
                return Err(GraphValidationError::UnknownProjection {
                    projection: "input",
                    channel: channel.clone(),
                });
            }
        }
        for channel in &output_channels {
            if !channels.contains_key(channel) {
                return Err(GraphValidationError::UnknownProjection {
                    projection: "output",
                    channel: channel.clone(),
                });
            }
        }

        let mut node_order: Vec<String> = node_map.keys().cloned().collect();
        node_order.sort();

        Ok(Self {
            nodes: node_map,
            node_order,
            channels,
            input_channels,
            output_channels,
        })
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// Node names in deterministic planning order.
    #[must_use]
    pub fn node_order(&self) -> &[String] {
        &self.node_order
    }

    #[must_use]
    pub fn channel_prototypes(&self) -> &FxHashMap<String, BoxedChannel> {
        &self.channels
    }

    #[must_use]
    pub fn input_channels(&self) -> &[String] {
        &self.input_channels
    }

    #[must_use]
    pub fn output_channels(&self) -> &[String] {
        &self.output_channels
    }

    /// Child graph registered under `name`, for namespace routing.
    #[must_use]
    pub fn subgraph(&self, name: &str) -> Option<Arc<GraphSpec>> {
        self.nodes.get(name).and_then(|spec| spec.subgraph.clone())
    }

    /// Materialize a fresh channel map from checkpointed values.
    ///
    /// Channels without a snapshot start from their declaration defaults.
    pub fn materialize(
        &self,
        values: &FxHashMap<String, Value>,
    ) -> Result<FxHashMap<String, BoxedChannel>, ChannelError> {
        let mut out = FxHashMap::default();
        for (name, prototype) in &self.channels {
            let restored = prototype.from_snapshot(values.get(name).cloned())?;
            out.insert(name.clone(), restored);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for GraphSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSpec")
            .field("nodes", &self.node_order)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .finish()
    }
}
