use miette::Diagnostic;
use thiserror::Error;

/// Errors produced by channel operations.
///
/// `EmptyChannel` is not a failure in most contexts: the planner treats it as
/// "this node's input is not ready yet" and skips the node, and callers of
/// `get()` use [`ChannelError::is_empty`] to distinguish an unwritten channel
/// from a channel holding an explicit `null`.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    /// The channel has never been written and declares no default.
    #[error("channel has never been written and has no default")]
    #[diagnostic(
        code(stepweave::channels::empty),
        help("Seed the channel through graph input or give the declaration a default.")
    )]
    EmptyChannel,

    /// The update payload violates the channel's contract.
    #[error("invalid channel update: {0}")]
    #[diagnostic(code(stepweave::channels::invalid_update))]
    InvalidUpdate(String),

    /// A persisted snapshot could not be restored into this channel kind.
    #[error("corrupt channel snapshot: {0}")]
    #[diagnostic(
        code(stepweave::channels::snapshot),
        help("The snapshot was produced by a different channel declaration.")
    )]
    Snapshot(String),
}

impl ChannelError {
    /// Returns `true` for the empty-channel case.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, ChannelError::EmptyChannel)
    }
}
