use serde_json::Value;

use super::{BoxedChannel, Channel, ChannelError, ChannelKind};

/// Value that lives for exactly one superstep.
///
/// The loop clears it (`consume`) after any step in which it triggered a
/// node, so writes are visible to the immediately following step only. The
/// engine's `__start__` entry signal is an ephemeral channel.
#[derive(Clone, Debug, Default)]
pub struct EphemeralValue {
    value: Option<Value>,
}

impl EphemeralValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for EphemeralValue {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Ephemeral
    }

    fn update(&mut self, mut values: Vec<Value>) -> Result<bool, ChannelError> {
        if values.is_empty() {
            return Ok(false);
        }
        self.value = values.pop();
        Ok(true)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        self.value.clone().ok_or(ChannelError::EmptyChannel)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        Ok(Box::new(Self { value: snapshot }))
    }

    fn consume(&mut self) -> bool {
        if self.value.is_some() {
            self.value = None;
            true
        } else {
            false
        }
    }
}
