use serde_json::Value;

use super::{BoxedChannel, Channel, ChannelError, ChannelKind};

/// Accumulates a list of values within a superstep.
///
/// Array updates are flattened one level so a task can publish several items
/// at once. Unless declared accumulating, the list is cleared at the
/// superstep boundary (`consume`), making the topic a per-step mailbox.
#[derive(Clone, Debug)]
pub struct Topic {
    values: Vec<Value>,
    accumulate: bool,
}

impl Topic {
    #[must_use]
    pub fn new(accumulate: bool) -> Self {
        Self {
            values: Vec::new(),
            accumulate,
        }
    }
}

impl Channel for Topic {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Topic {
            accumulate: self.accumulate,
        }
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool, ChannelError> {
        if values.is_empty() {
            return Ok(false);
        }
        for value in values {
            match value {
                Value::Array(mut items) => self.values.append(&mut items),
                other => self.values.push(other),
            }
        }
        Ok(true)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        Ok(Value::Array(self.values.clone()))
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(Value::Array(self.values.clone()))
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        let values = match snapshot {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ChannelError::Snapshot(format!(
                    "Topic snapshot must be an array, got {other}"
                )));
            }
        };
        Ok(Box::new(Self {
            values,
            accumulate: self.accumulate,
        }))
    }

    fn consume(&mut self) -> bool {
        if !self.accumulate && !self.values.is_empty() {
            self.values.clear();
            true
        } else {
            false
        }
    }
}
