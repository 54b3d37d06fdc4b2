use serde_json::Value;

use super::{BoxedChannel, Channel, ChannelError, ChannelKind};

/// Stores the most recent write; the update type equals the value type.
///
/// A `LastValue` may only receive one write per superstep. Two tasks writing
/// it in the same step is a declaration bug, not a race, so the batch is
/// rejected with [`ChannelError::InvalidUpdate`].
#[derive(Clone, Debug, Default)]
pub struct LastValue {
    value: Option<Value>,
}

impl LastValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known value, handy for defaults in tests.
    #[must_use]
    pub fn with_value(value: Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Channel for LastValue {
    fn kind(&self) -> ChannelKind {
        ChannelKind::LastValue
    }

    fn update(&mut self, mut values: Vec<Value>) -> Result<bool, ChannelError> {
        match values.len() {
            0 => Ok(false),
            1 => {
                self.value = values.pop();
                Ok(true)
            }
            n => Err(ChannelError::InvalidUpdate(format!(
                "LastValue received {n} writes in one superstep; writers must be node-unique"
            ))),
        }
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
}

/// A [`LastValue`] cell whose value is visible to readers only after the
/// owning graph completes (barrier semantics at graph termination).
#[derive(Clone, Debug, Default)]
pub struct LastValueAfterFinish {
    value: Option<Value>,
    finished: bool,
}

impl LastValueAfterFinish {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for LastValueAfterFinish {
    fn kind(&self) -> ChannelKind {
        ChannelKind::LastValueAfterFinish
    }

    fn update(&mut self, mut values: Vec<Value>) -> Result<bool, ChannelError> {
        if values.is_empty() {
            return Ok(false);
        }
        self.value = values.pop();
        self.finished = false;
        Ok(true)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        if self.finished {
            self.value.clone().ok_or(ChannelError::EmptyChannel)
        } else {
            Err(ChannelError::EmptyChannel)
        }
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.as_ref().map(|value| {
            serde_json::json!({
                "value": value,
                "finished": self.finished,
            })
        })
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        let Some(snapshot) = snapshot else {
            return Ok(Box::new(Self::new()));
        };
        let finished = snapshot
            .get("finished")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                ChannelError::Snapshot("LastValueAfterFinish snapshot missing `finished`".into())
            })?;
        let value = snapshot
            .get("value")
            .cloned()
            .ok_or_else(|| {
                ChannelError::Snapshot("LastValueAfterFinish snapshot missing `value`".into())
            })?;
        Ok(Box::new(Self {
            value: Some(value),
            finished,
        }))
    }

    fn consume(&mut self) -> bool {
        if self.finished {
            self.value = None;
            self.finished = false;
            true
        } else {
            false
        }
    }

    fn finish(&mut self) -> bool {
        if self.value.is_some() && !self.finished {
            self.finished = true;
            true
        } else {
            false
        }
    }
}
