use rustc_hash::FxHashSet;
use serde_json::Value;

use super::{BoxedChannel, Channel, ChannelError, ChannelKind};

fn sorted(names: &FxHashSet<String>) -> Vec<String> {
    let mut out: Vec<String> = names.iter().cloned().collect();
    out.sort();
    out
}

fn seen_from_snapshot(snapshot: &Value, kind: &str) -> Result<FxHashSet<String>, ChannelError> {
    snapshot
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ChannelError::Snapshot(format!("{kind} snapshot must be an array of names")))
}

/// Waits for a fixed set of named members to write before becoming available.
///
/// Each update must be one of the declared member names. Once every member
/// has written, `get` yields `null` (the barrier carries no payload, only
/// readiness) and `consume` re-arms it for the next round.
#[derive(Clone, Debug)]
pub struct NamedBarrierValue {
    names: FxHashSet<String>,
    seen: FxHashSet<String>,
}

impl NamedBarrierValue {
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            seen: FxHashSet::default(),
        }
    }

    fn ready(&self) -> bool {
        self.seen == self.names
    }

    fn mark(&mut self, values: Vec<Value>) -> Result<bool, ChannelError> {
        let mut changed = false;
        for value in values {
            let name = value.as_str().ok_or_else(|| {
                ChannelError::InvalidUpdate(format!("barrier update must be a member name, got {value}"))
            })?;
            if !self.names.contains(name) {
                return Err(ChannelError::InvalidUpdate(format!(
                    "`{name}` is not a member of this barrier"
                )));
            }
            changed |= self.seen.insert(name.to_string());
        }
        Ok(changed)
    }
}

impl Channel for NamedBarrierValue {
    fn kind(&self) -> ChannelKind {
        ChannelKind::NamedBarrier {
            names: sorted(&self.names),
        }
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool, ChannelError> {
        self.mark(values)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        if self.ready() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::EmptyChannel)
        }
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(Value::Array(
            sorted(&self.seen).into_iter().map(Value::String).collect(),
        ))
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        let seen = match snapshot {
            None => FxHashSet::default(),
            Some(snapshot) => seen_from_snapshot(&snapshot, "NamedBarrierValue")?,
        };
        Ok(Box::new(Self {
            names: self.names.clone(),
            seen,
        }))
    }

    fn consume(&mut self) -> bool {
        if self.ready() && !self.seen.is_empty() {
            self.seen.clear();
            true
        } else {
            false
        }
    }
}

/// A [`NamedBarrierValue`] readable only after the owning graph finishes.
///
/// Barrier progress is sticky: the seen-set is checkpointed, so a barrier
/// half-armed before an interrupt stays half-armed after restore.
#[derive(Clone, Debug)]
pub struct NamedBarrierValueAfterFinish {
    inner: NamedBarrierValue,
    finished: bool,
}

impl NamedBarrierValueAfterFinish {
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: NamedBarrierValue::new(names),
            finished: false,
        }
    }
}

impl Channel for NamedBarrierValueAfterFinish {
    fn kind(&self) -> ChannelKind {
        ChannelKind::NamedBarrierAfterFinish {
            names: sorted(&self.inner.names),
        }
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool, ChannelError> {
        self.inner.mark(values)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        if self.finished && self.inner.ready() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::EmptyChannel)
        }
    }

    fn checkpoint(&self) -> Option<Value> {
        Some(serde_json::json!({
            "seen": sorted(&self.inner.seen),
            "finished": self.finished,
        }))
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        let Some(snapshot) = snapshot else {
            return Ok(Box::new(Self {
                inner: NamedBarrierValue::new(sorted(&self.inner.names)),
                finished: false,
            }));
        };
        let seen = snapshot
            .get("seen")
            .ok_or_else(|| {
                ChannelError::Snapshot("NamedBarrierValueAfterFinish snapshot missing `seen`".into())
            })
            .and_then(|seen| seen_from_snapshot(seen, "NamedBarrierValueAfterFinish"))?;
        let finished = snapshot
            .get("finished")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                ChannelError::Snapshot(
                    "NamedBarrierValueAfterFinish snapshot missing `finished`".into(),
                )
            })?;
        Ok(Box::new(Self {
            inner: NamedBarrierValue {
                names: self.inner.names.clone(),
                seen,
            },
            finished,
        }))
    }

    fn consume(&mut self) -> bool {
        if self.finished && self.inner.ready() {
            self.inner.seen.clear();
            self.finished = false;
            true
        } else {
            false
        }
    }

    fn finish(&mut self) -> bool {
        if !self.finished {
            self.finished = true;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn barrier_opens_when_all_members_write() {
        let mut ch = NamedBarrierValue::new(["a", "b"]);
        assert!(ch.get().unwrap_err().is_empty());
        ch.update(vec![json!("a")]).unwrap();
        assert!(ch.get().is_err());
        ch.update(vec![json!("b")]).unwrap();
        assert_eq!(ch.get().unwrap(), Value::Null);
        assert!(ch.consume());
        assert!(ch.get().is_err());
    }

    #[test]
    fn barrier_rejects_unknown_member() {
        let mut ch = NamedBarrierValue::new(["a"]);
        assert!(ch.update(vec![json!("z")]).is_err());
        assert!(ch.update(vec![json!(7)]).is_err());
    }

    #[test]
    fn partial_barrier_survives_snapshot() {
        let mut ch = NamedBarrierValueAfterFinish::new(["a", "b"]);
        ch.update(vec![json!("a")]).unwrap();
        let restored = ch.from_snapshot(ch.checkpoint()).unwrap();
        assert!(restored.equals(&ch));
        assert!(restored.get().is_err());
    }

    #[test]
    fn after_finish_requires_finish_and_completion() {
        let mut ch = NamedBarrierValueAfterFinish::new(["a"]);
        ch.update(vec![json!("a")]).unwrap();
        assert!(ch.get().is_err());
        assert!(ch.finish());
        assert_eq!(ch.get().unwrap(), Value::Null);
    }
}
