use std::sync::Arc;

use serde_json::{Map, Value};

use super::{BoxedChannel, Channel, ChannelError, ChannelKind};

/// Deterministic `(current, update) -> current` reduction.
///
/// Operators must be associative wherever the owning channel can be written
/// by more than one task in a single superstep, because write application
/// order inside a step is not observable. The `name` identifies the operator
/// in declaration-equality checks and in persisted channel kinds.
pub trait BinaryOperator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fold one update into the current value.
    ///
    /// # Errors
    ///
    /// [`ChannelError::InvalidUpdate`] when the payload shapes are not
    /// reducible by this operator.
    fn apply(&self, current: Value, update: Value) -> Result<Value, ChannelError>;
}

/// Channel whose value is `reduce(current, update)` under a user-supplied
/// associative operator, with an optional default seeding the fold.
pub struct BinaryOperatorAggregate {
    operator: Arc<dyn BinaryOperator>,
    default: Option<Value>,
    value: Option<Value>,
}

impl BinaryOperatorAggregate {
    #[must_use]
    pub fn new(operator: Arc<dyn BinaryOperator>, default: Option<Value>) -> Self {
        Self {
            operator,
            default,
            value: None,
        }
    }
}

impl std::fmt::Debug for BinaryOperatorAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorAggregate")
            .field("operator", &self.operator.name())
            .field("default", &self.default)
            .field("value", &self.value)
            .finish()
    }
}

impl Channel for BinaryOperatorAggregate {
    fn kind(&self) -> ChannelKind {
        ChannelKind::BinaryOperatorAggregate {
            operator: self.operator.name().to_string(),
            default: self.default.clone(),
        }
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool, ChannelError> {
        if values.is_empty() {
            return Ok(false);
        }
        let mut iter = values.into_iter();
        let mut current = match self.value.take().or_else(|| self.default.clone()) {
            Some(current) => current,
            None => match iter.next() {
                Some(first) => first,
                None => return Ok(false),
            },
        };
        for update in iter {
            current = self.operator.apply(current, update)?;
        }
        self.value = Some(current);
        Ok(true)
    }

    fn get(&self) -> Result<Value, ChannelError> {
        self.value
            .clone()
            .or_else(|| self.default.clone())
            .ok_or(ChannelError::EmptyChannel)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_snapshot(&self, snapshot: Option<Value>) -> Result<BoxedChannel, ChannelError> {
        Ok(Box::new(Self {
            operator: Arc::clone(&self.operator),
            default: self.default.clone(),
            value: snapshot,
        }))
    }
}

/// Numeric addition over JSON numbers. Integer arithmetic is preserved until
/// either side is a float.
pub struct Sum;

impl BinaryOperator for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn apply(&self, current: Value, update: Value) -> Result<Value, ChannelError> {
        match (current.as_i64(), update.as_i64()) {
            (Some(a), Some(b)) => Ok(Value::from(a + b)),
            _ => {
                let a = current.as_f64().ok_or_else(|| {
                    ChannelError::InvalidUpdate(format!("sum: non-numeric current {current}"))
                })?;
                let b = update.as_f64().ok_or_else(|| {
                    ChannelError::InvalidUpdate(format!("sum: non-numeric update {update}"))
                })?;
                Ok(Value::from(a + b))
            }
        }
    }
}

/// Array concatenation. Non-array operands are treated as single-element
/// lists, so `concat([1], 2)` yields `[1, 2]`.
pub struct Concat;

impl BinaryOperator for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn apply(&self, current: Value, update: Value) -> Result<Value, ChannelError> {
        let mut items = match current {
            Value::Array(items) => items,
            other => vec![other],
        };
        match update {
            Value::Array(mut more) => items.append(&mut more),
            other => items.push(other),
        }
        Ok(Value::Array(items))
    }
}

/// Shallow JSON-object merge; update keys overwrite current keys.
pub struct MapMerge;

impl BinaryOperator for MapMerge {
    fn name(&self) -> &'static str {
        "map_merge"
    }

    fn apply(&self, current: Value, update: Value) -> Result<Value, ChannelError> {
        let mut base = match current {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ChannelError::InvalidUpdate(format!(
                    "map_merge: non-object current {other}"
                )));
            }
        };
        match update {
            Value::Object(map) => {
                for (key, value) in map {
                    base.insert(key, value);
                }
                Ok(Value::Object(base))
            }
            other => Err(ChannelError::InvalidUpdate(format!(
                "map_merge: non-object update {other}"
            ))),
        }
    }
}
