//! Plain values accepted by the graph and their mapping onto Loro values.

use loro::LoroValue;
use serde_json::{Map, Number, Value};
use smol_str::SmolStr;

use crate::error::AttachError;
use crate::model::ModelType;

/// Discriminator field naming the model an object belongs to.
pub const MODEL_KEY: &str = "@";
/// Field recording the version a model instance (or the root state) is at.
pub const VERSION_KEY: &str = ":version";

/// A leaf value. Absent values are represented by the key not existing.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(Number),
    String(SmolStr),
}

impl Primitive {
    pub fn to_json(&self) -> Value {
        match self {
            Primitive::Null => Value::Null,
            Primitive::Bool(b) => Value::Bool(*b),
            Primitive::Number(n) => Value::Number(n.clone()),
            Primitive::String(s) => Value::String(s.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Primitive::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Primitive::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    /// The number as the document stores it: integral values that fit in
    /// an `i64` stay exact, everything else becomes an `f64`.
    pub(crate) fn number(n: Number) -> Result<Self, AttachError> {
        Primitive::from_loro(&Primitive::Number(n).to_loro())
    }

    pub(crate) fn to_loro(&self) -> LoroValue {
        match self {
            Primitive::Null => LoroValue::Null,
            Primitive::Bool(b) => LoroValue::Bool(*b),
            Primitive::Number(n) => match n.as_i64() {
                Some(i) => LoroValue::I64(i),
                None => LoroValue::Double(n.as_f64().unwrap_or_default()),
            },
            Primitive::String(s) => LoroValue::from(s.as_str()),
        }
    }

    /// Convert a scalar Loro value. Binary values and non-finite doubles
    /// have no plain-data representation.
    pub(crate) fn from_loro(value: &LoroValue) -> Result<Self, AttachError> {
        match value {
            LoroValue::Null => Ok(Primitive::Null),
            LoroValue::Bool(b) => Ok(Primitive::Bool(*b)),
            LoroValue::I64(i) => Ok(Primitive::Number(Number::from(*i))),
            LoroValue::Double(d) => Number::from_f64(*d).map(Primitive::Number).ok_or_else(|| {
                AttachError::UnsupportedValue {
                    kind: "non-finite number".into(),
                }
            }),
            LoroValue::String(s) => Ok(Primitive::String(SmolStr::new(&**s))),
            LoroValue::Binary(_) => Err(AttachError::UnsupportedValue {
                kind: "binary".into(),
            }),
            LoroValue::List(_) | LoroValue::Map(_) | LoroValue::Container(_) => {
                Err(AttachError::UnsupportedValue {
                    kind: "inline composite value".into(),
                })
            }
        }
    }
}

/// Deep plain-data view of a Loro value, used for comparisons and logging.
pub(crate) fn loro_to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null | LoroValue::Container(_) => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(i) => Value::from(*i),
        LoroValue::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::Binary(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
        LoroValue::List(items) => Value::Array(items.iter().map(loro_to_json).collect()),
        LoroValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), loro_to_json(v)))
                .collect(),
        ),
    }
}

impl From<Primitive> for Value {
    fn from(p: Primitive) -> Self {
        p.to_json()
    }
}

/// Something that can be assigned into the graph.
#[derive(Debug, Clone)]
pub enum Input {
    /// Plain data. Objects carrying `"@"` are treated as reloaded model
    /// instances and versioned on hydration.
    Json(Value),
    /// A freshly constructed model instance. Stamped with its name and the
    /// latest declared version; no migration runs.
    Fresh { name: SmolStr, fields: Map<String, Value> },
}

impl Input {
    pub fn fresh(name: impl Into<SmolStr>, fields: Map<String, Value>) -> Self {
        Input::Fresh {
            name: name.into(),
            fields,
        }
    }

    /// Fresh instance of a typed model.
    pub fn model<T: ModelType>(fields: Map<String, Value>) -> Self {
        Input::fresh(T::NAME, fields)
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Json(v)
    }
}

impl From<Primitive> for Input {
    fn from(p: Primitive) -> Self {
        Input::Json(p.to_json())
    }
}

macro_rules! input_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Input {
            fn from(v: $t) -> Self {
                Input::Json(Value::from(v))
            }
        })*
    };
}

input_from!(bool, i32, i64, u32, u64, f64, String, &str);
