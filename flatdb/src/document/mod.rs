// Document model - ordered field maps, the absent marker, truthiness and equality

use serde_json::{Number, Value};

/// A single record: an ordered mapping from field names to values.
///
/// Field order is insertion order (`serde_json` is built with `preserve_order`).
/// A `Value` has no way to express "absent", so a stored document can never
/// carry an absent field at any depth.
pub type Document = serde_json::Map<String, Value>;

/// The value slot of a field: either a stored value or the absent marker.
///
/// Absent means "the field does not exist", which is distinct from a stored
/// `null`. Per-field transforms return this so they can delete a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Absent,
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            FieldValue::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            FieldValue::Absent => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

impl From<Option<Value>> for FieldValue {
    fn from(value: Option<Value>) -> Self {
        value.map_or(FieldValue::Absent, FieldValue::Value)
    }
}

impl From<Option<&Value>> for FieldValue {
    fn from(value: Option<&Value>) -> Self {
        value.cloned().into()
    }
}

/// Boolean coercion used by predicates and whole-document transforms.
///
/// `false`, `null`, zero, the empty string and the absent marker are falsy.
/// Everything else is truthy, including `"0"`, `[]` and `{}`.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl Truthy for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Truthy for &Value {
    fn is_truthy(&self) -> bool {
        (*self).is_truthy()
    }
}

impl<T: Truthy> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.as_ref().map_or(false, Truthy::is_truthy)
    }
}

impl Truthy for FieldValue {
    fn is_truthy(&self) -> bool {
        self.as_value().is_truthy()
    }
}

impl Truthy for &str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

macro_rules! truthy_int {
    ($($t:ty),*) => {
        $(impl Truthy for $t {
            fn is_truthy(&self) -> bool {
                *self != 0
            }
        })*
    };
}

truthy_int!(i32, i64, u32, u64, usize);

impl Truthy for f64 {
    fn is_truthy(&self) -> bool {
        *self != 0.0 && !self.is_nan()
    }
}

/// Strict equality between scalars: same kind and same value, no coercion.
/// Containers are never strictly equal to anything.
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::String(x), Value::String(y)) => x == y,
        _ => false,
    }
}

/// Structural equality. Arrays compare by length and position, objects by
/// field set and per-field value; leaves fall back to `strict_equals`.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equals(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| deep_equals(x, y)))
        }
        _ => strict_equals(a, b),
    }
}

// 1 and 1.0 are the same number
fn numbers_equal(x: &Number, y: &Number) -> bool {
    if x.is_f64() || y.is_f64() {
        x.as_f64() == y.as_f64()
    } else {
        x == y
    }
}

/// Drop a document that has no fields left. Returns `None` for an empty document.
pub fn normalize(document: Document) -> Option<Document> {
    if document.is_empty() {
        None
    } else {
        Some(document)
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
