// Value matcher - decides whether one field value satisfies one query value

use crate::document::{deep_equals, strict_equals, Truthy};
use regex::Regex;
use serde_json::Value;
use std::fmt;

type FieldPredicate = Box<dyn Fn(Option<&Value>) -> bool>;

/// The right-hand side of one field in a structural query.
///
/// The shape is resolved once when the query is built; matching is an
/// exhaustive match over these variants.
pub enum QueryValue {
    /// A scalar compared by strict equality.
    Literal(Value),
    /// A regular expression tested against string fields only.
    Pattern(Regex),
    /// A predicate over the field value (`None` when the field is absent).
    Predicate(FieldPredicate),
    /// An array or object compared by deep equality.
    Structure(Value),
    /// The field must not exist.
    Absent,
}

impl QueryValue {
    /// Build a predicate query value. The result is coerced with [`Truthy`].
    pub fn predicate<F, R>(f: F) -> Self
    where
        F: Fn(Option<&Value>) -> R + 'static,
        R: Truthy,
    {
        QueryValue::Predicate(Box::new(move |value| f(value).is_truthy()))
    }

    pub fn pattern(pattern: &str) -> crate::Result<Self> {
        Ok(QueryValue::Pattern(Regex::new(pattern)?))
    }
}

impl From<Value> for QueryValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(_) | Value::Object(_) => QueryValue::Structure(value),
            scalar => QueryValue::Literal(scalar),
        }
    }
}

impl From<Regex> for QueryValue {
    fn from(regex: Regex) -> Self {
        QueryValue::Pattern(regex)
    }
}

macro_rules! literal_from {
    ($($t:ty),*) => {
        $(impl From<$t> for QueryValue {
            fn from(value: $t) -> Self {
                QueryValue::from(Value::from(value))
            }
        })*
    };
}

literal_from!(bool, i32, i64, u32, u64, f64, String, &str);

impl fmt::Debug for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Literal(v) => write!(f, "Literal({v})"),
            QueryValue::Pattern(re) => write!(f, "Pattern(/{}/)", re.as_str()),
            QueryValue::Predicate(_) => write!(f, "Predicate(..)"),
            QueryValue::Structure(v) => write!(f, "Structure({v})"),
            QueryValue::Absent => write!(f, "Absent"),
        }
    }
}

/// Whether `value` (the document's field, `None` when absent) satisfies `query`.
pub fn matches(query: &QueryValue, value: Option<&Value>) -> bool {
    match (query, value) {
        (QueryValue::Literal(expected), Some(actual)) => strict_equals(expected, actual),
        (QueryValue::Predicate(predicate), value) => predicate(value),
        (QueryValue::Pattern(re), Some(Value::String(s))) => re.is_match(s),
        (QueryValue::Structure(expected), Some(actual)) => deep_equals(expected, actual),
        (QueryValue::Absent, value) => value.is_none(),
        _ => false,
    }
}
