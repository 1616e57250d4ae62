// Update engine - computes a document's next state from a patch or transform

use crate::document::{self, type_name, Document, FieldValue, Truthy};
use crate::error::{FlatDbError, Result};
use serde_json::Value;
use std::fmt;

type FieldTransform = Box<dyn Fn(Option<&Value>) -> FieldValue>;
type DocumentTransform = Box<dyn Fn(Document) -> Value>;

/// What to do with one field of a field-map update.
pub enum UpdateValue {
    /// Assign this value.
    Set(Value),
    /// Remove the field.
    Unset,
    /// Compute the replacement from the current value (`None` when absent).
    /// Returning [`FieldValue::Absent`] removes the field.
    Transform(FieldTransform),
}

impl UpdateValue {
    pub fn transform<F, R>(f: F) -> Self
    where
        F: Fn(Option<&Value>) -> R + 'static,
        R: Into<FieldValue>,
    {
        UpdateValue::Transform(Box::new(move |current| f(current).into()))
    }
}

impl From<Value> for UpdateValue {
    fn from(value: Value) -> Self {
        UpdateValue::Set(value)
    }
}

/// A declarative patch or a whole-document transform.
pub enum Update {
    Fields(Vec<(String, UpdateValue)>),
    /// Receives a copy of the document. A falsy result deletes the document,
    /// an object replaces it, anything else is a type error.
    Transform(DocumentTransform),
}

/// The outcome of applying an update to one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Replace(Document),
    Delete,
}

impl Update {
    pub fn new() -> Self {
        Update::Fields(Vec::new())
    }

    pub fn set(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(name, UpdateValue::Set(value.into()))
    }

    pub fn unset(self, name: impl Into<String>) -> Self {
        self.with(name, UpdateValue::Unset)
    }

    /// Replace a field with the result of `f` applied to its current value.
    pub fn modify<F, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>) -> R + 'static,
        R: Into<FieldValue>,
    {
        self.with(name, UpdateValue::transform(f))
    }

    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(Document) -> Value + 'static,
    {
        Update::Transform(Box::new(f))
    }

    /// Build a field-map update that assigns every field of a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Update::Fields(
                map.into_iter().map(|(k, v)| (k, UpdateValue::Set(v))).collect(),
            )),
            other => Err(FlatDbError::Malformed(format!(
                "update must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    fn with(self, name: impl Into<String>, value: UpdateValue) -> Self {
        let mut fields = match self {
            Update::Fields(fields) => fields,
            Update::Transform(_) => {
                log::warn!("Field update replaces a document transform");
                Vec::new()
            }
        };
        fields.push((name.into(), value));
        Update::Fields(fields)
    }
}

impl Default for Update {
    fn default() -> Self {
        Update::new()
    }
}

impl fmt::Debug for UpdateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateValue::Set(v) => write!(f, "Set({v})"),
            UpdateValue::Unset => write!(f, "Unset"),
            UpdateValue::Transform(_) => write!(f, "Transform(..)"),
        }
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Fields(fields) => f
                .debug_map()
                .entries(fields.iter().map(|(k, v)| (k, v)))
                .finish(),
            Update::Transform(_) => write!(f, "Transform(..)"),
        }
    }
}

/// Apply `update` to a copy of `document`.
///
/// The input is never modified. A result with no fields left is reported as
/// [`Applied::Delete`], so an empty document never reaches the collection.
pub fn apply(document: &Document, update: &Update) -> Result<Applied> {
    let mut working = document.clone();

    match update {
        Update::Transform(transform) => match transform(working) {
            result if !result.is_truthy() => return Ok(Applied::Delete),
            Value::Object(map) => working = map,
            other => {
                return Err(FlatDbError::Malformed(format!(
                    "document transform must return an object, got {}",
                    type_name(&other)
                )))
            }
        },
        Update::Fields(fields) => {
            for (name, value) in fields {
                let replacement = match value {
                    UpdateValue::Set(v) => FieldValue::Value(v.clone()),
                    UpdateValue::Unset => FieldValue::Absent,
                    UpdateValue::Transform(f) => f(working.get(name)),
                };
                match replacement {
                    FieldValue::Value(v) => {
                        working.insert(name.clone(), v);
                    }
                    FieldValue::Absent => {
                        working.shift_remove(name);
                    }
                }
            }
        }
    }

    Ok(document::normalize(working).map_or(Applied::Delete, Applied::Replace))
}
