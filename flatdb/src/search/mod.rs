// Search engine - full-scan resolution of a query to document positions

use crate::document::{type_name, Document, Truthy};
use crate::error::{FlatDbError, Result};
use crate::matcher::{self, QueryValue};
use serde_json::Value;
use std::fmt;

type DocumentPredicate = Box<dyn Fn(&Document) -> bool>;

/// A query over a collection: either a per-field structural match or a
/// predicate over the whole document.
pub enum Query {
    /// Field name to query value, evaluated in this order. No fields matches everything.
    Fields(Vec<(String, QueryValue)>),
    Predicate(DocumentPredicate),
}

impl Query {
    /// An empty field query, which matches every document.
    pub fn new() -> Self {
        Query::Fields(Vec::new())
    }

    pub fn all() -> Self {
        Query::new()
    }

    /// Add a field constraint. Fields added to a predicate query turn it into a field query.
    pub fn field(self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        let mut fields = match self {
            Query::Fields(fields) => fields,
            Query::Predicate(_) => {
                log::warn!("Field constraint replaces a predicate query");
                Vec::new()
            }
        };
        fields.push((name.into(), value.into()));
        Query::Fields(fields)
    }

    /// Require that a field does not exist.
    pub fn missing(self, name: impl Into<String>) -> Self {
        self.field(name, QueryValue::Absent)
    }

    /// A query decided by a predicate over the whole document.
    pub fn filter<F, R>(f: F) -> Self
    where
        F: Fn(&Document) -> R + 'static,
        R: Truthy,
    {
        Query::Predicate(Box::new(move |doc| f(doc).is_truthy()))
    }

    /// Build a field query from a JSON object. Each value is resolved to a
    /// literal or structural match; `null` means "field is null", not "missing".
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Query::Fields(
                map.into_iter().map(|(k, v)| (k, QueryValue::from(v))).collect(),
            )),
            Value::Null => Ok(Query::all()),
            other => Err(FlatDbError::Malformed(format!(
                "query must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Whether this query matches every document without looking at it.
    pub fn is_match_all(&self) -> bool {
        matches!(self, Query::Fields(fields) if fields.is_empty())
    }
}

impl Default for Query {
    fn default() -> Self {
        Query::new()
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Fields(fields) => f
                .debug_map()
                .entries(fields.iter().map(|(k, v)| (k, v)))
                .finish(),
            Query::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Resolve `query` against `documents`, returning matching positions in order.
///
/// Field queries narrow a candidate set one field at a time: the first field
/// scans every document, later fields only re-check the survivors, and the
/// scan stops as soon as nothing is left.
pub fn search(query: &Query, documents: &[Document]) -> Vec<usize> {
    match query {
        Query::Predicate(predicate) => documents
            .iter()
            .enumerate()
            .filter(|(_, doc)| predicate(*doc))
            .map(|(pos, _)| pos)
            .collect(),
        Query::Fields(fields) => {
            let mut fields = fields.iter();
            let Some((name, value)) = fields.next() else {
                return (0..documents.len()).collect();
            };

            let mut positions: Vec<usize> = documents
                .iter()
                .enumerate()
                .filter(|(_, doc)| matcher::matches(value, doc.get(name)))
                .map(|(pos, _)| pos)
                .collect();

            for (name, value) in fields {
                if positions.is_empty() {
                    break;
                }
                positions.retain(|&pos| matcher::matches(value, documents[pos].get(name)));
            }

            positions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn docs() -> Vec<Document> {
        [
            json!({"name": "alice", "age": 31, "role": "admin"}),
            json!({"name": "bob", "age": 25}),
            json!({"name": "carol", "age": 31, "role": "member", "tags": ["x", "y"]}),
            json!({"name": "dave", "age": null, "address": {"city": "Oslo"}}),
        ]
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        })
        .collect()
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let docs = docs();
        assert_eq!(search(&Query::all(), &docs), vec![0, 1, 2, 3]);
        assert_eq!(search(&Query::all(), &[]), Vec::<usize>::new());
        assert!(Query::all().is_match_all());
        assert!(Query::from_json(Value::Null).unwrap().is_match_all());
    }

    #[test]
    fn test_single_field_literal() {
        let docs = docs();
        assert_eq!(search(&Query::new().field("age", 31), &docs), vec![0, 2]);
        assert_eq!(search(&Query::new().field("age", Value::Null), &docs), vec![3]);
        assert_eq!(search(&Query::new().field("age", "31"), &docs), Vec::<usize>::new());
    }

    #[test]
    fn test_missing_field_matches_absent_marker() {
        let docs = docs();
        assert_eq!(search(&Query::new().missing("role"), &docs), vec![1, 3]);
        // Literal against a missing field never matches
        assert_eq!(search(&Query::new().field("role", Value::Null), &docs), Vec::<usize>::new());
    }

    #[test]
    fn test_nested_and_pattern_fields() {
        let docs = docs();
        let q = Query::new().field("address", json!({"city": "Oslo"}));
        assert_eq!(search(&q, &docs), vec![3]);

        let q = Query::new().field("tags", json!(["x", "y"]));
        assert_eq!(search(&q, &docs), vec![2]);

        let q = Query::new().field("name", QueryValue::pattern("^[ab]").unwrap());
        assert_eq!(search(&q, &docs), vec![0, 1]);
    }

    #[test]
    fn test_multi_field_is_conjunction_in_any_order() {
        let docs = docs();
        let a = Query::new().field("age", 31).field("role", "member");
        let b = Query::new().field("role", "member").field("age", 31);
        assert_eq!(search(&a, &docs), vec![2]);
        assert_eq!(search(&a, &docs), search(&b, &docs));

        let age = search(&Query::new().field("age", 31), &docs);
        let role = search(&Query::new().field("role", "member"), &docs);
        let both: Vec<usize> = age.into_iter().filter(|p| role.contains(p)).collect();
        assert_eq!(search(&a, &docs), both);
    }

    #[test]
    fn test_stops_once_candidates_are_exhausted() {
        let docs = docs();
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let q = Query::new().field("name", "nobody").field(
            "age",
            QueryValue::predicate(move |_: Option<&Value>| {
                *counter.borrow_mut() += 1;
                true
            }),
        );
        assert_eq!(search(&q, &docs), Vec::<usize>::new());
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_later_fields_only_check_survivors() {
        let docs = docs();
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let q = Query::new().field("age", 31).field(
            "name",
            QueryValue::predicate(move |_: Option<&Value>| {
                *counter.borrow_mut() += 1;
                true
            }),
        );
        assert_eq!(search(&q, &docs), vec![0, 2]);
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn test_document_predicate_visits_every_document_in_order() {
        let docs = docs();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let q = Query::filter(move |doc: &Document| {
            log.borrow_mut().push(doc["name"].clone());
            doc.get("age").cloned()
        });
        assert_eq!(search(&q, &docs), vec![0, 1, 2]);
        assert_eq!(
            *seen.borrow(),
            vec![json!("alice"), json!("bob"), json!("carol"), json!("dave")]
        );
    }

    #[test]
    fn test_from_json() {
        let docs = docs();
        let q = Query::from_json(json!({"age": 31, "role": "admin"})).unwrap();
        assert_eq!(search(&q, &docs), vec![0]);

        let err = Query::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, FlatDbError::Malformed(_)));
    }
}
