pub mod document;
pub mod matcher;
pub mod search;
pub mod update;
pub mod storage;
pub mod persist;
pub mod config;
pub mod validation;
pub mod collection;
pub mod error;

pub use collection::{Collection, UpdateSummary};
pub use config::{CollectionOptions, OptionsOverlay};
pub use document::{Document, FieldValue, Truthy};
pub use error::{FlatDbError, Result};
pub use matcher::QueryValue;
pub use persist::Coalescer;
pub use search::Query;
pub use update::{Applied, Update, UpdateValue};
pub use validation::{ValidationResult, Validator};
