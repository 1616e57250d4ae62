// Storage file format - JSON array snapshots and atomic whole-file replace

use crate::document::{self, type_name, Document};
use crate::error::{FlatDbError, Result};
use serde_json::Value;
use std::io::{self, Write};
use std::path::Path;

/// Parse the contents of a storage file into a collection.
///
/// Empty or whitespace-only content is an empty collection. Otherwise the
/// content must be a JSON array of objects; empty objects are dropped.
pub fn parse_snapshot(content: &str) -> Result<Vec<Document>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let parsed = serde_json::from_str::<Value>(content)
        .map_err(|e| FlatDbError::Format(format!("invalid JSON: {e}")))?;
    let items = match parsed {
        Value::Array(items) => items,
        other => {
            return Err(FlatDbError::Format(format!(
                "expected a JSON array of documents, got {}",
                type_name(&other)
            )))
        }
    };

    let mut documents = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => documents.extend(document::normalize(map)),
            other => {
                return Err(FlatDbError::Format(format!(
                    "element {index} is not an object (got {})",
                    type_name(&other)
                )))
            }
        }
    }

    Ok(documents)
}

/// Serialize a collection to the storage format.
pub fn serialize_snapshot(documents: &[Document], pretty: bool) -> Result<String> {
    let text = if pretty {
        serde_json::to_string_pretty(documents)?
    } else {
        serde_json::to_string(documents)?
    };
    Ok(text)
}

/// Read and parse a storage file. A file that does not exist yet is an empty collection.
pub fn read_snapshot(path: &Path) -> Result<Vec<Document>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_snapshot(&content).map_err(|e| match e {
            FlatDbError::Format(msg) => FlatDbError::Format(format!("{}: {msg}", path.display())),
            other => other,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No storage file at {}, starting empty", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace the file at `path` with `contents`.
///
/// The data goes to a temp file in the same directory, is synced, and is then
/// renamed over the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
