use crate::config::CollectionOptions;
use crate::document::Document;
use crate::error::{FlatDbError, Result};
use crate::persist::Coalescer;
use crate::search::{self, Query};
use crate::storage;
use crate::update::{self, Applied, Update};
use crate::validation::{self, Validator};
use std::path::Path;

/// Counts reported by [`Collection::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub matched: usize,
    pub replaced: usize,
    pub deleted: usize,
}

/// An in-memory collection of documents, optionally mirrored to a file.
///
/// Mutations run one at a time on the caller's thread. When autosave is on,
/// every mutation hands a fresh snapshot to the [`Coalescer`], which writes
/// it in the background (or immediately when write coalescing is off).
/// Callers only ever get copies of stored documents.
pub struct Collection {
    documents: Vec<Document>,
    options: CollectionOptions,
    validator: Option<Box<dyn Validator>>,
    persister: Coalescer,
}

impl Collection {
    /// Open a collection. Loads the storage file when `autoload` is set and a
    /// path is configured; a malformed file fails the open.
    pub fn open(options: CollectionOptions) -> Result<Self> {
        let documents = match (&options.path, options.autoload) {
            (Some(path), true) => storage::read_snapshot(path)?,
            _ => Vec::new(),
        };

        if let Some(path) = &options.path {
            log::debug!("Opened {} with {} documents", path.display(), documents.len());
        }

        Ok(Collection {
            documents,
            options,
            validator: None,
            persister: Coalescer::new(),
        })
    }

    /// A collection with no storage file.
    pub fn in_memory() -> Self {
        Collection {
            documents: Vec::new(),
            options: CollectionOptions::default(),
            validator: None,
            persister: Coalescer::new(),
        }
    }

    /// Run `validator` on every document before it is inserted or replaced.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Use a specific coalescer, e.g. one shared by several collections.
    pub fn with_persister(mut self, persister: Coalescer) -> Self {
        self.persister = persister;
        self
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn path(&self) -> Option<&Path> {
        self.options.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Every stored document, in order.
    pub fn documents(&self) -> Vec<Document> {
        self.documents.clone()
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn find(&self, query: &Query) -> Vec<Document> {
        if query.is_match_all() {
            return self.documents();
        }
        search::search(query, &self.documents)
            .into_iter()
            .map(|pos| self.documents[pos].clone())
            .collect()
    }

    pub fn find_one(&self, query: &Query) -> Option<Document> {
        if query.is_match_all() {
            return self.documents.first().cloned();
        }
        search::search(query, &self.documents)
            .first()
            .map(|&pos| self.documents[pos].clone())
    }

    pub fn count(&self, query: &Query) -> usize {
        if query.is_match_all() {
            return self.documents.len();
        }
        search::search(query, &self.documents).len()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert one document at the end of the collection.
    pub fn insert(&mut self, document: Document) -> Result<()> {
        self.prepare(&document)?;
        let mut next = self.documents.clone();
        next.push(document);
        self.commit(next)
    }

    /// Insert several documents. Every document is checked before any is
    /// stored, so a bad one leaves the collection unchanged.
    pub fn insert_many(&mut self, documents: Vec<Document>) -> Result<usize> {
        for document in &documents {
            self.prepare(document)?;
        }
        let inserted = documents.len();
        if inserted == 0 {
            return Ok(0);
        }
        let mut next = self.documents.clone();
        next.extend(documents);
        self.commit(next)?;
        Ok(inserted)
    }

    /// Apply `update` to every document matching `query`.
    ///
    /// All results are computed, validated and written before the collection
    /// changes; an error leaves it untouched. Documents the update empties or
    /// deletes are removed, and the rest keep their order.
    pub fn update(&mut self, query: &Query, update: &Update) -> Result<UpdateSummary> {
        let positions = self.positions(query);

        let mut results = Vec::with_capacity(positions.len());
        for &pos in &positions {
            let applied = update::apply(&self.documents[pos], update)?;
            if let Applied::Replace(document) = &applied {
                self.validate(document)?;
            }
            results.push((pos, applied));
        }

        let mut summary = UpdateSummary {
            matched: positions.len(),
            ..Default::default()
        };
        if results.is_empty() {
            return Ok(summary);
        }

        let mut next = self.documents.clone();
        let mut deleted = vec![false; next.len()];
        for (pos, applied) in results {
            match applied {
                Applied::Replace(document) => {
                    next[pos] = document;
                    summary.replaced += 1;
                }
                Applied::Delete => {
                    deleted[pos] = true;
                    summary.deleted += 1;
                }
            }
        }
        if summary.deleted > 0 {
            compact(&mut next, &deleted);
        }

        self.commit(next)?;
        Ok(summary)
    }

    /// Remove every document matching `query`. Returns how many were removed.
    pub fn remove(&mut self, query: &Query) -> Result<usize> {
        let positions = self.positions(query);
        if positions.is_empty() {
            return Ok(0);
        }

        let mut deleted = vec![false; self.documents.len()];
        for &pos in &positions {
            deleted[pos] = true;
        }
        let mut next = self.documents.clone();
        compact(&mut next, &deleted);

        self.commit(next)?;
        Ok(positions.len())
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Re-read the storage file. Waits for this collection's outstanding
    /// writes first. A malformed file leaves the collection as it was.
    pub fn reload(&mut self) -> Result<()> {
        let path = self.require_path()?;
        self.persister.flush(path)?;
        let documents = storage::read_snapshot(path)?;
        self.documents = documents;
        Ok(())
    }

    /// Write the current snapshot and wait for the write to finish.
    pub fn save(&self) -> Result<()> {
        let path = self.require_path()?;
        let snapshot = storage::serialize_snapshot(&self.documents, self.options.pretty)?;
        self.persister.persist_sync(path, snapshot)
    }

    /// Wait for any background write of this collection's file to finish.
    pub fn flush(&self) -> Result<()> {
        match self.path() {
            Some(path) => self.persister.flush(path),
            None => Ok(()),
        }
    }

    /// Autosave `next`, then make it the collection's contents.
    /// If the write cannot be made or scheduled nothing changes.
    fn commit(&mut self, next: Vec<Document>) -> Result<()> {
        self.autosave(&next)?;
        self.documents = next;
        Ok(())
    }

    fn autosave(&self, documents: &[Document]) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if !self.options.autosave {
            return Ok(());
        }

        let snapshot = storage::serialize_snapshot(documents, self.options.pretty)?;
        if self.options.coalesce_writes {
            self.persister.persist(path, snapshot)
        } else {
            self.persister.persist_sync(path, snapshot)
        }
    }

    fn require_path(&self) -> Result<&Path> {
        self.path()
            .ok_or_else(|| FlatDbError::Other("Collection has no storage path".into()))
    }

    fn positions(&self, query: &Query) -> Vec<usize> {
        if query.is_match_all() {
            return (0..self.documents.len()).collect();
        }
        search::search(query, &self.documents)
    }

    fn prepare(&self, document: &Document) -> Result<()> {
        if document.is_empty() {
            return Err(FlatDbError::Malformed(
                "cannot insert an empty document".into(),
            ));
        }
        self.validate(document)
    }

    fn validate(&self, document: &Document) -> Result<()> {
        if let Some(validator) = &self.validator {
            validation::check(validator.as_ref(), document, self.options.strict_validation)?;
        }
        Ok(())
    }
}

fn compact(documents: &mut Vec<Document>, deleted: &[bool]) {
    let mut index = 0;
    documents.retain(|_| {
        let keep = !deleted[index];
        index += 1;
        keep
    });
}

impl Drop for Collection {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Pending write failed while closing collection: {e}");
        }
    }
}
