use crate::error::{FlatDbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for a single collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionOptions {
    /// Storage file. `None` keeps the collection in memory only.
    pub path: Option<PathBuf>,
    /// Read the storage file when the collection is opened.
    pub autoload: bool,
    /// Write a snapshot after every mutating operation.
    pub autosave: bool,
    /// Hand autosave snapshots to the coalescer instead of waiting for each write.
    pub coalesce_writes: bool,
    /// Indent the storage file.
    pub pretty: bool,
    /// Reject documents with validation errors instead of only logging them.
    pub strict_validation: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            path: None,
            autoload: true,
            autosave: true,
            coalesce_writes: true,
            pretty: false,
            strict_validation: true,
        }
    }
}

impl CollectionOptions {
    /// Options for a collection stored at `path`, everything else default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        CollectionOptions {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Apply every field the overlay sets, keeping ours for the rest.
    pub fn merge(mut self, overlay: &OptionsOverlay) -> Self {
        if let Some(path) = &overlay.path {
            self.path = Some(path.clone());
        }
        if let Some(v) = overlay.autoload {
            self.autoload = v;
        }
        if let Some(v) = overlay.autosave {
            self.autosave = v;
        }
        if let Some(v) = overlay.coalesce_writes {
            self.coalesce_writes = v;
        }
        if let Some(v) = overlay.pretty {
            self.pretty = v;
        }
        if let Some(v) = overlay.strict_validation {
            self.strict_validation = v;
        }
        self
    }

    /// Defaults, then the config file (if any), then explicit overrides.
    pub fn resolve(config_file: Option<&Path>, overrides: &OptionsOverlay) -> Result<Self> {
        let mut options = CollectionOptions::default();
        if let Some(file) = config_file {
            options = options.merge(&OptionsOverlay::from_file(file)?);
        }
        Ok(options.merge(overrides))
    }
}

/// A partial set of options, as read from a config file or the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsOverlay {
    pub path: Option<PathBuf>,
    pub autoload: Option<bool>,
    pub autosave: Option<bool>,
    pub coalesce_writes: Option<bool>,
    pub pretty: Option<bool>,
    pub strict_validation: Option<bool>,
}

impl OptionsOverlay {
    /// Parse a YAML (or JSON) config file. A relative `path` inside it is
    /// taken relative to the config file's directory.
    pub fn from_file(file: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(file)?;
        let mut overlay = Self::parse(&content)
            .map_err(|e| FlatDbError::Config(format!("{}: {e}", file.display())))?;

        if let Some(path) = overlay.path.as_mut() {
            if path.is_relative() {
                if let Some(dir) = file.parent() {
                    *path = dir.join(&*path);
                }
            }
        }
        Ok(overlay)
    }

    /// Parse config text. Empty text is an empty overlay.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(OptionsOverlay::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}
