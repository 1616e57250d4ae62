use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlatDbError {
    /// A query, update, or transform result of the wrong shape.
    #[error("Type error: {0}")]
    Malformed(String),

    /// The storage file is not a JSON array of objects.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FlatDbError>;
