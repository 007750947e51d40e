//! Error types for the dialogue core

use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while loading catalogs or resolving dialogue transitions
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Catalog file not found: {0}")]
    CatalogNotFound(String),

    #[error("Catalog parse error in {path}: {source}")]
    CatalogParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown goal: {0}")]
    UnknownGoal(String),

    #[error("Terminal goal {goal} has no transition for intent {intent}")]
    MissingTerminalTransition { goal: String, intent: String },

    #[error("Goal {0} has no parameters")]
    EmptyGoal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}
