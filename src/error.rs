use crate::history::ResolutionStatus;
use thiserror::Error;

/// A normalized event that cannot be analyzed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("event has an empty test name")]
    MissingTestName,

    #[error("event for '{0}' has neither a message nor a stack trace")]
    EmptyEvent(String),

    #[error("event for '{test_name}' has an unparseable timestamp '{timestamp}'")]
    InvalidTimestamp { test_name: String, timestamp: String },

    #[error("event belongs to '{found}' but the unit is '{expected}'")]
    ForeignEvent { expected: String, found: String },
}

/// Rule pack or configuration problems found at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rule pack {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule pack '{pack}': {reason}")]
    InvalidRule { pack: String, reason: String },

    #[error("generic rule pack is missing from {0}")]
    MissingGenericPack(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The history store cannot be reached.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Illegal pattern resolution change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown pattern {0}")]
    UnknownPattern(String),

    #[error("invalid resolution transition for {hash}: {from:?} -> {to:?}")]
    Invalid {
        hash: String,
        from: ResolutionStatus,
        to: ResolutionStatus,
    },
}
