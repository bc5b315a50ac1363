//! # Error Module
//!
//! Error taxonomy shared by every component of Trellis ORM.

use thiserror::Error;

/// Convenient alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure Trellis ORM can report.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or inconsistent metadata (unknown model, unknown relation, incomplete join table).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The row an operation expected to exist is not in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A predicate or terminal operation was issued before a table was bound.
    #[error("table not set")]
    TableNotSet,

    /// The operation is invalid in the current state (nested transaction, missing key, ...).
    #[error("invalid state: {0}")]
    State(String),

    /// A failure that happened while cascading through a relation.
    #[error("cascade failed at `{path}`: {source}")]
    Cascade {
        path: String,
        #[source]
        source: Box<Error>,
    },

    /// A stored value could not be converted into the requested Rust type.
    #[error("cannot decode field `{field}`: {message}")]
    Decode { field: String, message: String },

    /// Failure reported by the underlying store.
    #[error(transparent)]
    Store(#[from] sqlx::Error),

    /// JSON conversion failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub(crate) fn decode(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode { field: field.into(), message: message.into() }
    }

    /// A fresh copy of a sticky session error. Store and JSON errors are not `Clone`
    /// and come back as their message.
    pub(crate) fn replay(&self) -> Self {
        match self {
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::TableNotSet => Self::TableNotSet,
            Self::State(m) => Self::State(m.clone()),
            Self::Decode { field, message } => Self::decode(field.clone(), message.clone()),
            other => Self::State(other.to_string()),
        }
    }

    /// Wraps this error with the relation path it happened on.
    pub fn at(self, path: impl Into<String>) -> Self {
        Self::Cascade { path: path.into(), source: Box::new(self) }
    }
}
