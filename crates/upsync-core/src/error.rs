//! Error types for upsync-core

use thiserror::Error;

use crate::models::ResourceKey;

/// Result type alias using upsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in upsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource or change not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unsupported upload strategy or malformed configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A change was recorded after the resource was deleted locally
    #[error("Changes after deletion of resource {0} are not permitted")]
    ChangeAfterDeletion(ResourceKey),

    /// A change was recorded before the resource was created locally
    #[error("Changes before creation of resource {0} are not permitted")]
    ChangeBeforeCreation(ResourceKey),

    /// Change history that cannot be squashed for another reason
    #[error("Invalid change history for {key}: {reason}")]
    InvalidHistory { key: String, reason: String },

    /// Malformed or inapplicable JSON patch
    #[error("Invalid JSON patch: {0}")]
    InvalidPatch(String),

    /// A reference cycle that no request layout can satisfy
    #[error("Unresolvable reference cycle between {}: {reason}", .resources.join(", "))]
    UnresolvableCycle {
        resources: Vec<String>,
        reason: String,
    },

    /// Transaction response does not line up with the request entries
    #[error("Transaction response has {actual} entries, expected {expected}")]
    ResponseMismatch { expected: usize, actual: usize },

    /// Structured rejection from the server
    #[error("Server rejected {resource_type} upload: {diagnostics}")]
    Rejected {
        resource_type: String,
        diagnostics: String,
    },

    /// Response shape the uploader does not understand
    #[error("Unrecognized response for {resource_type} upload: {message}")]
    UnrecognizedResponse {
        resource_type: String,
        message: String,
    },

    /// Network or transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether the error reflects corrupted or inconsistent local data.
    ///
    /// These abort the cycle and will fail again until the store is repaired.
    pub const fn is_local_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChangeAfterDeletion(_)
                | Self::ChangeBeforeCreation(_)
                | Self::InvalidHistory { .. }
                | Self::InvalidPatch(_)
                | Self::ResponseMismatch { .. }
                | Self::UnresolvableCycle { .. }
        )
    }

    /// Whether a later upload cycle may succeed without local intervention.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Rejected { .. } | Self::UnrecognizedResponse { .. }
        )
    }
}
