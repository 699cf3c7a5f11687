use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] upsync_core::Error),
    #[error(transparent)]
    Transport(#[from] upsync_core::sync::TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid resource document: {0}")]
    InvalidDocument(String),
    #[error("Resource id cannot be empty")]
    EmptyResourceId,
    #[error("Unsupported method for {operation}: {method}")]
    UnsupportedMethod {
        operation: &'static str,
        method: &'static str,
    },
    #[error(
        "Upload server is not configured. Pass --server, set UPSYNC_SERVER_URL, or add server_base_url to the upload config."
    )]
    ServerNotConfigured,
    #[error("Upload failed after {uploaded} of {total} changes: {source}")]
    UploadFailed {
        uploaded: usize,
        total: usize,
        source: upsync_core::Error,
    },
}
