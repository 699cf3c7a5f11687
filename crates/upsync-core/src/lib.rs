//! upsync-core - Local change upload pipeline
//!
//! This crate holds the resource models, the local SQLite store, and the pipeline
//! that squashes, orders, uploads and consolidates locally recorded changes.

pub mod config;
pub mod db;
pub mod error;
pub mod json_patch;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ChangeType, LocalChange, LocalChangeToken, ResourceKey, ResourceType};
