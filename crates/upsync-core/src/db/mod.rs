//! Local store of resources and pending changes

mod connection;
mod migrations;

use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::{LocalChange, LocalChangeToken, ResourceKey, ResourceType};

pub use connection::{SqliteDatabase, StoredResource};

/// Storage operations the upload pipeline relies on.
///
/// Calls are synchronous and expected to be short. Implementations need not be
/// safe for two upload sessions running over the same store at once.
pub trait Database {
    /// Number of pending local changes
    fn count_pending(&self) -> Result<usize>;

    /// Every pending change in token order
    fn all_pending(&self) -> Result<Vec<LocalChange>>;

    /// Full pending history of the resource owning the oldest pending change
    fn earliest_resource_changes(&self) -> Result<Vec<LocalChange>>;

    /// Distinct resources with pending changes, ordered by their oldest change
    fn pending_resources(&self) -> Result<Vec<ResourceKey>>;

    /// Pending history of one resource in token order
    fn resource_changes(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Vec<LocalChange>>;

    /// Remove acknowledged or cancelled changes
    fn delete_changes(&self, tokens: &BTreeSet<LocalChangeToken>) -> Result<()>;

    /// Record the server version and modification time of a stored resource
    fn update_version_and_timestamp(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
        version_id: Option<&str>,
        last_modified: Option<i64>,
    ) -> Result<()>;

    /// Replace a client-assigned id with the server-assigned one.
    ///
    /// Rewrites the stored resource, its pending changes, and every `Type/old`
    /// reference held by other resources and pending changes.
    fn remap_identifier(
        &self,
        resource_type: &ResourceType,
        old_id: &str,
        new_id: &str,
    ) -> Result<()>;
}
