//! Compacted patches and the change records they replace

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::{LocalChange, LocalChangeToken, ResourceKey, ResourceType};

/// Kind of operation a patch performs on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// The net effect of one or more local changes on a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub resource_type: ResourceType,
    pub resource_id: String,
    /// Version the server must still hold for the patch to apply
    pub version_id: Option<String>,
    /// Timestamp of the newest change folded into this patch (Unix ms)
    pub timestamp: i64,
    pub patch_type: PatchType,
    /// Full resource for inserts, JSON patch array for updates, `null` for deletes
    pub payload: serde_json::Value,
}

impl Patch {
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.clone(), self.resource_id.clone())
    }
}

/// A generated patch together with the changes it stands in for
#[derive(Debug, Clone, PartialEq)]
pub struct PatchMapping {
    /// Source changes in token order
    pub local_changes: Vec<LocalChange>,
    pub generated_patch: Patch,
}

impl PatchMapping {
    /// Tokens to delete once the patch is acknowledged
    pub fn tokens(&self) -> impl Iterator<Item = LocalChangeToken> + '_ {
        self.local_changes.iter().map(|change| change.token)
    }
}

/// Unit of ordering produced by dependency analysis
#[derive(Debug, Clone, PartialEq)]
pub enum PatchGroup {
    /// A resource with no cyclic dependency
    Single(PatchMapping),
    /// Resources that reference each other and must travel in one request
    Combined(Vec<PatchMapping>),
}

impl PatchGroup {
    /// Number of patches in the group
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Combined(mappings) => mappings.len(),
        }
    }

    /// Always false; groups are never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn mappings(&self) -> &[PatchMapping] {
        match self {
            Self::Single(mapping) => std::slice::from_ref(mapping),
            Self::Combined(mappings) => mappings,
        }
    }

    #[must_use]
    pub fn into_mappings(self) -> Vec<PatchMapping> {
        match self {
            Self::Single(mapping) => vec![mapping],
            Self::Combined(mappings) => mappings,
        }
    }
}

/// Collect the change tokens of every mapping
pub fn collect_tokens<'a>(
    mappings: impl IntoIterator<Item = &'a PatchMapping>,
) -> BTreeSet<LocalChangeToken> {
    mappings.into_iter().flat_map(PatchMapping::tokens).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;
    use serde_json::json;

    fn mapping(id: &str, token: i64) -> PatchMapping {
        let resource_type: ResourceType = "Patient".parse().unwrap();
        PatchMapping {
            local_changes: vec![LocalChange {
                resource_type: resource_type.clone(),
                resource_id: id.into(),
                change_type: ChangeType::Insert,
                payload: json!({"resourceType": "Patient", "id": id}),
                version_id: None,
                token: LocalChangeToken(token),
                timestamp: token,
            }],
            generated_patch: Patch {
                resource_type,
                resource_id: id.into(),
                version_id: None,
                timestamp: token,
                patch_type: PatchType::Insert,
                payload: json!({"resourceType": "Patient", "id": id}),
            },
        }
    }

    #[test]
    fn group_exposes_members() {
        let single = PatchGroup::Single(mapping("a", 1));
        assert_eq!(single.len(), 1);
        assert!(!single.is_empty());

        let combined = PatchGroup::Combined(vec![mapping("a", 1), mapping("b", 2)]);
        assert_eq!(combined.len(), 2);
        let ids: Vec<_> = combined
            .mappings()
            .iter()
            .map(|m| m.generated_patch.resource_id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn collect_tokens_spans_mappings() {
        let mappings = [mapping("a", 3), mapping("b", 1)];
        let tokens = collect_tokens(&mappings);
        assert_eq!(
            tokens.into_iter().collect::<Vec<_>>(),
            [LocalChangeToken(1), LocalChangeToken(3)]
        );
    }
}
