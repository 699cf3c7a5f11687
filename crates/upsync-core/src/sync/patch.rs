//! Turns fetched changes into patches

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::ordering;
use crate::error::{Error, Result};
use crate::json_patch;
use crate::models::{
    ChangeType, LocalChange, LocalChangeToken, Patch, PatchGroup, PatchMapping, PatchType,
    ResourceKey,
};

/// How changes become patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    /// One patch per change, in recording order
    Direct,
    /// One patch per resource, ordered by reference dependencies
    #[default]
    PerResourceSquash,
}

/// Output of patch generation for one batch
#[derive(Debug, Default)]
pub struct GeneratedPatches {
    /// Groups in upload order
    pub groups: Vec<PatchGroup>,
    /// Changes that need no upload and can be dropped locally
    pub cancelled: BTreeSet<LocalChangeToken>,
}

#[derive(Debug, Clone, Copy)]
pub struct PatchGenerator {
    mode: PatchMode,
}

impl PatchGenerator {
    pub const fn new(mode: PatchMode) -> Self {
        Self { mode }
    }

    pub fn generate(&self, changes: Vec<LocalChange>) -> Result<GeneratedPatches> {
        match self.mode {
            PatchMode::Direct => Ok(direct(changes)),
            PatchMode::PerResourceSquash => squash_batch(changes),
        }
    }
}

fn direct(mut changes: Vec<LocalChange>) -> GeneratedPatches {
    changes.sort_by_key(|change| change.token);
    let mut generated = GeneratedPatches::default();
    for change in changes {
        let patch_type = match change.change_type {
            ChangeType::Insert => PatchType::Insert,
            ChangeType::Update => PatchType::Update,
            ChangeType::Delete => PatchType::Delete,
            ChangeType::NoOp => {
                generated.cancelled.insert(change.token);
                continue;
            }
        };
        let generated_patch = Patch {
            resource_type: change.resource_type.clone(),
            resource_id: change.resource_id.clone(),
            version_id: change.known_version().map(str::to_string),
            timestamp: change.timestamp,
            patch_type,
            payload: change.payload.clone(),
        };
        generated.groups.push(PatchGroup::Single(PatchMapping {
            local_changes: vec![change],
            generated_patch,
        }));
    }
    generated
}

fn squash_batch(changes: Vec<LocalChange>) -> Result<GeneratedPatches> {
    let mut order: Vec<ResourceKey> = Vec::new();
    let mut histories: HashMap<ResourceKey, Vec<LocalChange>> = HashMap::new();
    for change in changes {
        let key = change.key();
        if !histories.contains_key(&key) {
            order.push(key.clone());
        }
        histories.entry(key).or_default().push(change);
    }

    let mut mappings = Vec::with_capacity(order.len());
    let mut cancelled = BTreeSet::new();
    for key in order {
        let mut history = histories.remove(&key).unwrap_or_default();
        history.sort_by_key(|change| change.token);
        match squash(&history)? {
            Some(generated_patch) => mappings.push(PatchMapping {
                local_changes: history,
                generated_patch,
            }),
            None => {
                tracing::debug!("History of {key} cancels out, nothing to upload");
                cancelled.extend(history.iter().map(|change| change.token));
            }
        }
    }

    Ok(GeneratedPatches {
        groups: ordering::order(mappings)?,
        cancelled,
    })
}

enum SquashState {
    Absent,
    Inserted(serde_json::Value),
    Updated {
        patch: serde_json::Value,
        version_id: Option<String>,
    },
    Deleted {
        version_id: Option<String>,
    },
    Cancelled,
}

/// Fold one resource's history (token order) into its net patch.
///
/// Returns `None` when nothing needs uploading.
pub fn squash(history: &[LocalChange]) -> Result<Option<Patch>> {
    let Some(first) = history.first() else {
        return Ok(None);
    };
    let key = first.key();

    let mut state = SquashState::Absent;
    for change in history {
        if change.resource_type != key.resource_type || change.resource_id != key.resource_id {
            return Err(Error::InvalidHistory {
                key: key.to_string(),
                reason: format!("contains a change for {}", change.key()),
            });
        }
        if change.change_type == ChangeType::NoOp {
            continue;
        }
        let version = || change.known_version().map(str::to_string);

        state = match (state, change.change_type) {
            (SquashState::Deleted { .. } | SquashState::Cancelled, _) => {
                return Err(Error::ChangeAfterDeletion(key));
            }
            (SquashState::Inserted(_) | SquashState::Updated { .. }, ChangeType::Insert) => {
                return Err(Error::ChangeBeforeCreation(key));
            }
            (SquashState::Absent, ChangeType::Insert) => {
                SquashState::Inserted(change.payload.clone())
            }
            (SquashState::Absent, ChangeType::Update) => SquashState::Updated {
                patch: change.payload.clone(),
                version_id: version(),
            },
            (SquashState::Absent, ChangeType::Delete) => SquashState::Deleted {
                version_id: version(),
            },
            (SquashState::Inserted(mut resource), ChangeType::Update) => {
                json_patch::apply(&mut resource, &change.payload)?;
                SquashState::Inserted(resource)
            }
            (SquashState::Inserted(_), ChangeType::Delete) => SquashState::Cancelled,
            (SquashState::Updated { patch, version_id }, ChangeType::Update) => {
                SquashState::Updated {
                    patch: json_patch::merge(&patch, &change.payload)?,
                    version_id,
                }
            }
            (SquashState::Updated { version_id, .. }, ChangeType::Delete) => {
                SquashState::Deleted { version_id }
            }
            (state, ChangeType::NoOp) => state,
        };
    }

    let (patch_type, payload, version_id) = match state {
        SquashState::Absent | SquashState::Cancelled => return Ok(None),
        // Updates that net out leave nothing for the server
        SquashState::Updated { ref patch, .. } if patch.as_array().is_some_and(Vec::is_empty) => {
            return Ok(None);
        }
        SquashState::Inserted(resource) => (PatchType::Insert, resource, None),
        SquashState::Updated { patch, version_id } => (PatchType::Update, patch, version_id),
        SquashState::Deleted { version_id } => {
            (PatchType::Delete, serde_json::Value::Null, version_id)
        }
    };
    let timestamp = history.iter().map(|change| change.timestamp).max().unwrap_or_default();

    Ok(Some(Patch {
        resource_type: key.resource_type,
        resource_id: key.resource_id,
        version_id,
        timestamp,
        patch_type,
        payload,
    }))
}
