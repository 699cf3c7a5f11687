//! Data models for upsync

mod local_change;
mod patch;
mod reference;

pub use local_change::{ChangeType, LocalChange, LocalChangeToken, ResourceKey, ResourceType};
pub use patch::{collect_tokens, Patch, PatchGroup, PatchMapping, PatchType};
pub use reference::{extract_references, parse_reference, replace_reference};
