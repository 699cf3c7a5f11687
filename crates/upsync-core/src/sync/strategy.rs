//! Validated combinations of fetch, patch and request modes

use serde::{Deserialize, Serialize};

use super::fetcher::FetchMode;
use super::patch::PatchMode;
use crate::error::{Error, Result};

/// HTTP method used to create resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMethod {
    /// Client-assigned ids, `PUT Type/id`
    #[default]
    Put,
    /// Server-assigned ids, `POST Type`
    Post,
}

/// HTTP method used to update resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    Put,
    #[default]
    Patch,
}

/// Shape of the generated requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Transaction bundles of at most `max_entries` entries
    Bundle {
        max_entries: usize,
        create: CreateMethod,
        update: UpdateMethod,
        use_etag_for_upload: bool,
    },
    /// One request per patch
    Individual {
        create: CreateMethod,
        update: UpdateMethod,
        use_etag_for_upload: bool,
    },
}

impl RequestMode {
    pub const fn create_method(&self) -> CreateMethod {
        match self {
            Self::Bundle { create, .. } | Self::Individual { create, .. } => *create,
        }
    }

    pub const fn update_method(&self) -> UpdateMethod {
        match self {
            Self::Bundle { update, .. } | Self::Individual { update, .. } => *update,
        }
    }

    pub const fn use_etag_for_upload(&self) -> bool {
        match self {
            Self::Bundle {
                use_etag_for_upload,
                ..
            }
            | Self::Individual {
                use_etag_for_upload,
                ..
            } => *use_etag_for_upload,
        }
    }
}

/// A supported combination of pipeline modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadStrategy {
    fetch_mode: FetchMode,
    patch_mode: PatchMode,
    request_mode: RequestMode,
}

impl UploadStrategy {
    /// Validate a combination of modes
    pub fn new(
        fetch_mode: FetchMode,
        patch_mode: PatchMode,
        request_mode: RequestMode,
    ) -> Result<Self> {
        if request_mode.update_method() == UpdateMethod::Put {
            return Err(Error::Configuration(
                "updating resources with PUT is not supported, use PATCH".into(),
            ));
        }
        if let RequestMode::Bundle { max_entries: 0, .. } = request_mode {
            return Err(Error::Configuration(
                "bundle size must be at least one entry".into(),
            ));
        }
        if fetch_mode == FetchMode::PerResourceAll && patch_mode == PatchMode::Direct {
            return Err(Error::Configuration(
                "per-resource fetching requires per-resource squashing".into(),
            ));
        }
        if request_mode.create_method() == CreateMethod::Post
            && (fetch_mode == FetchMode::All || patch_mode == PatchMode::Direct)
        {
            return Err(Error::Configuration(
                "creating resources with POST requires per-resource fetching and squashing".into(),
            ));
        }
        Ok(Self {
            fetch_mode,
            patch_mode,
            request_mode,
        })
    }

    /// Everything pending, squashed per resource, sent as bundles with PUT creates
    pub fn all_changes_squashed_bundle_put(max_entries: usize) -> Result<Self> {
        Self::new(
            FetchMode::All,
            PatchMode::PerResourceSquash,
            RequestMode::Bundle {
                max_entries,
                create: CreateMethod::Put,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            },
        )
    }

    /// Everything pending, one patch per change, sent as bundles with PUT creates
    pub fn all_changes_bundle_put(max_entries: usize) -> Result<Self> {
        Self::new(
            FetchMode::All,
            PatchMode::Direct,
            RequestMode::Bundle {
                max_entries,
                create: CreateMethod::Put,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            },
        )
    }

    /// One resource per cycle, sent as a bundle
    pub fn single_resource_bundle_put(max_entries: usize) -> Result<Self> {
        Self::new(
            FetchMode::PerResourceEarliest,
            PatchMode::PerResourceSquash,
            RequestMode::Bundle {
                max_entries,
                create: CreateMethod::Put,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            },
        )
    }

    /// One resource per cycle, one request per patch
    pub fn single_resource_individual_put() -> Result<Self> {
        Self::new(
            FetchMode::PerResourceEarliest,
            PatchMode::PerResourceSquash,
            RequestMode::Individual {
                create: CreateMethod::Put,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            },
        )
    }

    /// One resource per cycle, creations receive server-assigned ids
    pub fn single_resource_individual_post() -> Result<Self> {
        Self::new(
            FetchMode::PerResourceEarliest,
            PatchMode::PerResourceSquash,
            RequestMode::Individual {
                create: CreateMethod::Post,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            },
        )
    }

    pub const fn fetch_mode(&self) -> FetchMode {
        self.fetch_mode
    }

    pub const fn patch_mode(&self) -> PatchMode {
        self.patch_mode
    }

    pub const fn request_mode(&self) -> RequestMode {
        self.request_mode
    }
}
