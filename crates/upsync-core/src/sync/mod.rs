//! The local change upload pipeline.
//!
//! Stages run in order: fetch pending changes, turn them into patches, package the
//! patches into requests, upload them and consolidate the results. [`UploadSession`]
//! drives one cycle through all of them.

pub mod consolidator;
pub mod datasource;
pub mod fetcher;
pub mod ordering;
pub mod patch;
pub mod request;
pub mod session;
pub mod strategy;
pub mod uploader;

pub use consolidator::{version_from_etag, version_from_location, ResourceConsolidator};
pub use datasource::{DataSource, HttpDataSource, TransportError, UploadResponse};
pub use fetcher::{ChangeFetcher, FetchMode, FetchProgress};
pub use ordering::{order, ReferenceGraph};
pub use patch::{squash, GeneratedPatches, PatchGenerator, PatchMode};
pub use request::{
    HttpVerb, RequestKind, UploadRequest, UploadRequestGenerator, UploadRequestMapping,
};
pub use session::{SyncUploadProgress, UploadProgress, UploadSession};
pub use strategy::{CreateMethod, RequestMode, UpdateMethod, UploadStrategy};
pub use uploader::{
    ResourceResponseMapping, ResponseEntry, UploadRequestResult, UploadStream, Uploader,
};
