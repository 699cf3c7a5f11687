//! Applies successful uploads back onto local storage

use super::strategy::CreateMethod;
use super::uploader::{ResourceResponseMapping, UploadRequestResult};
use crate::db::Database;
use crate::error::Result;
use crate::models::{collect_tokens, parse_reference, PatchType};
use crate::util::parse_timestamp_millis;

pub struct ResourceConsolidator<'a, S: Database> {
    database: &'a S,
    create_method: CreateMethod,
}

impl<'a, S: Database> ResourceConsolidator<'a, S> {
    pub const fn new(database: &'a S, create_method: CreateMethod) -> Self {
        Self {
            database,
            create_method,
        }
    }

    /// Reconcile local state with an upload result; failures leave storage untouched
    pub fn consolidate(&self, result: &UploadRequestResult) -> Result<()> {
        let UploadRequestResult::Success { responses } = result else {
            return Ok(());
        };

        let tokens = collect_tokens(responses.iter().map(|response| &response.patch_mapping));
        self.database.delete_changes(&tokens)?;

        for response in responses {
            self.refresh_resource(response)?;
        }
        tracing::debug!(
            "Consolidated {} resources ({} local changes)",
            responses.len(),
            tokens.len()
        );
        Ok(())
    }

    fn refresh_resource(&self, response: &ResourceResponseMapping) -> Result<()> {
        let patch = &response.patch_mapping.generated_patch;
        if patch.patch_type == PatchType::Delete {
            return Ok(());
        }
        let entry = &response.entry;
        let resource = entry.resource.as_ref();

        let mut resource_id = patch.resource_id.clone();
        if self.create_method == CreateMethod::Post && patch.patch_type == PatchType::Insert {
            let assigned = resource
                .and_then(|resource| resource["id"].as_str())
                .map(str::to_string)
                .or_else(|| {
                    entry
                        .location
                        .as_deref()
                        .and_then(parse_reference)
                        .filter(|key| key.resource_type == patch.resource_type)
                        .map(|key| key.resource_id)
                });
            if let Some(assigned) = assigned.filter(|assigned| *assigned != resource_id) {
                self.database
                    .remap_identifier(&patch.resource_type, &resource_id, &assigned)?;
                resource_id = assigned;
            }
        }

        let meta = resource.map(|resource| &resource["meta"]);
        let version_id = meta
            .and_then(|meta| meta["versionId"].as_str())
            .map(str::to_string)
            .or_else(|| entry.etag.as_deref().map(version_from_etag))
            .or_else(|| entry.location.as_deref().and_then(version_from_location));
        let last_modified = meta
            .and_then(|meta| meta["lastUpdated"].as_str())
            .or(entry.last_modified.as_deref())
            .and_then(parse_timestamp_millis);

        self.database.update_version_and_timestamp(
            &patch.resource_type,
            &resource_id,
            version_id.as_deref(),
            last_modified,
        )
    }
}

/// Unwrap a weak validator `W/"3"` into `3`; other validators are kept verbatim
pub fn version_from_etag(etag: &str) -> String {
    let etag = etag.trim();
    etag.strip_prefix("W/\"")
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(etag)
        .to_string()
}

/// Version from a `.../_history/<v>` location
pub fn version_from_location(location: &str) -> Option<String> {
    let (_, rest) = location.rsplit_once("/_history/")?;
    let version = rest.split('/').next()?.trim();
    (!version.is_empty()).then(|| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::models::{LocalChange, PatchMapping, ResourceType};
    use crate::sync::patch::squash;
    use crate::sync::uploader::ResponseEntry;
    use crate::Error;
    use serde_json::json;

    fn patient() -> ResourceType {
        "Patient".parse().unwrap()
    }

    fn mapping_for(db: &SqliteDatabase, id: &str) -> PatchMapping {
        let history: Vec<LocalChange> = db.resource_changes(&patient(), id).unwrap();
        PatchMapping {
            generated_patch: squash(&history).unwrap().unwrap(),
            local_changes: history,
        }
    }

    #[test]
    fn etag_unwrapping() {
        assert_eq!(version_from_etag("W/\"3\""), "3");
        assert_eq!(version_from_etag(" W/\"abc\" "), "abc");
        assert_eq!(version_from_etag("\"3\""), "\"3\"");
        assert_eq!(version_from_etag("7"), "7");
    }

    #[test]
    fn location_history_version() {
        assert_eq!(
            version_from_location("https://fhir.example.org/Patient/p1/_history/12").as_deref(),
            Some("12")
        );
        assert_eq!(version_from_location("Patient/p1"), None);
        assert_eq!(version_from_location("Patient/p1/_history/"), None);
    }

    #[test]
    fn success_deletes_changes_and_refreshes_version() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();
        let mapping = mapping_for(&db, "p1");

        let result = UploadRequestResult::Success {
            responses: vec![ResourceResponseMapping {
                patch_mapping: mapping,
                entry: ResponseEntry {
                    resource: Some(json!({
                        "resourceType": "Patient",
                        "id": "p1",
                        "meta": {"versionId": "5", "lastUpdated": "2024-03-01T10:00:00Z"}
                    })),
                    etag: Some("W/\"4\"".into()),
                    ..ResponseEntry::default()
                },
            }],
        };
        ResourceConsolidator::new(&db, CreateMethod::Put)
            .consolidate(&result)
            .unwrap();

        assert_eq!(db.count_pending().unwrap(), 0);
        let stored = db.get_resource(&patient(), "p1").unwrap().unwrap();
        assert_eq!(stored.version_id.as_deref(), Some("5"));
        assert_eq!(stored.last_updated, Some(1_709_287_200_000));
    }

    #[test]
    fn falls_back_to_headers() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();
        let result = UploadRequestResult::Success {
            responses: vec![ResourceResponseMapping {
                patch_mapping: mapping_for(&db, "p1"),
                entry: ResponseEntry {
                    location: Some("Patient/p1/_history/9".into()),
                    last_modified: Some("Fri, 01 Mar 2024 10:00:00 GMT".into()),
                    ..ResponseEntry::default()
                },
            }],
        };
        ResourceConsolidator::new(&db, CreateMethod::Put)
            .consolidate(&result)
            .unwrap();

        let stored = db.get_resource(&patient(), "p1").unwrap().unwrap();
        assert_eq!(stored.version_id.as_deref(), Some("9"));
        assert_eq!(stored.last_updated, Some(1_709_287_200_000));
    }

    #[test]
    fn failure_leaves_storage_untouched() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();
        let mapping = mapping_for(&db, "p1");

        let result = UploadRequestResult::Failure {
            local_changes: mapping.local_changes,
            error: Error::Transport("timeout".into()),
        };
        ResourceConsolidator::new(&db, CreateMethod::Put)
            .consolidate(&result)
            .unwrap();

        assert_eq!(db.count_pending().unwrap(), 1);
        let stored = db.get_resource(&patient(), "p1").unwrap().unwrap();
        assert_eq!(stored.version_id, None);
    }

    #[test]
    fn post_remaps_server_assigned_id() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "local"}))
            .unwrap();
        db.insert_resource(json!({
            "resourceType": "Observation",
            "id": "o1",
            "subject": {"reference": "Patient/local"}
        }))
        .unwrap();

        let result = UploadRequestResult::Success {
            responses: vec![ResourceResponseMapping {
                patch_mapping: mapping_for(&db, "local"),
                entry: ResponseEntry {
                    location: Some("https://fhir.example.org/Patient/srv-1/_history/1".into()),
                    ..ResponseEntry::default()
                },
            }],
        };
        ResourceConsolidator::new(&db, CreateMethod::Post)
            .consolidate(&result)
            .unwrap();

        assert!(db.get_resource(&patient(), "local").unwrap().is_none());
        let stored = db.get_resource(&patient(), "srv-1").unwrap().unwrap();
        assert_eq!(stored.version_id.as_deref(), Some("1"));

        let observation = db.all_pending().unwrap();
        assert_eq!(observation.len(), 1);
        assert_eq!(
            observation[0].payload["subject"]["reference"],
            json!("Patient/srv-1")
        );
    }
}
