//! Packages ordered patches into wire requests

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use serde_json::{json, Value};

use super::strategy::{CreateMethod, RequestMode};
use crate::error::{Error, Result};
use crate::models::{Patch, PatchGroup, PatchMapping, PatchType};

pub const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A transaction bundle posted to the server base
    Transaction,
    /// A single resource operation
    Resource,
}

/// A request ready to hand to a data source
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub kind: RequestKind,
    pub method: HttpVerb,
    /// Relative to the server base URL; empty for the base itself
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// A request plus the patches it carries, in entry order
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequestMapping {
    pub generated_request: UploadRequest,
    pub patch_mappings: Vec<PatchMapping>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadRequestGenerator {
    mode: RequestMode,
}

impl UploadRequestGenerator {
    pub const fn new(mode: RequestMode) -> Self {
        Self { mode }
    }

    pub fn generate(&self, groups: Vec<PatchGroup>) -> Result<Vec<UploadRequestMapping>> {
        match self.mode {
            RequestMode::Bundle { max_entries, .. } => Ok(self.bundles(groups, max_entries)),
            RequestMode::Individual { .. } => self.individual(groups),
        }
    }

    fn bundles(&self, groups: Vec<PatchGroup>, max_entries: usize) -> Vec<UploadRequestMapping> {
        let mut chunks: Vec<Vec<PatchMapping>> = Vec::new();
        let mut current: Vec<PatchMapping> = Vec::new();

        for group in groups {
            if !current.is_empty() && current.len() + group.len() > max_entries {
                chunks.push(std::mem::take(&mut current));
            }
            if group.len() > max_entries {
                tracing::warn!(
                    "Reference cycle of {} resources exceeds bundle size {max_entries}, sending it in one bundle",
                    group.len()
                );
            }
            current.extend(group.into_mappings());
            if current.len() >= max_entries {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
            .into_iter()
            .map(|patch_mappings| {
                let entries: Vec<Value> = patch_mappings
                    .iter()
                    .map(|mapping| self.bundle_entry(&mapping.generated_patch))
                    .collect();
                UploadRequestMapping {
                    generated_request: UploadRequest {
                        kind: RequestKind::Transaction,
                        method: HttpVerb::Post,
                        url: String::new(),
                        headers: BTreeMap::new(),
                        body: Some(json!({
                            "resourceType": "Bundle",
                            "type": "transaction",
                            "entry": entries,
                        })),
                    },
                    patch_mappings,
                }
            })
            .collect()
    }

    fn bundle_entry(&self, patch: &Patch) -> Value {
        let (method, url) = self.target(patch);
        let mut request = json!({"method": method.as_str(), "url": url});
        if let Some(version) = self.if_match(patch) {
            request["ifMatch"] = Value::String(version);
        }

        let mut entry = json!({"request": request});
        match patch.patch_type {
            PatchType::Insert => entry["resource"] = patch.payload.clone(),
            PatchType::Update => {
                let data = base64::engine::general_purpose::STANDARD
                    .encode(patch.payload.to_string().as_bytes());
                entry["resource"] = json!({
                    "resourceType": "Binary",
                    "contentType": JSON_PATCH_CONTENT_TYPE,
                    "data": data,
                });
            }
            PatchType::Delete => {}
        }
        entry
    }

    fn individual(&self, groups: Vec<PatchGroup>) -> Result<Vec<UploadRequestMapping>> {
        let mut requests = Vec::new();
        for group in groups {
            if let PatchGroup::Combined(mappings) = &group {
                let resources: Vec<String> = mappings
                    .iter()
                    .map(|mapping| mapping.generated_patch.key().to_string())
                    .collect();
                if self.mode.create_method() == CreateMethod::Post {
                    return Err(Error::UnresolvableCycle {
                        resources,
                        reason: "server-assigned ids cannot satisfy a cycle across separate requests"
                            .into(),
                    });
                }
                tracing::warn!(
                    "Sending reference cycle between {} as separate requests",
                    resources.join(", ")
                );
            }
            for mapping in group.into_mappings() {
                requests.push(UploadRequestMapping {
                    generated_request: self.resource_request(&mapping.generated_patch),
                    patch_mappings: vec![mapping],
                });
            }
        }
        Ok(requests)
    }

    fn resource_request(&self, patch: &Patch) -> UploadRequest {
        let (method, url) = self.target(patch);
        let mut headers = BTreeMap::new();
        if let Some(version) = self.if_match(patch) {
            headers.insert("If-Match".to_string(), version);
        }
        let body = match patch.patch_type {
            PatchType::Insert => Some(patch.payload.clone()),
            PatchType::Update => {
                headers.insert("Content-Type".to_string(), JSON_PATCH_CONTENT_TYPE.to_string());
                Some(patch.payload.clone())
            }
            PatchType::Delete => None,
        };
        UploadRequest {
            kind: RequestKind::Resource,
            method,
            url,
            headers,
            body,
        }
    }

    fn target(&self, patch: &Patch) -> (HttpVerb, String) {
        let instance = format!("{}/{}", patch.resource_type, patch.resource_id);
        match patch.patch_type {
            PatchType::Insert => match self.mode.create_method() {
                CreateMethod::Put => (HttpVerb::Put, instance),
                CreateMethod::Post => (HttpVerb::Post, patch.resource_type.to_string()),
            },
            PatchType::Update => (HttpVerb::Patch, instance),
            PatchType::Delete => (HttpVerb::Delete, instance),
        }
    }

    fn if_match(&self, patch: &Patch) -> Option<String> {
        if !self.mode.use_etag_for_upload() || patch.patch_type == PatchType::Insert {
            return None;
        }
        patch
            .version_id
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .map(|version| format!("W/\"{version}\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, LocalChange, LocalChangeToken};
    use crate::sync::strategy::UpdateMethod;
    use base64::Engine as _;
    use pretty_assertions::assert_eq;

    fn mapping(
        resource: &str,
        patch_type: PatchType,
        payload: Value,
        version: Option<&str>,
    ) -> PatchMapping {
        let (resource_type, resource_id) = resource.split_once('/').unwrap();
        let resource_type: crate::models::ResourceType = resource_type.parse().unwrap();
        let change_type = match patch_type {
            PatchType::Insert => ChangeType::Insert,
            PatchType::Update => ChangeType::Update,
            PatchType::Delete => ChangeType::Delete,
        };
        PatchMapping {
            local_changes: vec![LocalChange {
                resource_type: resource_type.clone(),
                resource_id: resource_id.into(),
                change_type,
                payload: payload.clone(),
                version_id: version.map(str::to_string),
                token: LocalChangeToken(1),
                timestamp: 0,
            }],
            generated_patch: Patch {
                resource_type,
                resource_id: resource_id.into(),
                version_id: version.map(str::to_string),
                timestamp: 0,
                patch_type,
                payload,
            },
        }
    }

    fn bundle(
        max_entries: usize,
        create: CreateMethod,
        use_etag_for_upload: bool,
    ) -> UploadRequestGenerator {
        UploadRequestGenerator::new(RequestMode::Bundle {
            max_entries,
            create,
            update: UpdateMethod::Patch,
            use_etag_for_upload,
        })
    }

    fn individual(create: CreateMethod) -> UploadRequestGenerator {
        UploadRequestGenerator::new(RequestMode::Individual {
            create,
            update: UpdateMethod::Patch,
            use_etag_for_upload: true,
        })
    }

    fn sample_groups() -> Vec<PatchGroup> {
        vec![
            PatchGroup::Single(mapping(
                "Patient/p1",
                PatchType::Insert,
                json!({"resourceType": "Patient", "id": "p1"}),
                None,
            )),
            PatchGroup::Single(mapping(
                "Patient/p2",
                PatchType::Update,
                json!([{"op": "replace", "path": "/active", "value": true}]),
                Some("4"),
            )),
            PatchGroup::Single(mapping("Patient/p3", PatchType::Delete, Value::Null, Some("9"))),
        ]
    }

    #[test]
    fn bundle_entries_map_verbs_urls_and_if_match() {
        let requests = bundle(10, CreateMethod::Put, true).generate(sample_groups()).unwrap();
        assert_eq!(requests.len(), 1);

        let request = &requests[0].generated_request;
        assert_eq!(request.kind, RequestKind::Transaction);
        assert_eq!(request.method, HttpVerb::Post);
        assert_eq!(request.url, "");

        let body = request.body.as_ref().unwrap();
        assert_eq!(body["type"], "transaction");
        let entries = body["entry"].as_array().unwrap();
        assert_eq!(
            entries[0]["request"],
            json!({"method": "PUT", "url": "Patient/p1"})
        );
        assert_eq!(entries[0]["resource"]["id"], "p1");
        assert_eq!(
            entries[1]["request"],
            json!({"method": "PATCH", "url": "Patient/p2", "ifMatch": "W/\"4\""})
        );
        assert_eq!(entries[1]["resource"]["resourceType"], "Binary");
        assert_eq!(entries[1]["resource"]["contentType"], JSON_PATCH_CONTENT_TYPE);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(entries[1]["resource"]["data"].as_str().unwrap())
            .unwrap();
        let patch: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(patch, json!([{"op": "replace", "path": "/active", "value": true}]));
        assert_eq!(
            entries[2],
            json!({"request": {"method": "DELETE", "url": "Patient/p3", "ifMatch": "W/\"9\""}})
        );
    }

    #[test]
    fn bundle_omits_if_match_when_disabled() {
        let requests = bundle(10, CreateMethod::Put, false).generate(sample_groups()).unwrap();
        let body = requests[0].generated_request.body.as_ref().unwrap();
        assert!(body["entry"]
            .as_array()
            .unwrap()
            .iter()
            .all(|entry| entry["request"].get("ifMatch").is_none()));
    }

    #[test]
    fn bundle_post_creates_against_type() {
        let requests = bundle(10, CreateMethod::Post, true).generate(sample_groups()).unwrap();
        let body = requests[0].generated_request.body.as_ref().unwrap();
        assert_eq!(
            body["entry"][0]["request"],
            json!({"method": "POST", "url": "Patient"})
        );
    }

    #[test]
    fn bundles_respect_max_entries() {
        let requests = bundle(2, CreateMethod::Put, true).generate(sample_groups()).unwrap();
        let sizes: Vec<usize> = requests.iter().map(|r| r.patch_mappings.len()).collect();
        assert_eq!(sizes, [2, 1]);
    }

    #[test]
    fn combined_groups_are_never_split() {
        let insert = |id: &str| {
            mapping(
                &format!("Patient/{id}"),
                PatchType::Insert,
                json!({"resourceType": "Patient", "id": id}),
                None,
            )
        };
        let groups = vec![
            PatchGroup::Single(insert("a")),
            PatchGroup::Combined(vec![insert("b"), insert("c")]),
            PatchGroup::Combined(vec![insert("d"), insert("e"), insert("f")]),
            PatchGroup::Single(insert("g")),
        ];
        let requests = bundle(2, CreateMethod::Put, true).generate(groups).unwrap();
        let layout: Vec<Vec<String>> = requests
            .iter()
            .map(|r| {
                r.patch_mappings
                    .iter()
                    .map(|m| m.generated_patch.resource_id.clone())
                    .collect()
            })
            .collect();
        assert_eq!(
            layout,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string(), "e".to_string(), "f".to_string()],
                vec!["g".to_string()],
            ]
        );
    }

    #[test]
    fn individual_requests_map_verbs_and_headers() {
        let requests = individual(CreateMethod::Put).generate(sample_groups()).unwrap();
        assert_eq!(requests.len(), 3);

        let put = &requests[0].generated_request;
        assert_eq!((put.method, put.url.as_str()), (HttpVerb::Put, "Patient/p1"));
        assert!(put.headers.is_empty());
        assert_eq!(put.body.as_ref().unwrap()["id"], "p1");

        let patch = &requests[1].generated_request;
        assert_eq!((patch.method, patch.url.as_str()), (HttpVerb::Patch, "Patient/p2"));
        assert_eq!(patch.headers["Content-Type"], JSON_PATCH_CONTENT_TYPE);
        assert_eq!(patch.headers["If-Match"], "W/\"4\"");

        let delete = &requests[2].generated_request;
        assert_eq!((delete.method, delete.url.as_str()), (HttpVerb::Delete, "Patient/p3"));
        assert_eq!(delete.body, None);
        assert_eq!(delete.headers["If-Match"], "W/\"9\"");
    }

    #[test]
    fn individual_post_uses_type_url() {
        let requests = individual(CreateMethod::Post).generate(sample_groups()).unwrap();
        let post = &requests[0].generated_request;
        assert_eq!((post.method, post.url.as_str()), (HttpVerb::Post, "Patient"));
    }

    #[test]
    fn individual_flattens_cycles_unless_posting() {
        let insert = |id: &str| {
            mapping(
                &format!("Patient/{id}"),
                PatchType::Insert,
                json!({"resourceType": "Patient", "id": id}),
                None,
            )
        };
        let cycle = || vec![PatchGroup::Combined(vec![insert("a"), insert("b")])];

        let requests = individual(CreateMethod::Put).generate(cycle()).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].generated_request.url, "Patient/a");

        let result = individual(CreateMethod::Post).generate(cycle());
        assert!(matches!(result, Err(Error::UnresolvableCycle { .. })));
    }
}
