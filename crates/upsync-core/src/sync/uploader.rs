//! Sends requests in order and classifies responses, stopping at the first failure

use std::collections::VecDeque;

use serde_json::Value;

use super::datasource::{DataSource, UploadResponse};
use super::request::{RequestKind, UploadRequestMapping};
use crate::error::{Error, Result};
use crate::models::{LocalChange, PatchMapping, PatchType};

/// Server outcome for one uploaded patch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseEntry {
    /// Resource echoed back by the server, if any
    pub resource: Option<Value>,
    /// Status line of a transaction entry, e.g. `201 Created`
    pub status: Option<String>,
    pub location: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponseMapping {
    pub patch_mapping: PatchMapping,
    pub entry: ResponseEntry,
}

#[derive(Debug)]
pub enum UploadRequestResult {
    /// Every patch of the request was accepted
    Success {
        responses: Vec<ResourceResponseMapping>,
    },
    /// The request failed; later requests were not sent
    Failure {
        local_changes: Vec<LocalChange>,
        error: Error,
    },
}

pub struct Uploader<'a, D: DataSource + ?Sized> {
    data_source: &'a D,
}

impl<'a, D: DataSource + ?Sized> Uploader<'a, D> {
    pub const fn new(data_source: &'a D) -> Self {
        Self { data_source }
    }

    /// Start uploading `requests` in order
    pub fn upload(&self, requests: Vec<UploadRequestMapping>) -> UploadStream<'a, D> {
        UploadStream {
            data_source: self.data_source,
            total: requests.len(),
            pending: requests.into(),
            failed: false,
        }
    }
}

/// Pull-based cursor over upload results.
///
/// Each call to [`UploadStream::next`] sends one request. Dropping the stream between
/// calls abandons the remaining requests.
pub struct UploadStream<'a, D: DataSource + ?Sized> {
    data_source: &'a D,
    pending: VecDeque<UploadRequestMapping>,
    total: usize,
    failed: bool,
}

impl<D: DataSource + ?Sized> UploadStream<'_, D> {
    /// Number of requests this stream was created with
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Send the next request; `None` once all are sent or after a failure
    pub async fn next(&mut self) -> Option<UploadRequestResult> {
        if self.failed {
            return None;
        }
        let mapping = self.pending.pop_front()?;
        let request = &mapping.generated_request;
        tracing::debug!(
            "Uploading {} {} with {} patches",
            request.method,
            if request.url.is_empty() { "/" } else { request.url.as_str() },
            mapping.patch_mappings.len()
        );

        let outcome = match self.data_source.upload(request).await {
            Ok(response) => classify(&mapping, response),
            Err(error) => Err(error.into()),
        };

        Some(match outcome {
            Ok(entries) => UploadRequestResult::Success {
                responses: mapping
                    .patch_mappings
                    .into_iter()
                    .zip(entries)
                    .map(|(patch_mapping, entry)| ResourceResponseMapping {
                        patch_mapping,
                        entry,
                    })
                    .collect(),
            },
            Err(error) => {
                tracing::warn!("Upload failed: {error}");
                self.failed = true;
                self.pending.clear();
                UploadRequestResult::Failure {
                    local_changes: mapping
                        .patch_mappings
                        .into_iter()
                        .flat_map(|patch_mapping| patch_mapping.local_changes)
                        .collect(),
                    error,
                }
            }
        })
    }
}

/// Match a response to the patches of its request, one entry per patch
fn classify(
    mapping: &UploadRequestMapping,
    response: UploadResponse,
) -> Result<Vec<ResponseEntry>> {
    match mapping.generated_request.kind {
        RequestKind::Transaction => classify_transaction(mapping, response),
        RequestKind::Resource => {
            let Some(patch_mapping) = mapping.patch_mappings.first() else {
                return Err(Error::ResponseMismatch {
                    expected: 0,
                    actual: 1,
                });
            };
            classify_resource(patch_mapping, response).map(|entry| vec![entry])
        }
    }
}

fn classify_transaction(
    mapping: &UploadRequestMapping,
    response: UploadResponse,
) -> Result<Vec<ResponseEntry>> {
    let body = response.body;
    match body["resourceType"].as_str() {
        Some("Bundle") if body["type"] == "transaction-response" => {
            let entries = body["entry"].as_array().cloned().unwrap_or_default();
            if entries.len() != mapping.patch_mappings.len() {
                return Err(Error::ResponseMismatch {
                    expected: mapping.patch_mappings.len(),
                    actual: entries.len(),
                });
            }
            Ok(entries.into_iter().map(transaction_entry).collect())
        }
        Some("OperationOutcome") => Err(outcome_error("Bundle", &body)),
        _ => Err(Error::UnrecognizedResponse {
            resource_type: "Bundle".into(),
            message: "expected a transaction-response bundle".into(),
        }),
    }
}

fn transaction_entry(mut entry: Value) -> ResponseEntry {
    let text = |field: &str| entry["response"][field].as_str().map(str::to_string);
    let status = text("status");
    let location = text("location");
    let etag = text("etag");
    let last_modified = text("lastModified");
    let resource = entry
        .get_mut("resource")
        .map(Value::take)
        .filter(|resource| !resource.is_null());
    ResponseEntry {
        resource,
        status,
        location,
        etag,
        last_modified,
    }
}

fn classify_resource(mapping: &PatchMapping, response: UploadResponse) -> Result<ResponseEntry> {
    let patch = &mapping.generated_patch;
    let resource_type = patch.resource_type.as_str();
    let UploadResponse {
        body,
        etag,
        location,
        last_modified,
    } = response;
    let entry = |resource: Option<Value>| ResponseEntry {
        resource,
        status: None,
        location: location.clone(),
        etag: etag.clone(),
        last_modified: last_modified.clone(),
    };

    let returned_type = body["resourceType"].as_str().map(str::to_string);
    match returned_type.as_deref() {
        None if body.is_null() => match patch.patch_type {
            PatchType::Delete => Ok(entry(None)),
            PatchType::Insert if location.is_some() => Ok(entry(None)),
            _ => Err(Error::UnrecognizedResponse {
                resource_type: resource_type.into(),
                message: "empty response body".into(),
            }),
        },
        Some("OperationOutcome") if resource_type != "OperationOutcome" => {
            if patch.patch_type == PatchType::Delete && is_informational(&body) {
                Ok(entry(None))
            } else {
                Err(outcome_error(resource_type, &body))
            }
        }
        Some(returned) if returned == resource_type => Ok(entry(Some(body))),
        Some(returned) => Err(Error::UnrecognizedResponse {
            resource_type: resource_type.into(),
            message: format!("server returned a {returned}"),
        }),
        None => Err(Error::UnrecognizedResponse {
            resource_type: resource_type.into(),
            message: "response is not a resource".into(),
        }),
    }
}

fn issues(outcome: &Value) -> &[Value] {
    outcome["issue"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Whether an outcome carries only `information` issues
fn is_informational(outcome: &Value) -> bool {
    let issues = issues(outcome);
    !issues.is_empty()
        && issues
            .iter()
            .all(|issue| issue["severity"] == "information")
}

fn outcome_error(resource_type: &str, outcome: &Value) -> Error {
    let Some(issue) = issues(outcome).first() else {
        return Error::UnrecognizedResponse {
            resource_type: resource_type.into(),
            message: "OperationOutcome without issues".into(),
        };
    };
    let diagnostics = issue["diagnostics"]
        .as_str()
        .or_else(|| issue["details"]["text"].as_str())
        .or_else(|| issue["code"].as_str())
        .unwrap_or("unknown error");
    Error::Rejected {
        resource_type: resource_type.into(),
        diagnostics: diagnostics.to_string(),
    }
}
