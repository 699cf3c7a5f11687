//! Resource references embedded in payloads

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::{Patch, PatchType, ResourceKey, ResourceType};

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://\S*/)?([A-Z][A-Za-z0-9]*)/([A-Za-z0-9\-.]{1,64})(?:/_history/[A-Za-z0-9\-.]{1,64})?$")
        .expect("Invalid regex")
});

/// Parse a `Type/id` reference, accepting absolute URLs and `_history` suffixes.
///
/// Contained (`#id`) and logical references do not name a resource and yield `None`.
pub fn parse_reference(reference: &str) -> Option<ResourceKey> {
    let captures = REFERENCE_PATTERN.captures(reference.trim())?;
    let resource_type = ResourceType::new(&captures[1]).ok()?;
    Some(ResourceKey::new(resource_type, &captures[2]))
}

/// Resources referenced by a patch, deduplicated in discovery order
pub fn extract_references(patch: &Patch) -> Vec<ResourceKey> {
    let mut found = Vec::new();
    match patch.patch_type {
        PatchType::Insert => collect_reference_objects(&patch.payload, &mut found),
        PatchType::Update => {
            for operation in patch.payload.as_array().into_iter().flatten() {
                let Some(value) = operation.get("value") else {
                    continue;
                };
                let targets_reference = operation
                    .get("path")
                    .and_then(Value::as_str)
                    .is_some_and(|path| path.ends_with("/reference"));
                match value {
                    Value::String(reference) if targets_reference => {
                        push_unique(&mut found, parse_reference(reference));
                    }
                    other => collect_reference_objects(other, &mut found),
                }
            }
        }
        PatchType::Delete => {}
    }
    found
}

/// Rewrite every string equal to `old` into `new`; returns whether anything changed
pub fn replace_reference(value: &mut Value, old: &str, new: &str) -> bool {
    match value {
        Value::String(text) if text == old => {
            new.clone_into(text);
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| replace_reference(item, old, new) | changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| replace_reference(item, old, new) | changed),
        _ => false,
    }
}

fn collect_reference_objects(value: &Value, found: &mut Vec<ResourceKey>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("reference") {
                push_unique(found, parse_reference(reference));
            }
            for child in map.values() {
                collect_reference_objects(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_reference_objects(item, found);
            }
        }
        _ => {}
    }
}

fn push_unique(found: &mut Vec<ResourceKey>, key: Option<ResourceKey>) {
    if let Some(key) = key {
        if !found.contains(&key) {
            found.push(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(patch_type: PatchType, payload: Value) -> Patch {
        Patch {
            resource_type: "Encounter".parse().unwrap(),
            resource_id: "e-1".into(),
            version_id: None,
            timestamp: 0,
            patch_type,
            payload,
        }
    }

    #[test]
    fn parses_relative_and_absolute_references() {
        let key = parse_reference("Patient/p-1").unwrap();
        assert_eq!(key.to_string(), "Patient/p-1");

        let key = parse_reference("https://fhir.example.org/r4/Patient/p-1/_history/2").unwrap();
        assert_eq!(key.to_string(), "Patient/p-1");

        assert!(parse_reference("#contained").is_none());
        assert!(parse_reference("patient/p-1").is_none());
    }

    #[test]
    fn extracts_nested_references_from_insert() {
        let payload = json!({
            "resourceType": "Encounter",
            "subject": {"reference": "Patient/p-1"},
            "participant": [
                {"individual": {"reference": "Practitioner/dr"}},
                {"individual": {"reference": "Patient/p-1"}}
            ]
        });
        let refs: Vec<String> = extract_references(&patch(PatchType::Insert, payload))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(refs, ["Patient/p-1", "Practitioner/dr"]);
    }

    #[test]
    fn extracts_references_from_update_operations() {
        let payload = json!([
            {"op": "replace", "path": "/subject/reference", "value": "Patient/p-2"},
            {"op": "add", "path": "/basedOn", "value": [{"reference": "ServiceRequest/s-1"}]},
            {"op": "replace", "path": "/status", "value": "Patient/not-a-ref-path"},
            {"op": "remove", "path": "/partOf"}
        ]);
        let refs: Vec<String> = extract_references(&patch(PatchType::Update, payload))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(refs, ["Patient/p-2", "ServiceRequest/s-1"]);
    }

    #[test]
    fn delete_has_no_references() {
        assert!(extract_references(&patch(PatchType::Delete, Value::Null)).is_empty());
    }

    #[test]
    fn replace_reference_is_exact() {
        let mut value = json!({
            "subject": {"reference": "Patient/old"},
            "note": [{"text": "Patient/old-ish"}],
            "other": {"reference": "Patient/old"}
        });
        assert!(replace_reference(&mut value, "Patient/old", "Patient/new"));
        assert_eq!(value["subject"]["reference"], "Patient/new");
        assert_eq!(value["other"]["reference"], "Patient/new");
        assert_eq!(value["note"][0]["text"], "Patient/old-ish");
        assert!(!replace_reference(&mut value, "Patient/old", "Patient/new"));
    }
}
