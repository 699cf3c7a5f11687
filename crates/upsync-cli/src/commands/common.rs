use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use upsync_core::db::SqliteDatabase;
use upsync_core::{LocalChange, ResourceType};

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct PendingChangeItem {
    pub token: i64,
    pub change_type: String,
    pub resource: String,
    pub version_id: Option<String>,
    pub timestamp: i64,
    pub timestamp_iso: String,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub pending: usize,
    pub changes: Vec<PendingChangeItem>,
}

pub fn pending_change_to_item(change: &LocalChange, now_ms: i64) -> PendingChangeItem {
    PendingChangeItem {
        token: change.token.0,
        change_type: change.change_type.as_str().to_string(),
        resource: change.key().to_string(),
        version_id: change.known_version().map(str::to_string),
        timestamp: change.timestamp,
        timestamp_iso: format_timestamp(change.timestamp),
        relative_time: format_relative_time(change.timestamp, now_ms),
    }
}

pub fn format_pending_lines(changes: &[LocalChange], now_ms: i64) -> Vec<String> {
    changes
        .iter()
        .map(|change| {
            format!(
                "{:>6}  {:<7} {}  {}",
                change.token.0,
                change.change_type.as_str(),
                change.key(),
                format_relative_time(change.timestamp, now_ms)
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map_or_else(|| timestamp_ms.to_string(), |time| time.to_rfc3339())
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Read a JSON document from a file, or from stdin when the path is `-`
pub fn read_json(path: &Path) -> Result<Value, CliError> {
    let raw = if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin().lock().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&raw)?)
}

/// Resources held by a document: a single resource, an array, or a bundle's entries
pub fn resources_from_document(document: Value) -> Result<Vec<Value>, CliError> {
    match document {
        Value::Array(items) => {
            if let Some(position) = items.iter().position(|item| !item.is_object()) {
                return Err(CliError::InvalidDocument(format!(
                    "array item {position} is not a resource object"
                )));
            }
            Ok(items)
        }
        Value::Object(object) if object.get("resourceType") == Some(&Value::from("Bundle")) => {
            let entries = object
                .get("entry")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            entries
                .iter()
                .enumerate()
                .map(|(position, entry)| {
                    entry
                        .get("resource")
                        .filter(|resource| resource.is_object())
                        .cloned()
                        .ok_or_else(|| {
                            CliError::InvalidDocument(format!(
                                "bundle entry {position} has no resource"
                            ))
                        })
                })
                .collect()
        }
        Value::Object(object) => Ok(vec![Value::Object(object)]),
        _ => Err(CliError::InvalidDocument(
            "expected a resource object, an array or a bundle".to_string(),
        )),
    }
}

pub fn parse_resource_type(raw: &str) -> Result<ResourceType, CliError> {
    Ok(raw.trim().parse()?)
}

pub fn normalize_resource_id(raw: &str) -> Result<String, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyResourceId);
    }
    Ok(trimmed.to_string())
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("UPSYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("upsync")
        .join("upsync.db")
}

pub fn open_database(path: &Path) -> Result<SqliteDatabase, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteDatabase::open(path)?)
}
