//! JSON Patch (RFC 6902) application and merging.
//!
//! Local updates are recorded as patch arrays. Squashing either applies them to an
//! inserted resource or merges consecutive patches into one, netting out operations
//! that cancel each other.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A single patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl Operation {
    /// Target pointer of the operation
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Move { path, .. }
            | Self::Copy { path, .. }
            | Self::Test { path, .. } => path,
        }
    }

    const fn from(&self) -> Option<&String> {
        match self {
            Self::Move { from, .. } | Self::Copy { from, .. } => Some(from),
            _ => None,
        }
    }
}

/// Parse a patch document into operations
pub fn parse(patch: &Value) -> Result<Vec<Operation>> {
    if !patch.is_array() {
        return Err(Error::InvalidPatch("patch must be a JSON array".into()));
    }
    serde_json::from_value(patch.clone()).map_err(|error| Error::InvalidPatch(error.to_string()))
}

/// Apply a patch to `doc`. The document is left unchanged if any operation fails.
pub fn apply(doc: &mut Value, patch: &Value) -> Result<()> {
    let operations = parse(patch)?;
    let mut working = doc.clone();
    for operation in operations {
        apply_operation(&mut working, operation)?;
    }
    *doc = working;
    Ok(())
}

/// Rewrite `add` operations that overwrite an existing object member as `replace`.
///
/// Afterwards every `add` in the patch creates its target, which [`merge`] relies on
/// when netting an `add` against a later `remove`. Fails like [`apply`].
pub fn normalize_adds(doc: &Value, patch: &Value) -> Result<Value> {
    let mut working = doc.clone();
    let mut normalized = Vec::new();
    for operation in parse(patch)? {
        let operation = match operation {
            Operation::Add { path, value } if overwrites_member(&working, &path)? => {
                Operation::Replace { path, value }
            }
            other => other,
        };
        apply_operation(&mut working, operation.clone())?;
        normalized.push(operation);
    }
    Ok(serde_json::to_value(normalized)?)
}

/// Combine two patches into one that has the effect of applying `first` then `second`.
///
/// Each operation of `second` is netted against the most recent earlier operation on
/// the same pointer, provided nothing in between touched an overlapping location.
pub fn merge(first: &Value, second: &Value) -> Result<Value> {
    let mut merged = parse(first)?;
    for incoming in parse(second)? {
        let target = split_pointer(incoming.path())?;
        let previous = merged
            .iter()
            .rposition(|existing| touches(existing, &target))
            .filter(|&index| {
                !ends_in_append(&target)
                    && split_pointer(merged[index].path()).is_ok_and(|path| path == target)
            });

        let Some(index) = previous else {
            merged.push(incoming);
            continue;
        };

        match (merged.remove(index), incoming) {
            (Operation::Add { .. }, Operation::Remove { .. }) => {}
            (Operation::Add { path, .. }, Operation::Replace { value, .. }) => {
                merged.insert(index, Operation::Add { path, value });
            }
            (Operation::Replace { path, .. }, Operation::Replace { value, .. })
            | (Operation::Remove { path }, Operation::Add { value, .. }) => {
                merged.insert(index, Operation::Replace { path, value });
            }
            (Operation::Replace { path, .. }, Operation::Remove { .. }) => {
                merged.insert(index, Operation::Remove { path });
            }
            (existing, incoming) => {
                merged.insert(index, existing);
                merged.push(incoming);
            }
        }
    }
    Ok(serde_json::to_value(merged)?)
}

fn apply_operation(doc: &mut Value, operation: Operation) -> Result<()> {
    match operation {
        Operation::Add { path, value } => add(doc, &split_pointer(&path)?, value),
        Operation::Remove { path } => remove(doc, &split_pointer(&path)?).map(drop),
        Operation::Replace { path, value } => replace(doc, &split_pointer(&path)?, value),
        Operation::Move { from, path } => {
            let from = split_pointer(&from)?;
            let path = split_pointer(&path)?;
            if path.len() > from.len() && path[..from.len()] == from[..] {
                return Err(Error::InvalidPatch(
                    "cannot move a value into one of its children".into(),
                ));
            }
            let value = remove(doc, &from)?;
            add(doc, &path, value)
        }
        Operation::Copy { from, path } => {
            let value = lookup(doc, &split_pointer(&from)?)?.clone();
            add(doc, &split_pointer(&path)?, value)
        }
        Operation::Test { path, value } => {
            if *lookup(doc, &split_pointer(&path)?)? == value {
                Ok(())
            } else {
                Err(Error::InvalidPatch(format!("test failed at '{path}'")))
            }
        }
    }
}

fn overwrites_member(doc: &Value, pointer: &str) -> Result<bool> {
    let path = split_pointer(pointer)?;
    let Some((key, parent_path)) = path.split_last() else {
        return Ok(true);
    };
    Ok(matches!(lookup(doc, parent_path), Ok(Value::Object(map)) if map.contains_key(key)))
}

fn add(doc: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((key, parent_path)) = path.split_last() else {
        *doc = value;
        return Ok(());
    };
    match lookup_mut(doc, parent_path)? {
        Value::Object(map) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = if key == "-" {
                items.len()
            } else {
                array_index(key, items.len() + 1)?
            };
            items.insert(index, value);
            Ok(())
        }
        _ => Err(not_a_container(path)),
    }
}

fn remove(doc: &mut Value, path: &[String]) -> Result<Value> {
    let Some((key, parent_path)) = path.split_last() else {
        return Err(Error::InvalidPatch("cannot remove the document root".into()));
    };
    match lookup_mut(doc, parent_path)? {
        Value::Object(map) => map.remove(key).ok_or_else(|| missing(path)),
        Value::Array(items) => {
            let index = array_index(key, items.len())?;
            Ok(items.remove(index))
        }
        _ => Err(not_a_container(path)),
    }
}

fn replace(doc: &mut Value, path: &[String], value: Value) -> Result<()> {
    *lookup_mut(doc, path)? = value;
    Ok(())
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Result<&'a Value> {
    doc.pointer(&join_pointer(path)).ok_or_else(|| missing(path))
}

fn lookup_mut<'a>(doc: &'a mut Value, path: &[String]) -> Result<&'a mut Value> {
    doc.pointer_mut(&join_pointer(path))
        .ok_or_else(|| missing(path))
}

fn join_pointer(path: &[String]) -> String {
    path.iter().fold(String::new(), |mut pointer, token| {
        pointer.push('/');
        pointer.push_str(&token.replace('~', "~0").replace('/', "~1"));
        pointer
    })
}

/// Parse an index that must be `< bound`
fn array_index(key: &str, bound: usize) -> Result<usize> {
    let valid = !key.is_empty()
        && key.bytes().all(|byte| byte.is_ascii_digit())
        && (key == "0" || !key.starts_with('0'));
    let index = key
        .parse::<usize>()
        .ok()
        .filter(|_| valid)
        .ok_or_else(|| Error::InvalidPatch(format!("'{key}' is not an array index")))?;
    if index < bound {
        Ok(index)
    } else {
        Err(Error::InvalidPatch(format!("array index {index} out of bounds")))
    }
}

/// Split an RFC 6901 pointer into unescaped reference tokens
fn split_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(Error::InvalidPatch(format!(
            "pointer '{pointer}' must start with '/'"
        )));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Whether an operation reads or writes a location overlapping `target`
fn touches(operation: &Operation, target: &[String]) -> bool {
    std::iter::once(operation.path())
        .chain(operation.from().map(String::as_str))
        .any(|pointer| {
            split_pointer(pointer).map_or(true, |path| overlaps(&path, target))
        })
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    let shared = a.len().min(b.len());
    if a[..shared] == b[..shared] {
        return true;
    }
    // Array siblings shift each other's indices
    a.len() == b.len()
        && a[..a.len() - 1] == b[..b.len() - 1]
        && is_index_token(&a[a.len() - 1])
        && is_index_token(&b[b.len() - 1])
}

fn is_index_token(token: &str) -> bool {
    token == "-" || (!token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit()))
}

fn ends_in_append(path: &[String]) -> bool {
    path.last().is_some_and(|token| token == "-")
}

fn missing(path: &[String]) -> Error {
    Error::InvalidPatch(format!("no value at '/{}'", path.join("/")))
}

fn not_a_container(path: &[String]) -> Error {
    Error::InvalidPatch(format!("parent of '/{}' is not a container", path.join("/")))
}
