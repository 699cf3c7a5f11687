//! `SQLite` implementation of the local store

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // COUNT(*) and LIMIT are i64

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use super::{migrations, Database};
use crate::error::{Error, Result};
use crate::json_patch;
use crate::models::{
    replace_reference, ChangeType, LocalChange, LocalChangeToken, ResourceKey, ResourceType,
};
use crate::util::{parse_timestamp_millis, unix_millis_now};

const CHANGE_COLUMNS: &str =
    "id, resource_type, resource_id, change_type, payload, version_id, timestamp";

/// Local copy of a resource as last written or imported
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    pub key: ResourceKey,
    pub payload: Value,
    pub version_id: Option<String>,
    /// Server modification time (Unix ms)
    pub last_updated: Option<i64>,
}

/// Resource and change store backed by a single `SQLite` connection
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let database = Self { conn };
        database.configure();
        migrations::run(&database.conn)?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self { conn })
    }

    fn configure(&self) {
        // Not every filesystem supports WAL; fall back to the default journal
        if let Err(error) = self
            .conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        {
            tracing::warn!("Could not enable WAL mode: {error}");
        }
    }

    /// Store a resource as received from the server without recording a change
    pub fn import_resource(&self, resource: &Value) -> Result<ResourceKey> {
        let key = resource_key_of(resource)?.ok_or_else(|| {
            Error::InvalidInput("Imported resources must carry an id".into())
        })?;
        let meta = resource.get("meta");
        let version_id = meta
            .and_then(|meta| meta.get("versionId"))
            .and_then(Value::as_str);
        let last_updated = meta
            .and_then(|meta| meta.get("lastUpdated"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp_millis);

        self.conn.execute(
            "INSERT OR REPLACE INTO resources (resource_type, resource_id, payload, version_id, last_updated)
             VALUES (?, ?, ?, ?, ?)",
            params![
                key.resource_type.as_str(),
                key.resource_id,
                resource.to_string(),
                version_id,
                last_updated
            ],
        )?;
        tracing::debug!("Imported {key}");
        Ok(key)
    }

    /// Create a resource locally and record an INSERT change.
    ///
    /// A missing id is filled with a fresh time-ordered UUID.
    pub fn insert_resource(&self, mut resource: Value) -> Result<ResourceKey> {
        let key = match resource_key_of(&resource)? {
            Some(key) => key,
            None => {
                let resource_type = resource_type_of(&resource)?;
                let id = Uuid::now_v7().to_string();
                resource["id"] = Value::String(id.clone());
                ResourceKey::new(resource_type, id)
            }
        };
        if self.get_resource(&key.resource_type, &key.resource_id)?.is_some() {
            return Err(Error::InvalidInput(format!("{key} already exists")));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO resources (resource_type, resource_id, payload) VALUES (?, ?, ?)",
            params![key.resource_type.as_str(), key.resource_id, resource.to_string()],
        )?;
        record_change(&tx, &key, ChangeType::Insert, &resource, None)?;
        tx.commit()?;

        tracing::debug!("Inserted {key}");
        Ok(key)
    }

    /// Apply a JSON patch to a stored resource and record an UPDATE change.
    ///
    /// An `add` that overwrites an existing member is recorded as `replace`. An empty
    /// patch records a NO_OP change.
    pub fn update_resource(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
        patch: &Value,
    ) -> Result<()> {
        let stored = self
            .get_resource(resource_type, resource_id)?
            .ok_or_else(|| Error::NotFound(format!("{resource_type}/{resource_id}")))?;
        let patch = json_patch::normalize_adds(&stored.payload, patch)?;
        let mut payload = stored.payload;
        json_patch::apply(&mut payload, &patch)?;

        let is_empty = patch.as_array().is_some_and(Vec::is_empty);
        let (change_type, change_payload) = if is_empty {
            (ChangeType::NoOp, Value::Null)
        } else {
            (ChangeType::Update, patch)
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE resources SET payload = ? WHERE resource_type = ? AND resource_id = ?",
            params![payload.to_string(), resource_type.as_str(), resource_id],
        )?;
        record_change(
            &tx,
            &stored.key,
            change_type,
            &change_payload,
            stored.version_id.as_deref(),
        )?;
        tx.commit()?;

        tracing::debug!("Updated {}", stored.key);
        Ok(())
    }

    /// Remove a stored resource and record a DELETE change
    pub fn delete_resource(&self, resource_type: &ResourceType, resource_id: &str) -> Result<()> {
        let stored = self
            .get_resource(resource_type, resource_id)?
            .ok_or_else(|| Error::NotFound(format!("{resource_type}/{resource_id}")))?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM resources WHERE resource_type = ? AND resource_id = ?",
            params![resource_type.as_str(), resource_id],
        )?;
        record_change(
            &tx,
            &stored.key,
            ChangeType::Delete,
            &Value::Null,
            stored.version_id.as_deref(),
        )?;
        tx.commit()?;

        tracing::debug!("Deleted {}", stored.key);
        Ok(())
    }

    /// Get a stored resource by type and id
    pub fn get_resource(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Option<StoredResource>> {
        let row = self
            .conn
            .query_row(
                "SELECT payload, version_id, last_updated FROM resources
                 WHERE resource_type = ? AND resource_id = ?",
                params![resource_type.as_str(), resource_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(payload, version_id, last_updated)| {
            Ok(StoredResource {
                key: ResourceKey::new(resource_type.clone(), resource_id),
                payload: serde_json::from_str(&payload)?,
                version_id,
                last_updated,
            })
        })
        .transpose()
    }

    /// Oldest pending changes, up to `limit`
    pub fn list_pending(&self, limit: usize) -> Result<Vec<LocalChange>> {
        self.query_changes(
            &format!("SELECT {CHANGE_COLUMNS} FROM local_changes ORDER BY id LIMIT ?"),
            params![limit as i64],
        )
    }

    fn query_changes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<LocalChange>> {
        let mut stmt = self.conn.prepare(sql)?;
        let changes = stmt
            .query_map(params, parse_change)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }
}

impl Database for SqliteDatabase {
    fn count_pending(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM local_changes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn all_pending(&self) -> Result<Vec<LocalChange>> {
        self.query_changes(
            &format!("SELECT {CHANGE_COLUMNS} FROM local_changes ORDER BY id"),
            [],
        )
    }

    fn earliest_resource_changes(&self) -> Result<Vec<LocalChange>> {
        let earliest: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT resource_type, resource_id FROM local_changes ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match earliest {
            Some((resource_type, resource_id)) => {
                self.resource_changes(&ResourceType::new(resource_type)?, &resource_id)
            }
            None => Ok(Vec::new()),
        }
    }

    fn pending_resources(&self) -> Result<Vec<ResourceKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_type, resource_id, MIN(id) AS first_change FROM local_changes
             GROUP BY resource_type, resource_id ORDER BY first_change",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(resource_type, resource_id)| {
                Ok(ResourceKey::new(ResourceType::new(resource_type)?, resource_id))
            })
            .collect()
    }

    fn resource_changes(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Vec<LocalChange>> {
        self.query_changes(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM local_changes
                 WHERE resource_type = ? AND resource_id = ? ORDER BY id"
            ),
            params![resource_type.as_str(), resource_id],
        )
    }

    fn delete_changes(&self, tokens: &BTreeSet<LocalChangeToken>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM local_changes WHERE id = ?")?;
            for token in tokens {
                stmt.execute(params![token.0])?;
            }
        }
        tx.commit()?;
        tracing::debug!("Deleted {} local changes", tokens.len());
        Ok(())
    }

    fn update_version_and_timestamp(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
        version_id: Option<&str>,
        last_modified: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE resources
             SET version_id = COALESCE(?, version_id), last_updated = COALESCE(?, last_updated)
             WHERE resource_type = ? AND resource_id = ?",
            params![version_id, last_modified, resource_type.as_str(), resource_id],
        )?;
        Ok(())
    }

    fn remap_identifier(
        &self,
        resource_type: &ResourceType,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        let old_reference = format!("{resource_type}/{old_id}");
        let new_reference = format!("{resource_type}/{new_id}");
        let tx = self.conn.unchecked_transaction()?;

        // The resource itself and its own insert payloads carry the id
        tx.execute(
            "UPDATE resources SET resource_id = ?1, payload = json_set(payload, '$.id', ?1)
             WHERE resource_type = ?2 AND resource_id = ?3",
            params![new_id, resource_type.as_str(), old_id],
        )?;
        tx.execute(
            "UPDATE local_changes
             SET resource_id = ?1,
                 payload = CASE WHEN change_type = 'INSERT' THEN json_set(payload, '$.id', ?1) ELSE payload END
             WHERE resource_type = ?2 AND resource_id = ?3",
            params![new_id, resource_type.as_str(), old_id],
        )?;

        let mut rewritten = 0;
        for (table, key_column) in [("resources", "rowid"), ("local_changes", "id")] {
            let candidates: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {key_column}, payload FROM {table} WHERE instr(payload, ?) > 0"
                ))?;
                let rows = stmt
                    .query_map(params![old_reference], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            for (row_key, payload) in candidates {
                let mut payload: Value = serde_json::from_str(&payload)?;
                if replace_reference(&mut payload, &old_reference, &new_reference) {
                    tx.execute(
                        &format!("UPDATE {table} SET payload = ? WHERE {key_column} = ?"),
                        params![payload.to_string(), row_key],
                    )?;
                    rewritten += 1;
                }
            }
        }
        tx.commit()?;

        tracing::info!(
            "Remapped {old_reference} to {new_reference} ({rewritten} referencing payloads rewritten)"
        );
        Ok(())
    }
}

fn record_change(
    conn: &Connection,
    key: &ResourceKey,
    change_type: ChangeType,
    payload: &Value,
    version_id: Option<&str>,
) -> Result<LocalChangeToken> {
    conn.execute(
        "INSERT INTO local_changes (resource_type, resource_id, change_type, payload, version_id, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            key.resource_type.as_str(),
            key.resource_id,
            change_type.as_str(),
            payload.to_string(),
            version_id,
            unix_millis_now()
        ],
    )?;
    Ok(LocalChangeToken(conn.last_insert_rowid()))
}

fn resource_type_of(resource: &Value) -> Result<ResourceType> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput("Resource is missing resourceType".into()))
        .and_then(ResourceType::new)
}

fn resource_key_of(resource: &Value) -> Result<Option<ResourceKey>> {
    let resource_type = resource_type_of(resource)?;
    Ok(resource
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(|id| ResourceKey::new(resource_type, id)))
}

/// Parse a change from a row selected with `CHANGE_COLUMNS`
fn parse_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalChange> {
    let conversion = |index: usize, error: Error| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
    };
    let resource_type: String = row.get(1)?;
    let change_type: String = row.get(3)?;
    let payload: String = row.get(4)?;
    Ok(LocalChange {
        token: LocalChangeToken(row.get(0)?),
        resource_type: ResourceType::new(resource_type).map_err(|e| conversion(1, e))?,
        resource_id: row.get(2)?,
        change_type: change_type.parse().map_err(|e| conversion(3, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion(4, e.into()))?,
        version_id: row.get(5)?,
        timestamp: row.get(6)?,
    })
}
