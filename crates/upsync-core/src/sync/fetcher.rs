//! Enumerates pending local changes in batches

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::db::Database;
use crate::error::Result;
use crate::models::{LocalChange, ResourceKey};

/// How pending changes are split into upload batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Every pending change in one batch
    #[default]
    All,
    /// The full history of whichever resource owns the oldest pending change
    PerResourceEarliest,
    /// One resource at a time, in the order they first had pending changes
    PerResourceAll,
}

/// Snapshot of fetch progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchProgress {
    pub remaining: usize,
    pub initial_total: usize,
    pub last_error: Option<String>,
}

/// Read-only cursor over pending changes
pub struct ChangeFetcher<'a, S: Database> {
    database: &'a S,
    mode: FetchMode,
    initial_total: usize,
    /// Resources still to visit in `PerResourceAll` mode
    queue: VecDeque<ResourceKey>,
    all_fetched: bool,
    last_error: Option<String>,
}

impl<'a, S: Database> ChangeFetcher<'a, S> {
    pub fn new(database: &'a S, mode: FetchMode) -> Result<Self> {
        let initial_total = database.count_pending()?;
        let queue = if mode == FetchMode::PerResourceAll {
            database.pending_resources()?.into()
        } else {
            VecDeque::new()
        };
        Ok(Self {
            database,
            mode,
            initial_total,
            queue,
            all_fetched: false,
            last_error: None,
        })
    }

    /// Pending change count taken when the fetcher was created
    pub const fn total(&self) -> usize {
        self.initial_total
    }

    pub fn has_next(&self) -> Result<bool> {
        match self.mode {
            FetchMode::All => Ok(!self.all_fetched && self.database.count_pending()? > 0),
            FetchMode::PerResourceEarliest => Ok(self.database.count_pending()? > 0),
            FetchMode::PerResourceAll => Ok(!self.queue.is_empty()),
        }
    }

    /// Next batch of changes; empty once nothing is left
    pub fn next(&mut self) -> Result<Vec<LocalChange>> {
        let result = self.fetch();
        if let Err(error) = &result {
            self.last_error = Some(error.to_string());
        }
        result
    }

    fn fetch(&mut self) -> Result<Vec<LocalChange>> {
        let batch = match self.mode {
            FetchMode::All => {
                self.all_fetched = true;
                self.database.all_pending()?
            }
            FetchMode::PerResourceEarliest => self.database.earliest_resource_changes()?,
            FetchMode::PerResourceAll => loop {
                let Some(key) = self.queue.pop_front() else {
                    break Vec::new();
                };
                let history = self
                    .database
                    .resource_changes(&key.resource_type, &key.resource_id)?;
                if !history.is_empty() {
                    break history;
                }
                tracing::debug!("Skipping {key}, no pending changes left");
            },
        };
        tracing::debug!("Fetched {} local changes", batch.len());
        Ok(batch)
    }

    pub fn progress(&self) -> Result<FetchProgress> {
        Ok(FetchProgress {
            remaining: self.database.count_pending()?,
            initial_total: self.initial_total,
            last_error: self.last_error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::models::ResourceType;
    use serde_json::json;

    fn seeded() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "a"}))
            .unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "b"}))
            .unwrap();
        db.update_resource(
            &"Patient".parse::<ResourceType>().unwrap(),
            "a",
            &json!([{"op": "add", "path": "/active", "value": true}]),
        )
        .unwrap();
        db
    }

    fn ids(batch: &[LocalChange]) -> Vec<&str> {
        batch.iter().map(|c| c.resource_id.as_str()).collect()
    }

    #[test]
    fn all_mode_returns_everything_once() {
        let db = seeded();
        let mut fetcher = ChangeFetcher::new(&db, FetchMode::All).unwrap();
        assert_eq!(fetcher.total(), 3);
        assert!(fetcher.has_next().unwrap());
        assert_eq!(ids(&fetcher.next().unwrap()), ["a", "b", "a"]);
        assert!(!fetcher.has_next().unwrap());
    }

    #[test]
    fn earliest_mode_follows_storage() {
        let db = seeded();
        let mut fetcher = ChangeFetcher::new(&db, FetchMode::PerResourceEarliest).unwrap();

        let first = fetcher.next().unwrap();
        assert_eq!(ids(&first), ["a", "a"]);
        db.delete_changes(&first.iter().map(|c| c.token).collect())
            .unwrap();

        assert_eq!(ids(&fetcher.next().unwrap()), ["b"]);
        let progress = fetcher.progress().unwrap();
        assert_eq!(progress.remaining, 1);
        assert_eq!(progress.initial_total, 3);
    }

    #[test]
    fn per_resource_all_skips_consumed_resources() {
        let db = seeded();
        let mut fetcher = ChangeFetcher::new(&db, FetchMode::PerResourceAll).unwrap();

        // Consumed elsewhere before the fetcher reaches it
        let b_history = db
            .resource_changes(&"Patient".parse().unwrap(), "b")
            .unwrap();
        db.delete_changes(&b_history.iter().map(|c| c.token).collect())
            .unwrap();

        assert_eq!(ids(&fetcher.next().unwrap()), ["a", "a"]);
        assert!(fetcher.has_next().unwrap());
        assert!(fetcher.next().unwrap().is_empty());
        assert!(!fetcher.has_next().unwrap());
    }
}
