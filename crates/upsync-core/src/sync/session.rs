//! Drives one upload cycle end to end

use super::consolidator::ResourceConsolidator;
use super::datasource::DataSource;
use super::fetcher::ChangeFetcher;
use super::patch::PatchGenerator;
use super::request::UploadRequestGenerator;
use super::strategy::UploadStrategy;
use super::uploader::{UploadRequestResult, UploadStream, Uploader};
use crate::db::Database;
use crate::error::{Error, Result};

/// Overall progress of an upload cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub remaining: usize,
    pub initial_total: usize,
    pub last_error: Option<String>,
}

/// Events emitted by [`UploadSession::next`]
#[derive(Debug)]
pub enum SyncUploadProgress {
    /// Emitted once with the number of pending changes
    Started { total: usize },
    /// Local changes that no longer need uploading
    Success {
        consumed: usize,
        progress: UploadProgress,
    },
    /// Terminal failure; the session yields nothing afterwards
    Failure {
        error: Error,
        progress: UploadProgress,
    },
}

enum SessionState<'a, D: DataSource + ?Sized> {
    Idle,
    NeedBatch,
    Uploading(UploadStream<'a, D>),
    Done,
}

/// One upload cycle over a store.
///
/// Two sessions must not run over the same store at the same time; the caller is
/// responsible for serializing them.
pub struct UploadSession<'a, S: Database, D: DataSource + ?Sized> {
    database: &'a S,
    fetcher: ChangeFetcher<'a, S>,
    patch_generator: PatchGenerator,
    request_generator: UploadRequestGenerator,
    uploader: Uploader<'a, D>,
    consolidator: ResourceConsolidator<'a, S>,
    state: SessionState<'a, D>,
    last_error: Option<String>,
}

impl<'a, S: Database, D: DataSource + ?Sized> UploadSession<'a, S, D> {
    pub fn new(database: &'a S, data_source: &'a D, strategy: UploadStrategy) -> Result<Self> {
        let request_mode = strategy.request_mode();
        Ok(Self {
            database,
            fetcher: ChangeFetcher::new(database, strategy.fetch_mode())?,
            patch_generator: PatchGenerator::new(strategy.patch_mode()),
            request_generator: UploadRequestGenerator::new(request_mode),
            uploader: Uploader::new(data_source),
            consolidator: ResourceConsolidator::new(database, request_mode.create_method()),
            state: SessionState::Idle,
            last_error: None,
        })
    }

    /// Advance the cycle; `None` once it has finished
    pub async fn next(&mut self) -> Option<SyncUploadProgress> {
        match self.step().await {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!("Upload cycle aborted: {error}");
                self.state = SessionState::Done;
                self.last_error = Some(error.to_string());
                Some(SyncUploadProgress::Failure {
                    error,
                    progress: self.progress(),
                })
            }
        }
    }

    async fn step(&mut self) -> Result<Option<SyncUploadProgress>> {
        loop {
            match std::mem::replace(&mut self.state, SessionState::Done) {
                SessionState::Idle => {
                    let total = self.fetcher.total();
                    tracing::info!("Starting upload of {total} local changes");
                    self.state = SessionState::NeedBatch;
                    return Ok(Some(SyncUploadProgress::Started { total }));
                }
                SessionState::NeedBatch => {
                    if !self.fetcher.has_next()? {
                        tracing::info!("Upload finished");
                        return Ok(None);
                    }
                    let batch = self.fetcher.next()?;
                    if batch.is_empty() {
                        self.state = SessionState::NeedBatch;
                        continue;
                    }

                    let generated = self.patch_generator.generate(batch)?;
                    let requests = self.request_generator.generate(generated.groups)?;
                    tracing::debug!("Prepared {} upload requests", requests.len());
                    self.state = SessionState::Uploading(self.uploader.upload(requests));

                    if !generated.cancelled.is_empty() {
                        self.database.delete_changes(&generated.cancelled)?;
                        return Ok(Some(SyncUploadProgress::Success {
                            consumed: generated.cancelled.len(),
                            progress: self.progress(),
                        }));
                    }
                }
                SessionState::Uploading(mut stream) => {
                    let Some(result) = stream.next().await else {
                        self.state = SessionState::NeedBatch;
                        continue;
                    };
                    self.consolidator.consolidate(&result)?;
                    return Ok(Some(match result {
                        UploadRequestResult::Success { responses } => {
                            self.state = SessionState::Uploading(stream);
                            SyncUploadProgress::Success {
                                consumed: responses
                                    .iter()
                                    .map(|response| response.patch_mapping.local_changes.len())
                                    .sum(),
                                progress: self.progress(),
                            }
                        }
                        UploadRequestResult::Failure {
                            local_changes,
                            error,
                        } => {
                            tracing::warn!(
                                "{} local changes left pending after failed upload",
                                local_changes.len()
                            );
                            self.last_error = Some(error.to_string());
                            SyncUploadProgress::Failure {
                                error,
                                progress: self.progress(),
                            }
                        }
                    }));
                }
                SessionState::Done => return Ok(None),
            }
        }
    }

    /// Progress as seen by the fetcher; the session's own error wins over a fetch error
    pub fn progress(&self) -> UploadProgress {
        match self.fetcher.progress() {
            Ok(fetched) => UploadProgress {
                remaining: fetched.remaining,
                initial_total: fetched.initial_total,
                last_error: self.last_error.clone().or(fetched.last_error),
            },
            Err(error) => {
                tracing::warn!("Could not count pending changes: {error}");
                UploadProgress {
                    remaining: self.fetcher.total(),
                    initial_total: self.fetcher.total(),
                    last_error: self.last_error.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;
    use crate::models::ResourceType;
    use crate::sync::datasource::UploadResponse;
    use crate::sync::request::HttpVerb;
    use crate::sync::uploader::tests::{body, ScriptedDataSource};
    use serde_json::json;

    async fn drain<S: Database, D: DataSource + ?Sized>(
        session: &mut UploadSession<'_, S, D>,
    ) -> Vec<SyncUploadProgress> {
        let mut events = Vec::new();
        while let Some(event) = session.next().await {
            events.push(event);
        }
        events
    }

    fn patient() -> ResourceType {
        "Patient".parse().unwrap()
    }

    #[tokio::test]
    async fn bundle_cycle_uploads_and_consolidates() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();
        db.insert_resource(json!({
            "resourceType": "Encounter",
            "id": "e1",
            "subject": {"reference": "Patient/p1"}
        }))
        .unwrap();

        let source = ScriptedDataSource::new(vec![body(json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [
                {"response": {"status": "201 Created", "etag": "W/\"1\""}},
                {"response": {"status": "201 Created", "etag": "W/\"1\""}}
            ]
        }))]);
        let strategy = UploadStrategy::all_changes_squashed_bundle_put(10).unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;

        assert!(matches!(events[0], SyncUploadProgress::Started { total: 2 }));
        assert!(matches!(
            &events[1],
            SyncUploadProgress::Success { consumed: 2, progress } if progress.remaining == 0
        ));
        assert_eq!(events.len(), 2);

        let sent = source.received.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, HttpVerb::Post);
        let entries = sent[0].body.as_ref().unwrap()["entry"].as_array().unwrap().clone();
        assert_eq!(entries[0]["request"]["url"], "Patient/p1");
        assert_eq!(entries[1]["request"]["url"], "Encounter/e1");

        let stored = db.get_resource(&patient(), "p1").unwrap().unwrap();
        assert_eq!(stored.version_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn cancelled_history_makes_no_requests() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();
        db.delete_resource(&patient(), "p1").unwrap();

        let source = ScriptedDataSource::default();
        let strategy = UploadStrategy::all_changes_squashed_bundle_put(10).unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            SyncUploadProgress::Success { consumed: 2, .. }
        ));
        assert_eq!(source.sent(), 0);
        assert_eq!(db.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn updates_that_net_out_make_no_requests() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.import_resource(&json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"versionId": "1"}
        }))
        .unwrap();
        db.update_resource(
            &patient(),
            "p1",
            &json!([{"op": "add", "path": "/active", "value": true}]),
        )
        .unwrap();
        db.update_resource(&patient(), "p1", &json!([{"op": "remove", "path": "/active"}]))
            .unwrap();

        let source = ScriptedDataSource::default();
        let strategy = UploadStrategy::all_changes_squashed_bundle_put(10).unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;

        assert_eq!(events.len(), 2);
        match &events[1] {
            SyncUploadProgress::Success { consumed, progress } => {
                assert_eq!(*consumed, 2);
                assert_eq!(progress.remaining, 0);
                assert_eq!(progress.initial_total, 2);
                assert_eq!(progress.last_error, None);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(source.sent(), 0);
        assert_eq!(db.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_stops_the_cycle_and_keeps_changes() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            db.insert_resource(json!({"resourceType": "Patient", "id": id}))
                .unwrap();
        }

        let source = ScriptedDataSource::new(vec![
            body(json!({"resourceType": "Patient", "id": "a"})),
            body(json!({
                "resourceType": "OperationOutcome",
                "issue": [{"severity": "error", "code": "processing", "diagnostics": "boom"}]
            })),
            body(json!({"resourceType": "Patient", "id": "c"})),
        ]);
        let strategy = UploadStrategy::single_resource_individual_put().unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;

        assert_eq!(events.len(), 3);
        match &events[2] {
            SyncUploadProgress::Failure { error, progress } => {
                assert!(error.is_retryable());
                assert_eq!(progress.remaining, 2);
                assert_eq!(progress.initial_total, 3);
                assert!(progress.last_error.as_deref().unwrap().contains("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(source.sent(), 2);
        assert_eq!(db.count_pending().unwrap(), 2);
    }

    #[tokio::test]
    async fn post_cycle_remaps_before_dependants_upload() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.insert_resource(json!({"resourceType": "Patient", "id": "local"}))
            .unwrap();
        db.insert_resource(json!({
            "resourceType": "Observation",
            "id": "o1",
            "subject": {"reference": "Patient/local"}
        }))
        .unwrap();

        let source = ScriptedDataSource::new(vec![
            Ok(UploadResponse {
                location: Some("Patient/srv-1/_history/1".into()),
                ..UploadResponse::default()
            }),
            body(json!({"resourceType": "Observation", "id": "srv-2", "meta": {"versionId": "1"}})),
        ]);
        let strategy = UploadStrategy::single_resource_individual_post().unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;
        assert_eq!(events.len(), 3);

        let sent = source.received.lock().unwrap();
        assert_eq!(sent[0].url, "Patient");
        assert_eq!(sent[1].url, "Observation");
        assert_eq!(
            sent[1].body.as_ref().unwrap()["subject"]["reference"],
            "Patient/srv-1"
        );
        assert_eq!(db.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn integrity_errors_end_the_cycle() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.import_resource(&json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"versionId": "1"}
        }))
        .unwrap();
        db.delete_resource(&patient(), "p1").unwrap();
        // Recreating a deleted resource is an integrity violation
        db.insert_resource(json!({"resourceType": "Patient", "id": "p1"}))
            .unwrap();

        let source = ScriptedDataSource::default();
        let strategy = UploadStrategy::all_changes_squashed_bundle_put(10).unwrap();
        let mut session = UploadSession::new(&db, &source, strategy).unwrap();
        let events = drain(&mut session).await;

        assert!(matches!(
            &events[1],
            SyncUploadProgress::Failure { error, .. } if error.is_local_integrity()
        ));
        assert_eq!(events.len(), 2);
        assert_eq!(source.sent(), 0);
    }
}
