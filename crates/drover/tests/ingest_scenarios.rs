//! End-to-end ingestion runs against scripted feeds and in-memory stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use drover::checkpoint::{MemoryCheckpointStore, ObjectCheckpointStore};
use drover::error::{FeedError, SinkError};
use drover::feed::PageStream;
use drover::schema::SchemaEvolutionMode;
use drover::sink::ObjectTableStore;
use drover::{
    Checkpoint, CheckpointStore, CheckpointStoreRef, ErrorCategory, FeedKey, FeedRecord,
    FeedSource, Ingestion, Page, RetryPolicy, RunState, StorageProvider, TableSink, TableStore,
};

const TABLE: &str = "scripted_events";

/// Feed that serves fixed pages; `None` entries fail with a data error.
struct ScriptedSource {
    pages: Vec<Option<Vec<FeedRecord>>>,
    fetched_since: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedSource {
    fn new(pages: Vec<Option<Vec<FeedRecord>>>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            fetched_since: Mutex::new(Vec::new()),
        })
    }

    fn single(records: Vec<FeedRecord>) -> Arc<Self> {
        Self::new(vec![Some(records)])
    }
}

impl FeedSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn table(&self) -> &str {
        TABLE
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "seen_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ]))
    }

    fn fetch(&self, since: DateTime<Utc>) -> PageStream<'_> {
        self.fetched_since.lock().unwrap().push(since);
        let count = self.pages.len();

        stream::iter(self.pages.iter().enumerate().map(move |(index, page)| {
            let next = (index + 1 < count).then(|| {
                Url::parse(&format!("https://feed.example.test/page/{}", index + 2)).unwrap()
            });
            match page {
                Some(records) => Ok(Page::new(records.clone(), next)),
                None => Err(FeedError::Status {
                    url: format!("https://feed.example.test/page/{}", index + 1),
                    status: 400,
                }),
            }
        }))
        .boxed()
    }
}

/// Table store that records appended rows and can be told to misbehave.
#[derive(Default)]
struct RecordingTables {
    schemas: Mutex<HashMap<String, SchemaRef>>,
    batches: Mutex<Vec<Vec<Value>>>,
    /// 1-based append call that fails permanently.
    reject_append: Option<usize>,
    /// Appends keep reporting `TableNotFound`.
    never_visible: bool,
    appends: Mutex<usize>,
}

impl RecordingTables {
    fn inserted(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl TableStore for RecordingTables {
    async fn table_schema(&self, table: &str) -> Result<Option<SchemaRef>, SinkError> {
        Ok(self.schemas.lock().unwrap().get(table).cloned())
    }

    async fn create_table(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError> {
        self.schemas
            .lock()
            .unwrap()
            .insert(table.to_string(), schema);
        Ok(())
    }

    async fn update_schema(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError> {
        self.create_table(table, schema).await
    }

    async fn append(&self, table: &str, rows: &[Value]) -> Result<usize, SinkError> {
        let call = {
            let mut appends = self.appends.lock().unwrap();
            *appends += 1;
            *appends
        };
        if self.never_visible {
            return Err(SinkError::TableNotFound {
                table: table.to_string(),
            });
        }
        if self.reject_append == Some(call) {
            return Err(SinkError::SchemaConflict {
                table: table.to_string(),
            });
        }
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(rows.len())
    }
}

fn record(id: &str, event_time: DateTime<Utc>) -> FeedRecord {
    FeedRecord {
        event_time,
        row: json!({ "id": id, "seen_at": event_time.to_rfc3339() }),
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().duration_trunc(ChronoDuration::seconds(1)).unwrap()
}

fn feed() -> FeedKey {
    FeedKey::new("scripted-feed")
}

fn ingestion(
    source: Arc<ScriptedSource>,
    tables: Arc<RecordingTables>,
    checkpoints: CheckpointStoreRef,
) -> Ingestion {
    let sink = TableSink::new(
        tables,
        RetryPolicy::new(Duration::from_millis(100), 12),
        SchemaEvolutionMode::Merge,
    );
    Ingestion::new(feed(), source, sink, checkpoints, ChronoDuration::days(30))
}

mod idempotence {
    use super::*;

    #[tokio::test]
    async fn test_second_run_imports_nothing() {
        let t = now();
        let source = ScriptedSource::single(vec![
            record("a", t - ChronoDuration::hours(3)),
            record("b", t - ChronoDuration::hours(1)),
            record("c", t),
        ]);
        let tables = Arc::new(RecordingTables::default());
        let checkpoints: CheckpointStoreRef = Arc::new(MemoryCheckpointStore::new());
        let run = ingestion(source.clone(), tables.clone(), checkpoints.clone());
        let shutdown = CancellationToken::new();

        let first = run.run(&shutdown).await.unwrap();
        assert_eq!(first.seen, 3);
        assert_eq!(first.kept, 3);
        assert_eq!(first.inserted, 3);
        assert_eq!(first.watermark_after, t);
        assert!(first.watermark_before < t - ChronoDuration::days(29));

        let stored = checkpoints.get(&feed()).await.unwrap().unwrap();
        assert_eq!(stored.timestamp, t);
        assert_eq!(stored.table_name, TABLE);

        let second = run.run(&shutdown).await.unwrap();
        assert_eq!(second.seen, 3);
        assert_eq!(second.kept, 0);
        assert_eq!(second.inserted, 0);
        assert!(!second.advanced());

        assert_eq!(tables.inserted(), 3);
        assert_eq!(checkpoints.get(&feed()).await.unwrap(), Some(stored));

        let since = source.fetched_since.lock().unwrap().clone();
        assert_eq!(since[1], t);
    }

    #[tokio::test]
    async fn test_empty_feed_writes_no_checkpoint() {
        let source = ScriptedSource::single(Vec::new());
        let tables = Arc::new(RecordingTables::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let run = ingestion(source, tables.clone(), checkpoints.clone());

        let report = run.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(report.seen, 0);
        assert!(checkpoints.is_empty());
        assert!(tables.schemas.lock().unwrap().contains_key(TABLE));
    }
}

mod watermark {
    use super::*;

    #[tokio::test]
    async fn test_oversized_lookback_starts_from_earliest_time() {
        let t = now();
        let tables = Arc::new(RecordingTables::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let sink = TableSink::new(tables.clone(), RetryPolicy::default(), SchemaEvolutionMode::Merge);
        let run = Ingestion::new(
            feed(),
            ScriptedSource::single(vec![record("a", t)]),
            sink,
            checkpoints,
            ChronoDuration::MAX,
        );

        let report = run.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.watermark_before, DateTime::<Utc>::MIN_UTC);
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn test_watermark_never_regresses() {
        let t = now();
        let tables = Arc::new(RecordingTables::default());
        let checkpoints: CheckpointStoreRef = Arc::new(MemoryCheckpointStore::new());
        let shutdown = CancellationToken::new();

        let upstream = [
            vec![record("a", t - ChronoDuration::hours(2)), record("b", t)],
            vec![record("stale", t - ChronoDuration::hours(5))],
            vec![record("c", t + ChronoDuration::hours(1))],
            Vec::new(),
        ];

        let mut watermarks = Vec::new();
        for records in upstream {
            let run = ingestion(
                ScriptedSource::single(records),
                tables.clone(),
                checkpoints.clone(),
            );
            run.run(&shutdown).await.unwrap();
            watermarks.push(checkpoints.get(&feed()).await.unwrap().unwrap().timestamp);
        }

        assert_eq!(
            watermarks,
            vec![t, t, t + ChronoDuration::hours(1), t + ChronoDuration::hours(1)]
        );
        assert_eq!(tables.inserted(), 3);
    }

    #[tokio::test]
    async fn test_records_at_watermark_are_excluded() {
        let t = now();
        let checkpoints: CheckpointStoreRef = Arc::new(MemoryCheckpointStore::new());
        checkpoints
            .put(&feed(), Checkpoint::new(TABLE, t, t))
            .await
            .unwrap();
        let tables = Arc::new(RecordingTables::default());

        let run = ingestion(
            ScriptedSource::single(vec![
                record("equal", t),
                record("newer", t + ChronoDuration::seconds(1)),
            ]),
            tables.clone(),
            checkpoints,
        );
        let report = run.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.kept, 1);
        let batches = tables.batches.lock().unwrap();
        assert_eq!(batches[0][0]["id"], "newer");
    }
}

mod failures {
    use super::*;

    fn three_pages(t: DateTime<Utc>) -> Vec<Option<Vec<FeedRecord>>> {
        vec![
            Some(vec![record("p1", t + ChronoDuration::minutes(1))]),
            Some(vec![record("p2", t + ChronoDuration::minutes(2))]),
            Some(vec![record("p3", t + ChronoDuration::minutes(3))]),
        ]
    }

    async fn seeded(t: DateTime<Utc>) -> (CheckpointStoreRef, Checkpoint) {
        let checkpoints: CheckpointStoreRef = Arc::new(MemoryCheckpointStore::new());
        let before = Checkpoint::new(TABLE, t, t);
        checkpoints.put(&feed(), before.clone()).await.unwrap();
        (checkpoints, before)
    }

    #[tokio::test]
    async fn test_permanent_insert_failure_keeps_checkpoint() {
        let t = now() - ChronoDuration::hours(1);
        let (checkpoints, before) = seeded(t).await;
        let tables = Arc::new(RecordingTables {
            reject_append: Some(2),
            ..Default::default()
        });

        let run = ingestion(ScriptedSource::new(three_pages(t)), tables.clone(), checkpoints.clone());
        let err = run.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.state(), RunState::Writing);
        assert_eq!(err.category(), ErrorCategory::SinkRejected);
        assert_eq!(err.feed(), "scripted-feed");
        assert_eq!(*tables.appends.lock().unwrap(), 2);
        assert_eq!(tables.inserted(), 1);
        assert_eq!(checkpoints.get(&feed()).await.unwrap(), Some(before));
    }

    #[tokio::test]
    async fn test_bad_page_is_data_integrity_failure() {
        let t = now() - ChronoDuration::hours(1);
        let (checkpoints, before) = seeded(t).await;
        let tables = Arc::new(RecordingTables::default());
        let mut pages = three_pages(t);
        pages[1] = None;

        let run = ingestion(ScriptedSource::new(pages), tables.clone(), checkpoints.clone());
        let err = run.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.state(), RunState::Fetching);
        assert_eq!(err.category(), ErrorCategory::DataIntegrity);
        assert!(err.to_string().contains("data-integrity"));
        assert_eq!(tables.inserted(), 1);
        assert_eq!(checkpoints.get(&feed()).await.unwrap(), Some(before));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invisible_table_exhausts_retries() {
        let t = now() - ChronoDuration::hours(1);
        let (checkpoints, before) = seeded(t).await;
        let tables = Arc::new(RecordingTables {
            never_visible: true,
            ..Default::default()
        });

        let run = ingestion(ScriptedSource::new(three_pages(t)), tables.clone(), checkpoints.clone());
        let started = tokio::time::Instant::now();
        let err = run.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::TransientInfrastructure);
        assert!(err.to_string().contains("exceeded retry limit of 12 attempts"));
        assert_eq!(*tables.appends.lock().unwrap(), 12);
        assert!(started.elapsed() >= Duration::from_millis(100 * 4095));
        assert_eq!(checkpoints.get(&feed()).await.unwrap(), Some(before));
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let tables = Arc::new(RecordingTables::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let run = ingestion(
            ScriptedSource::single(vec![record("a", now())]),
            tables.clone(),
            checkpoints.clone(),
        );
        let err = run.run(&shutdown).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.state(), RunState::Start);
        assert!(tables.schemas.lock().unwrap().is_empty());
        assert!(checkpoints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let shutdown = CancellationToken::new();
        let tables = Arc::new(RecordingTables {
            never_visible: true,
            ..Default::default()
        });
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let run = ingestion(
            ScriptedSource::single(vec![record("a", now())]),
            tables.clone(),
            checkpoints.clone(),
        );

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let err = run.run(&shutdown).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.state(), RunState::Writing);
        assert!(*tables.appends.lock().unwrap() < 12);
        assert!(checkpoints.is_empty());
    }
}

mod object_storage {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{ObjectStore, PutPayload};

    #[tokio::test]
    async fn test_run_against_object_stores() {
        let memory = Arc::new(InMemory::new());
        let checkpoints: CheckpointStoreRef = Arc::new(ObjectCheckpointStore::new(
            StorageProvider::with_store(memory.clone(), "checkpoints"),
        ));
        let tables = Arc::new(ObjectTableStore::new(StorageProvider::with_store(
            memory.clone(),
            "warehouse",
        )));
        let sink = TableSink::new(tables.clone(), RetryPolicy::default(), SchemaEvolutionMode::Merge);

        let t = now();
        let source = ScriptedSource::new(vec![
            Some(vec![record("a", t - ChronoDuration::hours(2))]),
            Some(vec![record("b", t)]),
        ]);
        let run = Ingestion::new(feed(), source, sink, checkpoints.clone(), ChronoDuration::days(30));

        let report = run.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.inserted, 2);

        let files = memory
            .list(Some(&Path::from("warehouse/scripted_events/data")))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(files.len(), 2);
        assert!(tables.table_schema(TABLE).await.unwrap().is_some());

        let raw = memory
            .get(&Path::from("checkpoints/scripted-feed.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let stored: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored["table_name"], TABLE);
        assert_eq!(
            stored["timestamp"].as_str().unwrap().parse::<DateTime<Utc>>().unwrap(),
            t
        );
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_is_backing_store_failure() {
        let memory = Arc::new(InMemory::new());
        memory
            .put(
                &Path::from("checkpoints/scripted-feed.json"),
                PutPayload::from_static(b"{"),
            )
            .await
            .unwrap();
        let checkpoints: CheckpointStoreRef = Arc::new(ObjectCheckpointStore::new(
            StorageProvider::with_store(memory, "checkpoints"),
        ));

        let run = ingestion(
            ScriptedSource::single(vec![record("a", now())]),
            Arc::new(RecordingTables::default()),
            checkpoints,
        );
        let err = run.run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::BackingStoreUnavailable);
        assert_eq!(err.state(), RunState::Start);
    }
}

mod watch {
    use super::*;
    use drover::{FeedPipeline, PipelineContext, RunMode};
    use drover_core::app::{EXIT_CANCELLED, exit_status};
    use drover_core::topology::{PipelineRunner, RunSummary};

    async fn watch_until(ingestion: Ingestion, stop_after: Duration) -> RunSummary {
        let shutdown = CancellationToken::new();
        let context = PipelineContext::new(None, 0, RunMode::Watch, shutdown.clone());
        let pipeline = FeedPipeline::new(ingestion, context, Duration::from_secs(60), 0);

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(stop_after).await;
            canceller.cancel();
        });

        PipelineRunner::new(vec![pipeline], shutdown, 0, "feed")
            .run()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_runs_fail_the_watch() {
        let tables = Arc::new(RecordingTables::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let run = ingestion(ScriptedSource::new(vec![None]), tables, checkpoints.clone());

        let summary = watch_until(run, Duration::from_secs(150)).await;

        assert!(summary.completed.is_empty());
        assert_eq!(summary.failed.len(), 1);
        let (key, message) = &summary.failed[0];
        assert_eq!(key, "scripted-feed");
        assert!(message.contains("failed 3 run(s) while watching [data-integrity]"));
        assert_eq!(exit_status(&summary), 1);
        assert!(checkpoints.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_run_is_cancellation() {
        let tables = Arc::new(RecordingTables {
            never_visible: true,
            ..Default::default()
        });
        let run = ingestion(
            ScriptedSource::single(vec![record("a", now())]),
            tables,
            Arc::new(MemoryCheckpointStore::new()),
        );

        let summary = watch_until(run, Duration::from_secs(2)).await;

        assert!(summary.failed.is_empty());
        assert_eq!(summary.cancelled, vec!["scripted-feed"]);
        assert_eq!(exit_status(&summary), EXIT_CANCELLED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_between_runs_completes() {
        let tables = Arc::new(RecordingTables::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let run = ingestion(
            ScriptedSource::single(vec![record("a", now())]),
            tables.clone(),
            checkpoints.clone(),
        );

        let summary = watch_until(run, Duration::from_secs(90)).await;

        assert_eq!(summary.completed, vec!["scripted-feed"]);
        assert_eq!(exit_status(&summary), 0);
        assert_eq!(tables.inserted(), 1);
        assert_eq!(checkpoints.len(), 1);
    }
}
