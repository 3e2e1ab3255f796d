//! Feed sources against a local HTTP server standing in for OTX and abuse.ch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::TryStreamExt;
use object_store::memory::InMemory;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use drover::checkpoint::MemoryCheckpointStore;
use drover::config::ApiKey;
use drover::error::FeedError;
use drover::feed::{FeodoBlocklist, HttpClient, OtxSubscribed};
use drover::schema::SchemaEvolutionMode;
use drover::sink::ObjectTableStore;
use drover::{
    Checkpoint, CheckpointStore, CheckpointStoreRef, FeedKey, FeedSource, Ingestion, Page,
    RetryPolicy, StorageProvider, TableSink, TableStore,
};

const API_KEY: &str = "test-key";
const PAGES: usize = 3;

#[derive(Clone)]
struct Upstream {
    addr: SocketAddr,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

fn pulse(page: usize) -> Value {
    json!({
        "id": format!("pulse-{page}"),
        "name": format!("Campaign {page}"),
        "description": "",
        "author_name": "AlienVault",
        "created": "2024-02-20T08:00:00.000000",
        "modified": format!("2024-03-0{page}T12:30:00.250000"),
        "revision": page,
        "tlp": "white",
        "public": 1,
        "tags": ["botnet"],
        "references": [],
        "malware_families": ["QakBot"],
        "more_indicators": false,
        "indicators": [
            {
                "id": 1000 + page,
                "indicator": format!("203.0.113.{page}"),
                "type": "IPv4",
                "title": "",
                "created": "2024-02-20T08:00:00",
                "is_active": 1
            }
        ]
    })
}

async fn subscribed(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let key = headers.get("x-otx-api-key").and_then(|v| v.to_str().ok());
    if key != Some(API_KEY) {
        return (StatusCode::FORBIDDEN, "invalid api key").into_response();
    }
    upstream.queries.lock().unwrap().push(query.clone());

    let page = query
        .get("page")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(1);
    let next = (page < PAGES).then(|| {
        format!(
            "http://{}/api/v1/pulses/subscribed?page={}",
            upstream.addr,
            page + 1
        )
    });

    Json(json!({
        "count": PAGES,
        "next": next,
        "results": [pulse(page)]
    }))
    .into_response()
}

async fn blocklist() -> Json<Value> {
    Json(json!([
        {
            "ip_address": "203.0.113.10",
            "port": 443,
            "status": "online",
            "hostname": null,
            "as_number": 64500,
            "as_name": "EXAMPLE-AS",
            "country": "US",
            "first_seen": "2024-02-29 18:05:12",
            "last_online": "2024-03-01",
            "malware": "QakBot"
        }
    ]))
}

async fn serve() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = Upstream {
        addr: listener.local_addr().unwrap(),
        queries: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/api/v1/pulses/subscribed", get(subscribed))
        .route("/downloads/ipblocklist.json", get(blocklist))
        .with_state(upstream.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    upstream
}

fn base_url(upstream: &Upstream) -> Url {
    Url::parse(&format!("http://{}/", upstream.addr)).unwrap()
}

fn http() -> HttpClient {
    HttpClient::new(Duration::from_secs(5)).unwrap()
}

fn otx(upstream: &Upstream, key: &str) -> OtxSubscribed {
    OtxSubscribed::new(http(), base_url(upstream), ApiKey::new(key), 1, "otx_pulses")
}

fn since() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_follows_next_until_exhausted() {
    let upstream = serve().await;
    let source = otx(&upstream, API_KEY);

    let pages: Vec<Page> = source.fetch(since()).try_collect().await.unwrap();

    assert_eq!(pages.len(), PAGES);
    assert!(pages[0].has_next());
    assert!(pages[1].has_next());
    assert!(!pages[2].has_next());
    assert_eq!(pages[2].records[0].row["id"], "pulse-3");
    assert_eq!(
        pages[2].records[0].event_time,
        Utc.with_ymd_and_hms(2024, 3, 3, 12, 30, 0).unwrap() + ChronoDuration::milliseconds(250)
    );

    let queries = upstream.queries.lock().unwrap();
    assert_eq!(queries.len(), PAGES);
    assert_eq!(queries[0]["limit"], "1");
    assert_eq!(queries[0]["modified_since"], "2024-02-01T00:00:00.000+00:00");
    assert_eq!(queries[1]["page"], "2");
}

#[tokio::test]
async fn test_rejected_key_is_not_transient() {
    let upstream = serve().await;
    let source = otx(&upstream, "wrong-key");

    let err = source
        .fetch(since())
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(matches!(err, FeedError::Status { status: 403, .. }));
    assert!(!err.is_transient());
    assert!(upstream.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = OtxSubscribed::new(
        http(),
        Url::parse(&format!("http://{addr}/")).unwrap(),
        ApiKey::new(API_KEY),
        1,
        "otx_pulses",
    );
    let err = source
        .fetch(since())
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(matches!(err, FeedError::Request { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_feodo_snapshot_is_single_page() {
    let upstream = serve().await;
    let url = base_url(&upstream).join("/downloads/ipblocklist.json").unwrap();
    let source = FeodoBlocklist::new(http(), url, "abusech_feodo");

    let pages: Vec<Page> = source.fetch(since()).try_collect().await.unwrap();

    assert_eq!(pages.len(), 1);
    assert!(!pages[0].has_next());
    let record = &pages[0].records[0];
    assert_eq!(record.row["ip_address"], "203.0.113.10");
    assert_eq!(
        record.event_time,
        Utc.with_ymd_and_hms(2024, 2, 29, 18, 5, 12).unwrap()
    );
}

#[tokio::test]
async fn test_rerun_against_stale_upstream_inserts_nothing() {
    let upstream = serve().await;
    let feed = FeedKey::new("otx-subscribed");

    let checkpoints: CheckpointStoreRef = Arc::new(MemoryCheckpointStore::new());
    checkpoints
        .put(&feed, Checkpoint::new("otx_pulses", since(), since()))
        .await
        .unwrap();
    let tables = Arc::new(ObjectTableStore::new(StorageProvider::with_store(
        Arc::new(InMemory::new()),
        "warehouse",
    )));
    let sink = TableSink::new(
        tables.clone(),
        RetryPolicy::default(),
        SchemaEvolutionMode::Merge,
    );
    let run = Ingestion::new(
        feed.clone(),
        Arc::new(otx(&upstream, API_KEY)),
        sink,
        checkpoints.clone(),
        ChronoDuration::days(30),
    );
    let shutdown = CancellationToken::new();

    let first = run.run(&shutdown).await.unwrap();
    assert_eq!(first.pages, PAGES);
    assert_eq!(first.inserted, PAGES);
    assert!(tables.table_schema("otx_pulses").await.unwrap().is_some());

    let newest = Utc.with_ymd_and_hms(2024, 3, 3, 12, 30, 0).unwrap()
        + ChronoDuration::milliseconds(250);
    let stored = checkpoints.get(&feed).await.unwrap().unwrap();
    assert_eq!(stored.timestamp, newest);

    let second = run.run(&shutdown).await.unwrap();
    assert_eq!(second.seen, PAGES);
    assert_eq!(second.inserted, 0);
    assert_eq!(checkpoints.get(&feed).await.unwrap(), Some(stored));

    let queries = upstream.queries.lock().unwrap();
    assert_eq!(
        queries[PAGES]["modified_since"],
        "2024-03-03T12:30:00.250+00:00"
    );
}
