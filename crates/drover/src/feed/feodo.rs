//! abuse.ch Feodo Tracker botnet C2 blocklist.
//!
//! The blocklist is a full snapshot: one JSON array, one page, no server-side
//! filtering. The event time of an entry is its `first_seen` time.

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use url::Url;

use super::{FeedRecord, FeedSource, HttpClient, Page, PageStream};
use crate::error::{EventTimeSnafu, FeedError, RowSnafu};

const FIRST_SEEN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LAST_ONLINE_FORMAT: &str = "%Y-%m-%d";

/// Snapshot source for the Feodo Tracker IP blocklist.
pub struct FeodoBlocklist {
    http: HttpClient,
    url: Url,
    table: String,
    schema: SchemaRef,
}

impl FeodoBlocklist {
    pub fn new(http: HttpClient, url: Url, table: impl Into<String>) -> Self {
        Self {
            http,
            url,
            table: table.into(),
            schema: feodo_schema(),
        }
    }

    async fn fetch_snapshot(&self) -> Result<Page, FeedError> {
        let entries: Vec<FeodoEntry> = self.http.get_json(&self.url, &[]).await?;
        Ok(Page::new(parse_blocklist(&entries)?, None))
    }
}

impl FeedSource for FeodoBlocklist {
    fn name(&self) -> &str {
        "abusech_feodo"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn fetch(&self, _since: DateTime<Utc>) -> PageStream<'_> {
        stream::once(self.fetch_snapshot()).boxed()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct FeodoEntry {
    pub ip_address: String,
    pub port: Option<i64>,
    pub status: Option<String>,
    pub hostname: Option<String>,
    pub as_number: Option<i64>,
    pub as_name: Option<String>,
    pub country: Option<String>,
    #[serde(skip_serializing)]
    pub first_seen: String,
    #[serde(skip_serializing)]
    pub last_online: Option<String>,
    pub malware: Option<String>,
}

#[derive(Serialize)]
struct FeodoRow<'a> {
    #[serde(flatten)]
    entry: &'a FeodoEntry,
    first_seen: DateTime<Utc>,
    last_online: Option<DateTime<Utc>>,
}

/// Convert blocklist entries into records. Any malformed timestamp fails the whole list.
pub(crate) fn parse_blocklist(entries: &[FeodoEntry]) -> Result<Vec<FeedRecord>, FeedError> {
    entries.iter().map(entry_record).collect()
}

fn entry_record(entry: &FeodoEntry) -> Result<FeedRecord, FeedError> {
    let record = entry.ip_address.as_str();

    let first_seen = NaiveDateTime::parse_from_str(&entry.first_seen, FIRST_SEEN_FORMAT)
        .context(EventTimeSnafu {
            record,
            field: "first_seen",
            value: entry.first_seen.as_str(),
        })?
        .and_utc();

    let last_online = match entry.last_online.as_deref() {
        None | Some("") => None,
        Some(value) => Some(
            NaiveDate::parse_from_str(value, LAST_ONLINE_FORMAT)
                .context(EventTimeSnafu {
                    record,
                    field: "last_online",
                    value,
                })?
                .and_time(NaiveTime::MIN)
                .and_utc(),
        ),
    };

    let row = serde_json::to_value(FeodoRow {
        entry,
        first_seen,
        last_online,
    })
    .context(RowSnafu { record })?;

    Ok(FeedRecord {
        event_time: first_seen,
        row,
    })
}

/// Arrow shape of `abusech_feodo` rows.
pub fn feodo_schema() -> SchemaRef {
    let timestamp = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));

    Arc::new(Schema::new(vec![
        Field::new("ip_address", DataType::Utf8, false),
        Field::new("port", DataType::Int64, true),
        Field::new("status", DataType::Utf8, true),
        Field::new("hostname", DataType::Utf8, true),
        Field::new("as_number", DataType::Int64, true),
        Field::new("as_name", DataType::Utf8, true),
        Field::new("country", DataType::Utf8, true),
        Field::new("first_seen", timestamp.clone(), false),
        Field::new("last_online", timestamp, true),
        Field::new("malware", DataType::Utf8, true),
    ]))
}
