//! AlienVault OTX pulses from subscribed authors.
//!
//! `GET /api/v1/pulses/subscribed?limit=N&modified_since=T` returns pulses
//! modified at or after `T`, newest first, with an absolute `next` URL until
//! the last page. The event time of a pulse is its `modified` time.

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::{FeedRecord, FeedSource, HttpClient, Page, PageStream};
use crate::config::ApiKey;
use crate::error::{EventTimeSnafu, FeedError, InvalidUrlSnafu, RowSnafu};

const SUBSCRIBED_PATH: &str = "/api/v1/pulses/subscribed";
const API_KEY_HEADER: &str = "X-OTX-API-KEY";
const SINCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f+00:00";
const PULSE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Paginated OTX subscription feed.
pub struct OtxSubscribed {
    http: HttpClient,
    base_url: Url,
    api_key: ApiKey,
    page_limit: u32,
    table: String,
    schema: SchemaRef,
}

impl OtxSubscribed {
    pub fn new(
        http: HttpClient,
        base_url: Url,
        api_key: ApiKey,
        page_limit: u32,
        table: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            page_limit,
            table: table.into(),
            schema: pulse_schema(),
        }
    }

    fn first_page(&self, since: DateTime<Utc>) -> Result<Url, FeedError> {
        let mut url = self
            .base_url
            .join(SUBSCRIBED_PATH)
            .context(InvalidUrlSnafu {
                url: self.base_url.as_str(),
            })?;
        url.query_pairs_mut()
            .append_pair("limit", &self.page_limit.to_string())
            .append_pair("modified_since", &since.format(SINCE_FORMAT).to_string());
        Ok(url)
    }

    async fn fetch_page(&self, url: &Url) -> Result<Page, FeedError> {
        let response: SubscribedResponse = self
            .http
            .get_json(url, &[(API_KEY_HEADER, self.api_key.expose())])
            .await?;
        debug!(
            count = ?response.count,
            results = response.results.len(),
            next = ?response.next,
            "OTX subscribed page"
        );
        parse_page(url, response)
    }

    /// Fetch the page at `cursor` and hand back where the following one is.
    async fn advance(&self, cursor: Option<Url>) -> Result<Option<(Page, Option<Url>)>, FeedError> {
        let Some(url) = cursor else {
            return Ok(None);
        };
        let page = self.fetch_page(&url).await?;
        let next = page.next.clone();
        Ok(Some((page, next)))
    }
}

impl FeedSource for OtxSubscribed {
    fn name(&self) -> &str {
        "otx_subscribed"
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn fetch(&self, since: DateTime<Utc>) -> PageStream<'_> {
        let first = match self.first_page(since) {
            Ok(url) => url,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        stream::try_unfold(Some(first), move |cursor| self.advance(cursor)).boxed()
    }
}

/// One page of `/api/v1/pulses/subscribed`.
#[derive(Debug, Deserialize)]
pub(crate) struct SubscribedResponse {
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<Pulse>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct Pulse {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub author_name: Option<String>,
    #[serde(skip_serializing)]
    pub created: String,
    #[serde(skip_serializing)]
    pub modified: String,
    pub revision: Option<i64>,
    pub tlp: Option<String>,
    pub public: Option<i64>,
    pub adversary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub references: Option<Vec<String>>,
    pub targeted_countries: Option<Vec<String>>,
    pub malware_families: Option<Vec<String>>,
    pub attack_ids: Option<Vec<String>>,
    pub industries: Option<Vec<String>>,
    pub more_indicators: Option<bool>,
    pub indicators: Option<Vec<Indicator>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct Indicator {
    pub id: Option<i64>,
    pub indicator: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub role: Option<String>,
    pub created: Option<String>,
    pub expiration: Option<String>,
    pub is_active: Option<i64>,
}

#[derive(Serialize)]
struct PulseRow<'a> {
    #[serde(flatten)]
    pulse: &'a Pulse,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

/// Turn a decoded response into a page, resolving `next` against `url`.
pub(crate) fn parse_page(url: &Url, response: SubscribedResponse) -> Result<Page, FeedError> {
    let records = response
        .results
        .iter()
        .map(pulse_record)
        .collect::<Result<Vec<_>, _>>()?;

    let next = match response.next.as_deref() {
        None | Some("") => None,
        Some(next) => Some(url.join(next).context(InvalidUrlSnafu { url: next })?),
    };

    Ok(Page::new(records, next))
}

fn pulse_record(pulse: &Pulse) -> Result<FeedRecord, FeedError> {
    let created = parse_pulse_time(pulse, "created", &pulse.created)?;
    let modified = parse_pulse_time(pulse, "modified", &pulse.modified)?;

    let row = serde_json::to_value(PulseRow {
        pulse,
        created,
        modified,
    })
    .context(RowSnafu {
        record: pulse.id.as_str(),
    })?;

    Ok(FeedRecord {
        event_time: modified,
        row,
    })
}

fn parse_pulse_time(
    pulse: &Pulse,
    field: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, FeedError> {
    match NaiveDateTime::parse_from_str(value, PULSE_TIME_FORMAT) {
        Ok(naive) => Ok(naive.and_utc()),
        Err(naive_error) => DateTime::parse_from_rfc3339(value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|_| naive_error)
            .context(EventTimeSnafu {
                record: pulse.id.as_str(),
                field,
                value,
            }),
    }
}

/// Arrow shape of `otx_pulses` rows.
pub fn pulse_schema() -> SchemaRef {
    let timestamp = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    let strings = DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)));
    let indicator = DataType::Struct(Fields::from(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("indicator", DataType::Utf8, true),
        Field::new("type", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("description", DataType::Utf8, true),
        Field::new("content", DataType::Utf8, true),
        Field::new("role", DataType::Utf8, true),
        Field::new("created", DataType::Utf8, true),
        Field::new("expiration", DataType::Utf8, true),
        Field::new("is_active", DataType::Int64, true),
    ]));

    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("description", DataType::Utf8, true),
        Field::new("author_name", DataType::Utf8, true),
        Field::new("created", timestamp.clone(), false),
        Field::new("modified", timestamp, false),
        Field::new("revision", DataType::Int64, true),
        Field::new("tlp", DataType::Utf8, true),
        Field::new("public", DataType::Int64, true),
        Field::new("adversary", DataType::Utf8, true),
        Field::new("tags", strings.clone(), true),
        Field::new("references", strings.clone(), true),
        Field::new("targeted_countries", strings.clone(), true),
        Field::new("malware_families", strings.clone(), true),
        Field::new("attack_ids", strings.clone(), true),
        Field::new("industries", strings, true),
        Field::new("more_indicators", DataType::Boolean, true),
        Field::new(
            "indicators",
            DataType::List(Arc::new(Field::new("item", indicator, true))),
            true,
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::json::ReaderBuilder;
    use chrono::TimeZone;
    use serde_json::json;

    fn page_url() -> Url {
        Url::parse("https://otx.example.test/api/v1/pulses/subscribed?limit=50").unwrap()
    }

    fn response(value: serde_json::Value) -> SubscribedResponse {
        serde_json::from_value(value).unwrap()
    }

    fn pulse(id: &str, modified: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": "Emotet wave",
            "description": "",
            "author_name": "AlienVault",
            "created": "2024-02-28T08:00:00.123000",
            "modified": modified,
            "revision": 3,
            "tlp": "white",
            "public": 1,
            "adversary": "",
            "tags": ["emotet", "botnet"],
            "references": [],
            "targeted_countries": ["Japan"],
            "malware_families": ["Emotet"],
            "attack_ids": ["T1566"],
            "industries": [],
            "more_indicators": false,
            "extract_source": [],
            "indicators": [{
                "id": 3418571,
                "indicator": "198.51.100.7",
                "type": "IPv4",
                "title": "",
                "description": "",
                "content": "",
                "role": null,
                "created": "2024-02-28T08:00:01",
                "expiration": null,
                "is_active": 1
            }]
        })
    }

    #[test]
    fn test_first_page_query() {
        let source = OtxSubscribed::new(
            HttpClient::new(std::time::Duration::from_secs(5)).unwrap(),
            Url::parse("https://otx.alienvault.com").unwrap(),
            ApiKey::new("k"),
            50,
            "otx_pulses",
        );
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        let url = source.first_page(since).unwrap();
        assert_eq!(url.path(), "/api/v1/pulses/subscribed");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("limit".to_string(), "50".to_string()),
                (
                    "modified_since".to_string(),
                    "2024-03-01T12:30:00.000+00:00".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_parse_page_event_time_and_next() {
        let page = parse_page(
            &page_url(),
            response(json!({
                "count": 120,
                "next": "https://otx.example.test/api/v1/pulses/subscribed?limit=50&page=2",
                "previous": null,
                "results": [pulse("p1", "2024-03-01T10:15:30.500000")]
            })),
        )
        .unwrap();

        assert!(page.has_next());
        assert_eq!(page.next.as_ref().unwrap().query(), Some("limit=50&page=2"));

        let record = &page.records[0];
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
            + chrono::Duration::milliseconds(500);
        assert_eq!(record.event_time, expected);
        assert_eq!(record.row["id"], "p1");
        assert_eq!(record.row["modified"], "2024-03-01T10:15:30.500Z");
        assert_eq!(record.row["indicators"][0]["type"], "IPv4");
        assert!(record.row.get("extract_source").is_none());
    }

    #[test]
    fn test_last_page() {
        for next in [json!(null), json!("")] {
            let page = parse_page(
                &page_url(),
                response(json!({"count": 1, "next": next, "results": []})),
            )
            .unwrap();
            assert!(!page.has_next());
            assert!(page.is_empty());
        }
    }

    #[test]
    fn test_rfc3339_modified_accepted() {
        let page = parse_page(
            &page_url(),
            response(json!({"results": [pulse("p1", "2024-03-01T10:00:00Z")]})),
        )
        .unwrap();
        assert_eq!(
            page.records[0].event_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_malformed_modified_fails_page() {
        let err = parse_page(
            &page_url(),
            response(json!({"results": [
                pulse("p1", "2024-03-01T10:00:00"),
                pulse("p2", "yesterday")
            ]})),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            FeedError::EventTime { ref record, field: "modified", .. } if record == "p2"
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_rows_fit_schema() {
        let page = parse_page(
            &page_url(),
            response(json!({"results": [
                pulse("p1", "2024-03-01T10:00:00"),
                pulse("p2", "2024-03-01T11:00:00.25")
            ]})),
        )
        .unwrap();
        let rows: Vec<_> = page.records.into_iter().map(|r| r.row).collect();

        let mut decoder = ReaderBuilder::new(pulse_schema())
            .build_decoder()
            .unwrap();
        decoder.serialize(&rows).unwrap();
        let batch = decoder.flush().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 2);
    }
}
