use crate::{
    error::LeaseStoreError,
    lease::{LeaseOp, LeaseRequest, LeaseStore, RejectReason, UpdateResult, rules},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use connectors::http::ClusterClient;
use model::{
    core::version::{ClusterVersion, Distribution},
    pagination::cursor::ProgressCursor,
    work::{item::WorkItem, lease::LeaseRecord},
};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

pub const INDEX_PREFIX: &str = ".bulkshift_working_state";

const SKEW_MARKER: &str = "bulkshift_clock_skew:";
const LIST_LIMIT: usize = 10_000;

/// Runs the lease rules inside the cluster, against the cluster's clock.
/// Rejections turn the update into a noop; the caller reads the document back
/// to learn why.
const LEASE_SCRIPT: &str = r#"
long now = System.currentTimeMillis();
long skew = params.client_time - now;
if (Math.abs(skew) > params.tolerance_ms) {
  throw new IllegalArgumentException('bulkshift_clock_skew:' + skew);
}
def s = ctx._source;
if (s.completed_at != null) { ctx.op = 'noop'; return; }
boolean valid = s.holder_id != null && s.expiry != null && s.expiry > now;
boolean mine = valid && s.holder_id == params.holder;
if (params.op == 'acquire') {
  if (valid && !mine) { ctx.op = 'noop'; return; }
  if (mine) {
    s.expiry = now + s.lease_duration_ms;
  } else {
    int exp = (int) Math.min(s.next_acquisition_exponent, params.max_exponent);
    long d = params.initial_ms * (1L << exp);
    s.holder_id = params.holder;
    s.expiry = now + d;
    s.lease_duration_ms = d;
    s.next_acquisition_exponent = s.next_acquisition_exponent + 1;
  }
} else {
  if (!mine) { ctx.op = 'noop'; return; }
  if (params.cursor != null) {
    if (s.acknowledged_cursor != null && params.cursor.position < s.acknowledged_cursor.position) {
      ctx.op = 'noop'; return;
    }
    s.acknowledged_cursor = params.cursor;
  }
  if (params.op == 'renew') { s.expiry = now + s.lease_duration_ms; }
  else if (params.op == 'release') { s.expiry = now; }
  else { s.completed_at = now; }
}
s.updated_at = now;
"#;

/// Request layout for the lease index, chosen once from the cluster version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseSchema {
    Typeless,
    Typed { type_name: &'static str },
}

impl LeaseSchema {
    pub fn for_version(version: &ClusterVersion) -> Result<Self, LeaseStoreError> {
        match (version.distribution, version.major) {
            (Distribution::OpenSearch, 1..=2) => Ok(LeaseSchema::Typeless),
            (Distribution::Elasticsearch, 7) => Ok(LeaseSchema::Typeless),
            (Distribution::Elasticsearch, 6) => Ok(LeaseSchema::Typed { type_name: "_doc" }),
            (Distribution::Elasticsearch, 5) => Ok(LeaseSchema::Typed { type_name: "doc" }),
            _ => Err(LeaseStoreError::UnsupportedVersion(version.to_string())),
        }
    }

    pub fn doc_path(&self, index: &str, id: &str) -> String {
        match self {
            LeaseSchema::Typeless => format!("{index}/_doc/{id}"),
            LeaseSchema::Typed { type_name } => format!("{index}/{type_name}/{id}"),
        }
    }

    pub fn update_path(&self, index: &str, id: &str) -> String {
        match self {
            LeaseSchema::Typeless => format!("{index}/_update/{id}"),
            LeaseSchema::Typed { type_name } => format!("{index}/{type_name}/{id}/_update"),
        }
    }

    pub fn create_index_body(&self) -> Value {
        let properties = json!({
            "snapshot": { "type": "keyword" },
            "index": { "type": "keyword" },
            "shard": { "type": "integer" },
            "holder_id": { "type": "keyword" },
            "expiry": { "type": "date", "format": "epoch_millis" },
            "lease_duration_ms": { "type": "long" },
            "next_acquisition_exponent": { "type": "integer" },
            "acknowledged_cursor": {
                "properties": {
                    "position": { "type": "long" },
                    "docs_in_batch": { "type": "long" },
                    "bytes_in_batch": { "type": "long" }
                }
            },
            "completed_at": { "type": "date", "format": "epoch_millis" },
            "created_at": { "type": "date", "format": "epoch_millis" },
            "updated_at": { "type": "date", "format": "epoch_millis" }
        });

        let mappings = match self {
            LeaseSchema::Typeless => json!({ "properties": properties }),
            LeaseSchema::Typed { type_name } => {
                let mut typed = serde_json::Map::new();
                typed.insert(type_name.to_string(), json!({ "properties": properties }));
                Value::Object(typed)
            }
        };

        json!({
            "settings": { "index": { "number_of_shards": 1 } },
            "mappings": mappings
        })
    }
}

/// Cursor as stored in the lease document; the work item is implied by the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredCursor {
    position: u64,
    docs_in_batch: u64,
    bytes_in_batch: u64,
}

/// Lease record as an index document: snake_case fields, epoch-millisecond times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredLease {
    snapshot: String,
    index: String,
    shard: u32,
    holder_id: Option<String>,
    expiry: Option<i64>,
    lease_duration_ms: u64,
    next_acquisition_exponent: u32,
    acknowledged_cursor: Option<StoredCursor>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl StoredLease {
    fn from_record(record: &LeaseRecord) -> Self {
        Self {
            snapshot: record.work_item.snapshot.clone(),
            index: record.work_item.index.clone(),
            shard: record.work_item.shard,
            holder_id: record.holder_id.clone(),
            expiry: record.expiry.map(|t| t.timestamp_millis()),
            lease_duration_ms: record.lease_duration_ms,
            next_acquisition_exponent: record.next_acquisition_exponent,
            acknowledged_cursor: record.acknowledged_cursor.as_ref().map(|c| StoredCursor {
                position: c.position,
                docs_in_batch: c.docs_in_batch,
                bytes_in_batch: c.bytes_in_batch,
            }),
            completed_at: record.completed_at.map(|t| t.timestamp_millis()),
            created_at: record.created_at.timestamp_millis(),
            updated_at: record.updated_at.timestamp_millis(),
        }
    }

    fn into_record(self) -> Result<LeaseRecord, LeaseStoreError> {
        let work_item = WorkItem::new(self.snapshot, self.index, self.shard);
        let acknowledged_cursor = self.acknowledged_cursor.map(|c| {
            ProgressCursor::new(work_item.clone(), c.position, c.docs_in_batch, c.bytes_in_batch)
        });

        Ok(LeaseRecord {
            holder_id: self.holder_id,
            expiry: self.expiry.map(from_millis).transpose()?,
            lease_duration_ms: self.lease_duration_ms,
            next_acquisition_exponent: self.next_acquisition_exponent,
            acknowledged_cursor,
            completed_at: self.completed_at.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            work_item,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, LeaseStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LeaseStoreError::Protocol(format!("timestamp out of range: {ms}")))
}

fn script_params(request: &LeaseRequest, tolerance: Duration) -> Value {
    let (initial_ms, cursor) = match &request.op {
        LeaseOp::Acquire { initial_duration } => (initial_duration.as_millis() as u64, None),
        LeaseOp::Renew { cursor } | LeaseOp::Release { cursor } => (0, cursor.as_ref()),
        LeaseOp::Complete => (0, None),
    };

    json!({
        "op": request.op.name(),
        "holder": request.holder_id,
        "client_time": request.client_time.timestamp_millis(),
        "tolerance_ms": tolerance.as_millis() as u64,
        "initial_ms": initial_ms,
        "max_exponent": rules::MAX_LEASE_EXPONENT,
        "cursor": cursor.map(|c| json!({
            "position": c.position,
            "docs_in_batch": c.docs_in_batch,
            "bytes_in_batch": c.bytes_in_batch,
        })),
    })
}

/// Pulls the signed skew out of the script's exception text.
fn parse_skew(body: &str) -> Option<i64> {
    let start = body.find(SKEW_MARKER)? + SKEW_MARKER.len();
    let digits: String = body[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

fn unavailable(err: reqwest::Error) -> LeaseStoreError {
    LeaseStoreError::Unavailable(err.to_string())
}

fn status_error(status: StatusCode, body: &str) -> LeaseStoreError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        LeaseStoreError::Unavailable(format!("{status}: {body}"))
    } else {
        LeaseStoreError::Protocol(format!("{status}: {body}"))
    }
}

/// Lease store kept in a hidden index on the target cluster, shared by every
/// worker that can reach it.
#[derive(Debug, Clone)]
pub struct ClusterLeaseStore {
    client: ClusterClient,
    schema: LeaseSchema,
    index: String,
    skew_tolerance: Duration,
}

impl ClusterLeaseStore {
    pub fn new(
        client: ClusterClient,
        schema: LeaseSchema,
        index_suffix: &str,
        skew_tolerance: Duration,
    ) -> Self {
        Self {
            client,
            schema,
            index: format!("{INDEX_PREFIX}{index_suffix}"),
            skew_tolerance,
        }
    }

    /// Probes the cluster version, picks the schema and makes sure the index exists.
    pub async fn connect(
        client: ClusterClient,
        index_suffix: &str,
        skew_tolerance: Duration,
    ) -> Result<Self, LeaseStoreError> {
        let version = client
            .detect_version()
            .await
            .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?;
        let schema = LeaseSchema::for_version(&version)?;
        let store = Self::new(client, schema, index_suffix, skew_tolerance);
        store.ensure_index().await?;
        info!(index = %store.index, ?schema, "Cluster lease store ready");
        Ok(store)
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    pub async fn ensure_index(&self) -> Result<(), LeaseStoreError> {
        let response = self
            .client
            .request(Method::PUT, &self.index)
            .json(&self.schema.create_index_body())
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;

        if status.is_success() || body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(status_error(status, &body))
    }

    async fn search(&self, query: Value, size: usize) -> Result<Vec<LeaseRecord>, LeaseStoreError> {
        let response = self
            .client
            .request(Method::POST, &format!("{}/_search", self.index))
            .json(&json!({ "size": size, "query": query }))
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| LeaseStoreError::Protocol(e.to_string()))?;
        let hits = parsed
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .ok_or_else(|| LeaseStoreError::Protocol("search response without hits".into()))?;

        hits.iter()
            .map(|hit| {
                let source = hit.get("_source").cloned().unwrap_or(Value::Null);
                serde_json::from_value::<StoredLease>(source)
                    .map_err(|e| LeaseStoreError::Serialization(e.to_string()))?
                    .into_record()
            })
            .collect()
    }

    /// Works out why a noop update was not applied, from the record as it is now.
    async fn explain_noop(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError> {
        let Some(current) = self.get(item).await? else {
            return Ok(UpdateResult::Rejected(RejectReason::NotFound));
        };

        if current.is_completed()
            && request.op == LeaseOp::Complete
            && current.holder_id.as_deref() == Some(request.holder_id.as_str())
        {
            return Ok(UpdateResult::Applied(current));
        }

        let reason = rules::rejection(&current, request, Utc::now()).unwrap_or(RejectReason::Conflict);
        Ok(UpdateResult::Rejected(reason))
    }
}

#[async_trait]
impl LeaseStore for ClusterLeaseStore {
    async fn create_work_items(&self, items: &[WorkItem]) -> Result<usize, LeaseStoreError> {
        let now = Utc::now();
        let mut created = 0;

        for item in items {
            let doc = StoredLease::from_record(&LeaseRecord::unassigned(item.clone(), now));
            let path = format!(
                "{}?op_type=create&refresh=true",
                self.schema.doc_path(&self.index, &item.key())
            );
            let response = self
                .client
                .request(Method::PUT, &path)
                .json(&doc)
                .send()
                .await
                .map_err(unavailable)?;

            match response.status() {
                s if s.is_success() => created += 1,
                StatusCode::CONFLICT => debug!(work_item = %item, "Work item already exists"),
                s => {
                    let body = response.text().await.map_err(unavailable)?;
                    return Err(status_error(s, &body));
                }
            }
        }
        Ok(created)
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let query = json!({
            "bool": {
                "must_not": [{ "exists": { "field": "completed_at" } }],
                "should": [
                    { "range": { "expiry": { "lt": "now" } } },
                    { "bool": { "must_not": [{ "exists": { "field": "expiry" } }] } }
                ],
                "minimum_should_match": 1
            }
        });

        let records = self.search(query, limit).await?;
        Ok(records.into_iter().map(|r| r.work_item).collect())
    }

    async fn conditional_update(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError> {
        let path = format!(
            "{}?refresh=true&retry_on_conflict=0&_source=true",
            self.schema.update_path(&self.index, &item.key())
        );
        let body = json!({
            "script": {
                "lang": "painless",
                "source": LEASE_SCRIPT,
                "params": script_params(request, self.skew_tolerance),
            }
        });

        let response = self
            .client
            .request(Method::POST, &path)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let text = response.text().await.map_err(unavailable)?;

        match status {
            StatusCode::NOT_FOUND => return Ok(UpdateResult::Rejected(RejectReason::NotFound)),
            StatusCode::CONFLICT => return Ok(UpdateResult::Rejected(RejectReason::Conflict)),
            s if !s.is_success() => {
                if let Some(skew_ms) = parse_skew(&text) {
                    return Err(LeaseStoreError::ClockSkew {
                        skew_ms,
                        tolerance_ms: self.skew_tolerance.as_millis() as u64,
                    });
                }
                return Err(status_error(s, &text));
            }
            _ => {}
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| LeaseStoreError::Protocol(e.to_string()))?;
        if parsed.get("result").and_then(Value::as_str) == Some("noop") {
            return self.explain_noop(item, request).await;
        }

        let source = parsed
            .pointer("/get/_source")
            .cloned()
            .ok_or_else(|| LeaseStoreError::Protocol("update response without _source".into()))?;
        let record = serde_json::from_value::<StoredLease>(source)
            .map_err(|e| LeaseStoreError::Serialization(e.to_string()))?
            .into_record()?;
        Ok(UpdateResult::Applied(record))
    }

    async fn get(&self, item: &WorkItem) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        let path = format!(
            "{}?refresh=true",
            self.schema.doc_path(&self.index, &item.key())
        );
        let response = self
            .client
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await.map_err(unavailable)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| LeaseStoreError::Protocol(e.to_string()))?;
        match parsed.get("_source") {
            Some(source) => serde_json::from_value::<StoredLease>(source.clone())
                .map_err(|e| LeaseStoreError::Serialization(e.to_string()))?
                .into_record()
                .map(Some),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseStoreError> {
        self.search(json!({ "match_all": {} }), LIST_LIMIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn schema_follows_cluster_version() {
        let cases = [
            (Distribution::OpenSearch, 1, LeaseSchema::Typeless),
            (Distribution::OpenSearch, 2, LeaseSchema::Typeless),
            (Distribution::Elasticsearch, 7, LeaseSchema::Typeless),
            (Distribution::Elasticsearch, 6, LeaseSchema::Typed { type_name: "_doc" }),
            (Distribution::Elasticsearch, 5, LeaseSchema::Typed { type_name: "doc" }),
        ];
        for (dist, major, expected) in cases {
            let version = ClusterVersion::new(dist, major, 0, 0);
            assert_eq!(LeaseSchema::for_version(&version).unwrap(), expected);
        }

        for (dist, major) in [
            (Distribution::Elasticsearch, 2),
            (Distribution::Elasticsearch, 8),
            (Distribution::Elasticsearch, 9),
            (Distribution::OpenSearch, 3),
        ] {
            let version = ClusterVersion::new(dist, major, 0, 0);
            assert!(
                matches!(
                    LeaseSchema::for_version(&version),
                    Err(LeaseStoreError::UnsupportedVersion(_))
                ),
                "{version} should be refused"
            );
        }
    }

    #[test]
    fn paths_carry_type_segment_only_when_typed() {
        let idx = ".bulkshift_working_state";
        assert_eq!(
            LeaseSchema::Typeless.update_path(idx, "s__i__0"),
            ".bulkshift_working_state/_update/s__i__0"
        );
        let typed = LeaseSchema::Typed { type_name: "_doc" };
        assert_eq!(
            typed.update_path(idx, "s__i__0"),
            ".bulkshift_working_state/_doc/s__i__0/_update"
        );
        assert_eq!(typed.doc_path(idx, "x"), ".bulkshift_working_state/_doc/x");
        assert!(typed.create_index_body().pointer("/mappings/_doc/properties/expiry").is_some());
        assert!(
            LeaseSchema::Typeless
                .create_index_body()
                .pointer("/mappings/properties/expiry")
                .is_some()
        );
    }

    #[test]
    fn stored_document_keeps_record_fields() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let item = WorkItem::new("snap", "logs", 3);
        let mut record = LeaseRecord::unassigned(item.clone(), now);
        record.holder_id = Some("worker-1".into());
        record.expiry = Some(now + TimeDelta::seconds(60));
        record.lease_duration_ms = 60_000;
        record.next_acquisition_exponent = 1;
        record.acknowledged_cursor = Some(ProgressCursor::new(item, 500, 100, 4_096));

        let doc = serde_json::to_value(StoredLease::from_record(&record)).unwrap();
        assert_eq!(doc["holder_id"], "worker-1");
        assert_eq!(doc["acknowledged_cursor"]["position"], 500);
        assert!(doc["completed_at"].is_null());

        let back = serde_json::from_value::<StoredLease>(doc).unwrap().into_record().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn script_params_carry_op_and_cursor() {
        let item = WorkItem::new("s", "i", 0);
        let request = LeaseRequest::new(
            "w1",
            Utc::now(),
            LeaseOp::Renew {
                cursor: Some(ProgressCursor::new(item, 10, 10, 100)),
            },
        );
        let params = script_params(&request, Duration::from_secs(5));
        assert_eq!(params["op"], "renew");
        assert_eq!(params["tolerance_ms"], 5_000);
        assert_eq!(params["cursor"]["position"], 10);

        let acquire = LeaseRequest::new(
            "w1",
            Utc::now(),
            LeaseOp::Acquire {
                initial_duration: Duration::from_secs(30),
            },
        );
        let params = script_params(&acquire, Duration::from_secs(5));
        assert_eq!(params["initial_ms"], 30_000);
        assert!(params["cursor"].is_null());
    }

    #[test]
    fn skew_is_read_from_script_exception() {
        let body = r#"{"error":{"caused_by":{"type":"illegal_argument_exception","reason":"bulkshift_clock_skew:-7012"}}}"#;
        assert_eq!(parse_skew(body), Some(-7012));
        assert_eq!(parse_skew(r#"{"error":"other"}"#), None);
    }
}
