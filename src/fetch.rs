//! Concurrent byte-range record fetch and result shaping.
//!
//! Hits are fetched in parallel, bounded by a semaphore, and written into a
//! slot per hit so the output keeps index order no matter which read finishes
//! first.

use crate::index::IndexRow;
use crate::storage::{ByteRange, ObjectStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub type Record = Map<String, Value>;

/// Result data layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// A list of records.
    #[default]
    #[serde(alias = "r")]
    Row,
    /// Field name to the values of that field, aligned by record position.
    #[serde(alias = "col", alias = "c")]
    Column,
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "row" | "r" => Ok(Format::Row),
            "column" | "col" | "c" => Ok(Format::Column),
            other => Err(Error::InvalidInput(format!("unknown format: {other}"))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Row => f.write_str("row"),
            Format::Column => f.write_str("column"),
        }
    }
}

pub type Columns = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordData {
    Rows(Vec<Record>),
    Columns(Columns),
}

impl RecordData {
    /// Normalize `records` and lay them out as `format`.
    pub fn shape(mut records: Vec<Record>, format: Format) -> Self {
        match format {
            Format::Row => {
                fill_absent(&mut records);
                RecordData::Rows(records)
            }
            Format::Column => RecordData::Columns(to_columns(records)),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        match self {
            RecordData::Rows(rows) => rows.len(),
            RecordData::Columns(columns) => columns.values().map(Vec::len).max().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Give every record every field seen on the page; missing ones become `null`.
pub fn fill_absent(records: &mut [Record]) {
    let fields: BTreeSet<String> = records
        .iter()
        .flat_map(|record| record.keys().cloned())
        .collect();

    for record in records.iter_mut() {
        for field in &fields {
            if !record.contains_key(field) {
                record.insert(field.clone(), Value::Null);
            }
        }
    }
}

pub fn to_columns(mut records: Vec<Record>) -> Columns {
    fill_absent(&mut records);

    let mut columns = Columns::new();
    for record in records {
        for (field, value) in record {
            columns.entry(field).or_default().push(value);
        }
    }
    columns
}

pub fn to_rows(columns: &Columns) -> Vec<Record> {
    let len = columns.values().map(Vec::len).max().unwrap_or(0);
    (0..len)
        .map(|i| {
            columns
                .iter()
                .map(|(field, values)| (field.clone(), values.get(i).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect()
}

fn parse_record(key: &str, offset: u64, bytes: &[u8]) -> Result<Record> {
    let invalid = |message: String| Error::InvalidRecord {
        key: key.to_string(),
        offset,
        message,
    };
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(_) => Err(invalid("not a JSON object".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Reads the records behind index hits.
#[derive(Clone)]
pub struct RecordFetcher {
    objects: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl RecordFetcher {
    pub fn new(objects: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            objects,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch one record per row, in row order.
    ///
    /// The first failure fails the whole fetch; outstanding reads are
    /// aborted when the task set is dropped.
    pub async fn fetch(&self, rows: &[IndexRow]) -> Result<Vec<Record>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (slot, row) in rows.iter().enumerate() {
            let objects = Arc::clone(&self.objects);
            let semaphore = Arc::clone(&semaphore);
            let key = row.source_key.clone();
            let range = ByteRange {
                offset: row.byte_offset,
                length: row.byte_length,
            };

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("fetch semaphore closed: {e}")))?;
                let bytes = objects.read_range(&key, range).await?;
                let record = parse_record(&key, range.offset, &bytes)?;
                Ok::<_, Error>((slot, record))
            });
        }

        let mut slots: Vec<Option<Record>> = vec![None; rows.len()];
        while let Some(joined) = tasks.join_next().await {
            let (slot, record) =
                joined.map_err(|e| Error::Internal(format!("fetch task failed: {e}")))??;
            slots[slot] = Some(record);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                record.ok_or_else(|| Error::Internal(format!("record {i} was never fetched")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RowKey;
    use crate::storage::{ObjectInfo, ObjectReader};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory objects; reads of later offsets finish sooner.
    struct MemoryStore {
        objects: HashMap<String, Vec<u8>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    impl MemoryStore {
        fn new(objects: &[(&str, &str)]) -> Self {
            Self {
                objects: objects
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        async fn open_at(&self, key: &str, _offset: u64) -> Result<ObjectReader> {
            Err(Error::ObjectNotFound(key.to_string()))
        }

        async fn read_range(&self, key: &str, range: ByteRange) -> Result<Bytes> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(range.offset))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            let data = self
                .objects
                .get(key)
                .ok_or_else(|| Error::ObjectNotFound(key.to_string()))?;
            let start = range.offset as usize;
            let end = start + range.length as usize;
            data.get(start..end)
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| Error::ObjectStore(format!("{key}: short read")))
        }
    }

    const LINES: &str = "{\"a\":1}\n{\"a\":2,\"b\":\"x\"}\n{\"b\":\"y\"}\n";

    fn hit(key: &str, offset: u64, length: u32) -> IndexRow {
        IndexRow {
            key: RowKey::Value("k".to_string()),
            source_key: key.to_string(),
            byte_offset: offset,
            byte_length: length,
        }
    }

    fn hits() -> Vec<IndexRow> {
        vec![hit("p.json", 0, 7), hit("p.json", 8, 15), hit("p.json", 24, 9)]
    }

    #[tokio::test]
    async fn test_fetch_preserves_hit_order() {
        let store = Arc::new(MemoryStore::new(&[("p.json", LINES)]));
        let fetcher = RecordFetcher::new(store, 8);
        let records = fetcher.fetch(&hits()).await.unwrap();
        assert_eq!(
            Value::Array(records.into_iter().map(Value::Object).collect()),
            json!([{"a": 1}, {"a": 2, "b": "x"}, {"b": "y"}])
        );
    }

    #[tokio::test]
    async fn test_fetch_respects_concurrency_bound() {
        let store = Arc::new(MemoryStore::new(&[("p.json", LINES)]));
        let fetcher = RecordFetcher::new(store.clone(), 2);
        let mut many = Vec::new();
        for _ in 0..6 {
            many.extend(hits());
        }
        let records = fetcher.fetch(&many).await.unwrap();
        assert_eq!(records.len(), 18);
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dropping_fetch_aborts_outstanding_reads() {
        let store = Arc::new(MemoryStore::new(&[("p.json", LINES)]));
        let fetcher = RecordFetcher::new(store.clone(), 2);
        let mut many = Vec::new();
        for _ in 0..6 {
            many.extend(hits());
        }

        // Every read takes at least 16 ms.
        let result = tokio::time::timeout(Duration::from_millis(5), fetcher.fetch(&many)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.completed.load(Ordering::SeqCst) < many.len());
    }

    #[tokio::test]
    async fn test_any_failure_fails_the_fetch() {
        let store = Arc::new(MemoryStore::new(&[("p.json", LINES)]));
        let fetcher = RecordFetcher::new(store, 4);
        let mut rows = hits();
        rows.push(hit("missing.json", 0, 7));
        let err = fetcher.fetch(&rows).await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_non_object_record_is_invalid() {
        let store = Arc::new(MemoryStore::new(&[("p.json", "[1,2]\n")]));
        let fetcher = RecordFetcher::new(store, 4);
        let err = fetcher.fetch(&[hit("p.json", 0, 5)]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { offset: 0, .. }));
    }

    #[tokio::test]
    async fn test_empty_fetch() {
        let store = Arc::new(MemoryStore::new(&[]));
        let fetcher = RecordFetcher::new(store, 4);
        assert!(fetcher.fetch(&[]).await.unwrap().is_empty());
    }

    fn page() -> Vec<Record> {
        [json!({"a": 1}), json!({"a": 2, "b": "x"}), json!({"b": "y"})]
            .into_iter()
            .map(|v| match v {
                Value::Object(m) => m,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_row_shape_fills_absent_fields() {
        let data = RecordData::shape(page(), Format::Row);
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!([{"a": 1, "b": null}, {"a": 2, "b": "x"}, {"a": null, "b": "y"}])
        );
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_column_shape_aligns_values() {
        let data = RecordData::shape(page(), Format::Column);
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"a": [1, 2, null], "b": [null, "x", "y"]})
        );
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_row_and_column_are_lossless() {
        let mut rows = page();
        fill_absent(&mut rows);
        let columns = to_columns(rows.clone());
        assert_eq!(to_rows(&columns), rows);
        assert_eq!(to_columns(to_rows(&columns)), columns);
    }

    #[test]
    fn test_format_parsing() {
        for (raw, format) in [
            ("row", Format::Row),
            ("r", Format::Row),
            ("ROW", Format::Row),
            ("column", Format::Column),
            ("col", Format::Column),
            ("c", Format::Column),
        ] {
            assert_eq!(raw.parse::<Format>().unwrap(), format);
        }
        assert!("table".parse::<Format>().is_err());
        assert_eq!(
            serde_json::from_value::<Format>(json!("c")).unwrap(),
            Format::Column
        );
    }
}
