//! Generation-versioned index store.
//!
//! Every build of an indexed name writes a fresh *generation*: a complete,
//! immutable row set. Queries only ever see committed generations, and the
//! active generation is switched by a single atomic commit. Older generations
//! stay readable (for in-flight pagination) until they are reclaimed.
//!
//! Row order is fixed by the store, not by insertion order:
//!
//! - locus rows by `(chromosome, start, end, source_key, byte_offset)`
//! - value rows by `(value, source_key, byte_offset)`

mod sqlite;

pub use sqlite::SqliteIndexStore;

use crate::Result;
use crate::query::QuerySpec;
use crate::schema::RowKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type GenerationId = i64;

/// One indexed record: its key and where its bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub key: RowKey,
    pub source_key: String,
    pub byte_offset: u64,
    pub byte_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Building,
    Active,
    Retired,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Building => "building",
            GenerationState::Active => "active",
            GenerationState::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(GenerationState::Building),
            "active" => Some(GenerationState::Active),
            "retired" => Some(GenerationState::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationInfo {
    pub id: GenerationId,
    pub name: String,
    /// Schema string the generation was built with.
    pub schema: String,
    pub state: GenerationState,
    pub row_count: u64,
    /// Largest `end - start` of any locus row.
    pub max_span: i64,
    /// Commit time, milliseconds since the epoch.
    pub committed_at: Option<u64>,
}

/// Keyset pagination position: the sort key of the last row returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum Cursor {
    Locus {
        chromosome: String,
        start: i64,
        end: i64,
        source_key: String,
        byte_offset: u64,
    },
    Value {
        value: String,
        source_key: String,
        byte_offset: u64,
    },
}

impl Cursor {
    pub fn after(row: &IndexRow) -> Self {
        match &row.key {
            RowKey::Locus {
                chromosome,
                start,
                end,
            } => Cursor::Locus {
                chromosome: chromosome.clone(),
                start: *start,
                end: *end,
                source_key: row.source_key.clone(),
                byte_offset: row.byte_offset,
            },
            RowKey::Value(value) => Cursor::Value {
                value: value.clone(),
                source_key: row.source_key.clone(),
                byte_offset: row.byte_offset,
            },
        }
    }
}

/// A page of rows plus the cursor to continue from, if more rows remain.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<IndexRow>,
    pub next: Option<Cursor>,
}

impl Page {
    /// Build a page from up to `limit + 1` rows read in store order.
    pub fn from_overfetch(mut rows: Vec<IndexRow>, limit: usize) -> Self {
        if rows.len() <= limit {
            return Page { rows, next: None };
        }
        rows.truncate(limit);
        let next = rows.last().map(Cursor::after);
        Page { rows, next }
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Start a new, invisible generation for `name`.
    async fn create_generation(&self, name: &str, schema: &str) -> Result<GenerationId>;

    /// Append rows to a building generation.
    async fn insert_batch(
        &self,
        name: &str,
        generation: GenerationId,
        rows: Vec<IndexRow>,
    ) -> Result<()>;

    /// Atomically make a building generation the active one, retiring the
    /// previous active generation.
    async fn commit_generation(&self, name: &str, generation: GenerationId) -> Result<()>;

    /// Drop a generation that failed to build.
    async fn abort_generation(&self, name: &str, generation: GenerationId) -> Result<()>;

    /// Drop building generations left behind by interrupted builds.
    async fn discard_incomplete(&self, name: &str) -> Result<Vec<GenerationId>>;

    async fn active_generation(&self, name: &str) -> Result<GenerationInfo>;

    /// A committed generation (active or retired) of `name`.
    async fn generation(&self, name: &str, generation: GenerationId) -> Result<GenerationInfo>;

    /// Active generation info, or `None` if `name` was never built.
    async fn describe(&self, name: &str) -> Result<Option<GenerationInfo>>;

    /// Locus rows overlapping `[start, end]` on `chromosome`.
    #[allow(clippy::too_many_arguments)]
    async fn range_query(
        &self,
        name: &str,
        generation: GenerationId,
        chromosome: &str,
        start: i64,
        end: i64,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page>;

    async fn value_query(
        &self,
        name: &str,
        generation: GenerationId,
        value: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page>;

    /// Every row of the generation in store order.
    async fn scan(
        &self,
        name: &str,
        generation: GenerationId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page>;

    async fn count(&self, name: &str, generation: GenerationId, query: &QuerySpec) -> Result<u64>;

    /// Total record bytes matching `query`, without reading any record.
    async fn byte_total(
        &self,
        name: &str,
        generation: GenerationId,
        query: &QuerySpec,
    ) -> Result<u64>;

    /// Distinct value keys, sorted.
    async fn list_keys(&self, name: &str, generation: GenerationId) -> Result<Vec<String>>;

    /// Distinct value keys starting with `prefix`, sorted.
    async fn match_keys(
        &self,
        name: &str,
        generation: GenerationId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Drop retired generations of `name` retired at least `retention` ago.
    async fn reclaim(&self, name: &str, retention: Duration) -> Result<Vec<GenerationId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_row(value: &str, offset: u64) -> IndexRow {
        IndexRow {
            key: RowKey::Value(value.to_string()),
            source_key: "part-0.json".to_string(),
            byte_offset: offset,
            byte_length: 10,
        }
    }

    #[test]
    fn test_page_from_overfetch() {
        let rows = vec![value_row("a", 0), value_row("a", 10), value_row("a", 20)];
        let page = Page::from_overfetch(rows.clone(), 2);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.next, Some(Cursor::after(&rows[1])));

        let page = Page::from_overfetch(rows, 3);
        assert_eq!(page.rows.len(), 3);
        assert!(page.next.is_none());
    }

    #[test]
    fn test_generation_state_round_trip() {
        for state in [
            GenerationState::Building,
            GenerationState::Active,
            GenerationState::Retired,
        ] {
            assert_eq!(GenerationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(GenerationState::parse("gone"), None);
    }
}
