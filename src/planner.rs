//! Query planning and generation-pinned pagination.
//!
//! The first page of a query resolves the active generation and every later
//! page, reached through a continuation token, reads that same generation.

use crate::config::{Registry, TableDef};
use crate::continuation::{ContinuationToken, TOKEN_VERSION, TokenCodec};
use crate::fetch::Format;
use crate::index::{Cursor, GenerationId, GenerationInfo, IndexRow, IndexStore, Page};
use crate::profile::epoch_millis;
use crate::query::QuerySpec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Record bytes served so far, out of the total the query matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub bytes_read: u64,
    pub bytes_total: u64,
}

/// One page of index hits, ready for record fetch.
#[derive(Debug, Clone)]
pub struct PlannedPage {
    pub index: String,
    pub query: QuerySpec,
    pub rows: Vec<IndexRow>,
    pub limit: usize,
    pub page: u32,
    pub format: Format,
    /// Progress including this page.
    pub progress: Progress,
    pub continuation: Option<String>,
}

pub struct Planner {
    registry: Arc<Registry>,
    store: Arc<dyn IndexStore>,
    codec: TokenCodec,
    page_size: usize,
    max_page_size: usize,
}

/// Where a page starts.
struct PageRequest<'a> {
    index: &'a str,
    generation: GenerationId,
    query: QuerySpec,
    cursor: Option<&'a Cursor>,
    limit: usize,
    page: u32,
    format: Format,
    expires: u64,
    /// Progress before this page.
    progress: Progress,
}

impl Planner {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn IndexStore>,
        codec: TokenCodec,
        page_size: usize,
        max_page_size: usize,
    ) -> Self {
        Self {
            registry,
            store,
            codec,
            page_size,
            max_page_size,
        }
    }

    /// Requested page size clamped to `[1, max_page_size]`.
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size.max(1))
    }

    /// First page of `raw` against index `name`.
    pub async fn plan(
        &self,
        name: &str,
        raw: &str,
        limit: Option<usize>,
        format: Format,
    ) -> Result<PlannedPage> {
        let table = self.registry.get(name)?;
        let query = QuerySpec::parse(&table.schema, raw)?;
        self.first_page(name, table, query, limit, format).await
    }

    /// First page of every row of `name`.
    pub async fn all(&self, name: &str, limit: Option<usize>, format: Format) -> Result<PlannedPage> {
        let table = self.registry.get(name)?;
        self.first_page(name, table, QuerySpec::All, limit, format)
            .await
    }

    /// Next page of a paginated query. `format` overrides the token's.
    pub async fn resume(&self, raw: &str, format: Option<Format>) -> Result<PlannedPage> {
        let token = self.codec.decode(raw)?;
        let table = self.registry.get(&token.index)?;
        if !token.query.matches(&table.schema) {
            return Err(Error::SchemaMismatch(format!(
                "query `{}` does not fit the `{}` schema of {}",
                token.query, table.schema, token.index
            )));
        }

        let info = self.store.generation(&token.index, token.generation).await?;
        check_schema(&token.index, table, &info)?;

        self.page(PageRequest {
            index: &token.index,
            generation: token.generation,
            query: token.query.clone(),
            cursor: Some(&token.cursor),
            limit: token.limit,
            page: token.page,
            format: format.unwrap_or(token.format),
            expires: token.expires,
            progress: token.progress,
        })
        .await
    }

    /// Matching rows in the active generation. A missing or blank query counts
    /// every row.
    pub async fn count(&self, name: &str, raw: Option<&str>) -> Result<u64> {
        let table = self.registry.get(name)?;
        let query = optional_query(table, raw)?;
        let info = self.active(name, table).await?;
        self.store.count(name, info.id, &query).await
    }

    /// Record bytes a query would read, without reading them. A missing or
    /// blank query measures every row.
    pub async fn byte_total(&self, name: &str, raw: Option<&str>) -> Result<u64> {
        let table = self.registry.get(name)?;
        let query = optional_query(table, raw)?;
        let info = self.active(name, table).await?;
        self.store.byte_total(name, info.id, &query).await
    }

    /// Distinct keys of a value index.
    pub async fn keys(&self, name: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let table = self.registry.get(name)?;
        let info = self.active(name, table).await?;
        let mut keys = self.store.list_keys(name, info.id).await?;
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    /// Distinct keys of a value index starting with `prefix`.
    pub async fn match_keys(
        &self,
        name: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let table = self.registry.get(name)?;
        let info = self.active(name, table).await?;
        self.store
            .match_keys(name, info.id, prefix, self.limit(limit))
            .await
    }

    async fn first_page(
        &self,
        name: &str,
        table: &TableDef,
        query: QuerySpec,
        limit: Option<usize>,
        format: Format,
    ) -> Result<PlannedPage> {
        // Read before resolving the generation, so the session can never
        // outlive that generation's retention.
        let expires = self.codec.expiry_from(epoch_millis());
        let info = self.active(name, table).await?;
        let bytes_total = self.store.byte_total(name, info.id, &query).await?;

        self.page(PageRequest {
            index: name,
            generation: info.id,
            query,
            cursor: None,
            limit: self.limit(limit),
            page: 1,
            format,
            expires,
            progress: Progress {
                bytes_read: 0,
                bytes_total,
            },
        })
        .await
    }

    async fn active(&self, name: &str, table: &TableDef) -> Result<GenerationInfo> {
        let info = self.store.active_generation(name).await?;
        check_schema(name, table, &info)?;
        Ok(info)
    }

    async fn page(&self, request: PageRequest<'_>) -> Result<PlannedPage> {
        let PageRequest {
            index,
            generation,
            query,
            cursor,
            limit,
            page,
            format,
            expires,
            progress,
        } = request;

        let Page { rows, next } = match &query {
            QuerySpec::Locus {
                chromosome,
                start,
                end,
            } => {
                self.store
                    .range_query(index, generation, chromosome, *start, *end, cursor, limit)
                    .await?
            }
            QuerySpec::Value { value } => {
                self.store
                    .value_query(index, generation, value, cursor, limit)
                    .await?
            }
            QuerySpec::All => self.store.scan(index, generation, cursor, limit).await?,
        };

        let page_bytes: u64 = rows.iter().map(|r| u64::from(r.byte_length)).sum();
        let progress = Progress {
            bytes_read: progress.bytes_read + page_bytes,
            ..progress
        };

        let continuation = match next {
            Some(cursor) => Some(self.codec.encode(&ContinuationToken {
                version: TOKEN_VERSION,
                index: index.to_string(),
                generation,
                query: query.clone(),
                cursor,
                limit,
                page: page + 1,
                format,
                expires,
                progress,
            })?),
            None => None,
        };

        Ok(PlannedPage {
            index: index.to_string(),
            query,
            rows,
            limit,
            page,
            format,
            progress,
            continuation,
        })
    }
}

fn optional_query(table: &TableDef, raw: Option<&str>) -> Result<QuerySpec> {
    match raw.map(str::trim) {
        Some(q) if !q.is_empty() => QuerySpec::parse(&table.schema, q),
        _ => Ok(QuerySpec::All),
    }
}

fn check_schema(name: &str, table: &TableDef, info: &GenerationInfo) -> Result<()> {
    let configured = table.schema.to_string();
    if info.schema == configured {
        Ok(())
    } else {
        Err(Error::SchemaMismatch(format!(
            "{name} generation {} was built with schema `{}` but is configured as `{}`; rebuild it",
            info.id, info.schema, configured
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TablesFile;
    use crate::index::SqliteIndexStore;
    use crate::schema::RowKey;
    use std::time::Duration;

    const TABLES: &str = r#"{"tables": {
        "genes": {"path": "genes/", "schema": "chromosome:start-end"},
        "phenotypes": {"path": "phenotypes/", "schema": "phenotype"},
        "unbuilt": {"path": "unbuilt/", "schema": "phenotype"}
    }}"#;

    fn gene(start: i64, end: i64, offset: u64) -> IndexRow {
        IndexRow {
            key: RowKey::Locus {
                chromosome: "8".to_string(),
                start,
                end,
            },
            source_key: "genes/part-00000.json".to_string(),
            byte_offset: offset,
            byte_length: 10,
        }
    }

    fn phenotype(value: &str, offset: u64) -> IndexRow {
        IndexRow {
            key: RowKey::Value(value.to_string()),
            source_key: "phenotypes/part-00000.json".to_string(),
            byte_offset: offset,
            byte_length: 10,
        }
    }

    async fn commit(
        store: &SqliteIndexStore,
        name: &str,
        schema: &str,
        rows: Vec<IndexRow>,
    ) -> GenerationId {
        let generation = store.create_generation(name, schema).await.unwrap();
        store.insert_batch(name, generation, rows).await.unwrap();
        store.commit_generation(name, generation).await.unwrap();
        generation
    }

    async fn fixture() -> (Arc<SqliteIndexStore>, Planner) {
        let store = Arc::new(SqliteIndexStore::open_in_memory().unwrap());
        let genes = (0..5).map(|i| gene(100 + i, 200 + i, i as u64 * 10)).collect();
        commit(&store, "genes", "chromosome:start-end", genes).await;
        commit(
            &store,
            "phenotypes",
            "phenotype",
            vec![phenotype("T2D", 0), phenotype("BMI", 10), phenotype("T1D", 20)],
        )
        .await;

        let registry = Registry::from_file(&TablesFile::parse(TABLES).unwrap()).unwrap();
        let planner = Planner::new(
            Arc::new(registry),
            store.clone(),
            TokenCodec::new(b"secret".to_vec(), Duration::from_secs(60)),
            2,
            3,
        );
        (store, planner)
    }

    async fn collect(planner: &Planner, first: PlannedPage) -> Vec<PlannedPage> {
        let mut pages = vec![first];
        while let Some(token) = pages.last().and_then(|p| p.continuation.clone()) {
            pages.push(planner.resume(&token, None).await.unwrap());
        }
        pages
    }

    #[tokio::test]
    async fn test_plan_paginates_through_continuations() {
        let (_store, planner) = fixture().await;
        let first = planner
            .plan("genes", "chr8:150-210", None, Format::Row)
            .await
            .unwrap();
        assert_eq!(first.limit, 2);
        assert_eq!(first.page, 1);

        let pages = collect(&planner, first).await;
        assert_eq!(
            pages.iter().map(|p| p.page).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let offsets: Vec<u64> = pages
            .iter()
            .flat_map(|p| p.rows.iter().map(|r| r.byte_offset))
            .collect();
        assert_eq!(offsets, vec![0, 10, 20, 30, 40]);
        assert_eq!(
            pages.iter().map(|p| p.progress.bytes_read).collect::<Vec<_>>(),
            vec![20, 40, 50]
        );
        assert!(pages.iter().all(|p| p.progress.bytes_total == 50));
        assert_eq!(
            planner.count("genes", Some("chr8:150-210")).await.unwrap(),
            5
        );
        assert_eq!(
            planner.byte_total("genes", Some("chr8:150-210")).await.unwrap(),
            50
        );
        assert_eq!(planner.byte_total("genes", None).await.unwrap(), 50);
        assert_eq!(planner.byte_total("phenotypes", Some("T2D")).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let (_store, planner) = fixture().await;
        let page = planner
            .plan("genes", "8:1-1000", Some(100), Format::Row)
            .await
            .unwrap();
        assert_eq!(page.limit, 3);
        assert_eq!(page.rows.len(), 3);
        assert_eq!(planner.limit(Some(0)), 1);
    }

    #[tokio::test]
    async fn test_resume_stays_on_pinned_generation() {
        let (store, planner) = fixture().await;
        let first = planner
            .plan("genes", "8:1-1000", None, Format::Column)
            .await
            .unwrap();
        let token = first.continuation.clone().unwrap();

        commit(&store, "genes", "chromosome:start-end", vec![gene(1, 2, 999)]).await;

        let second = planner.resume(&token, None).await.unwrap();
        assert_eq!(second.format, Format::Column);
        assert_eq!(
            second.rows.iter().map(|r| r.byte_offset).collect::<Vec<_>>(),
            vec![20, 30]
        );

        let fresh = planner
            .plan("genes", "8:1-1000", None, Format::Row)
            .await
            .unwrap();
        assert_eq!(fresh.rows.len(), 1);
        assert!(fresh.continuation.is_none());
    }

    #[tokio::test]
    async fn test_resume_after_reclaim_is_generation_not_found() {
        let (store, planner) = fixture().await;
        let token = planner
            .plan("genes", "8:1-1000", None, Format::Row)
            .await
            .unwrap()
            .continuation
            .unwrap();

        commit(&store, "genes", "chromosome:start-end", vec![gene(1, 2, 0)]).await;
        store.reclaim("genes", Duration::ZERO).await.unwrap();

        assert!(matches!(
            planner.resume(&token, None).await.unwrap_err(),
            Error::GenerationNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_format_override_on_resume() {
        let (_store, planner) = fixture().await;
        let token = planner
            .all("genes", None, Format::Row)
            .await
            .unwrap()
            .continuation
            .unwrap();
        let next = planner.resume(&token, Some(Format::Column)).await.unwrap();
        assert_eq!(next.format, Format::Column);
        assert_eq!(next.query, QuerySpec::All);
    }

    #[tokio::test]
    async fn test_value_queries_and_keys() {
        let (_store, planner) = fixture().await;
        let page = planner
            .plan("phenotypes", "T2D", None, Format::Row)
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(page.continuation.is_none());

        assert_eq!(
            planner.keys("phenotypes", None).await.unwrap(),
            vec!["BMI", "T1D", "T2D"]
        );
        assert_eq!(planner.keys("phenotypes", Some(1)).await.unwrap(), vec!["BMI"]);
        assert_eq!(
            planner.match_keys("phenotypes", "T", None).await.unwrap(),
            vec!["T1D", "T2D"]
        );
        assert_eq!(planner.count("phenotypes", None).await.unwrap(), 3);
        assert_eq!(planner.count("phenotypes", Some(" ")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_errors() {
        let (_store, planner) = fixture().await;
        assert!(matches!(
            planner.plan("nope", "1:1", None, Format::Row).await.unwrap_err(),
            Error::IndexNotFound(_)
        ));
        assert!(matches!(
            planner.plan("unbuilt", "x", None, Format::Row).await.unwrap_err(),
            Error::IndexNotFound(_)
        ));
        assert!(matches!(
            planner.plan("genes", "8:10-5", None, Format::Row).await.unwrap_err(),
            Error::InvalidQuerySyntax(_)
        ));
        assert!(matches!(
            planner.keys("genes", None).await.unwrap_err(),
            Error::SchemaMismatch(_)
        ));
        assert!(matches!(
            planner.resume("garbage", None).await.unwrap_err(),
            Error::MalformedToken(_)
        ));
    }

    #[tokio::test]
    async fn test_schema_change_requires_rebuild() {
        let (store, _planner) = fixture().await;
        let registry = Registry::from_file(
            &TablesFile::parse(
                r#"{"tables": {"genes": {"path": "genes/", "schema": "chromosome:start"}}}"#,
            )
            .unwrap(),
        )
        .unwrap();
        let planner = Planner::new(
            Arc::new(registry),
            store,
            TokenCodec::new(b"secret".to_vec(), Duration::from_secs(60)),
            2,
            3,
        );
        assert!(matches!(
            planner.plan("genes", "8:100", None, Format::Row).await.unwrap_err(),
            Error::SchemaMismatch(_)
        ));
    }
}
