//! The [`BioIndex`] facade used by the CLI and the REST handlers.

use crate::builder::{BuildOptions, BuildReport, TableBuilder};
use crate::config::{Config, Registry};
use crate::continuation::TokenCodec;
use crate::fetch::{Format, RecordData, RecordFetcher};
use crate::index::IndexStore;
use crate::planner::{PlannedPage, Planner};
use crate::profile::{Profile, timed};
use crate::query::QuerySpec;
use crate::storage::ObjectStore;
use crate::types::{CountResult, IndexInfo, KeysResult, QueryResult};
use crate::Result;
use std::future::Future;
use std::sync::Arc;

pub struct BioIndex {
    registry: Arc<Registry>,
    store: Arc<dyn IndexStore>,
    objects: Arc<dyn ObjectStore>,
    planner: Planner,
    fetcher: RecordFetcher,
    builder: TableBuilder,
}

impl BioIndex {
    pub fn new(
        config: &Config,
        registry: Registry,
        store: Arc<dyn IndexStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let secret = config
            .token_secret
            .as_ref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_else(TokenCodec::generate_secret);
        let codec = TokenCodec::new(secret, config.token_ttl());
        let registry = Arc::new(registry);

        let planner = Planner::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            codec,
            config.page_size,
            config.max_page_size,
        );
        let fetcher = RecordFetcher::new(Arc::clone(&objects), config.fetch_concurrency);
        let builder = TableBuilder::new(
            Arc::clone(&objects),
            Arc::clone(&store),
            BuildOptions {
                batch_size: config.batch_size,
                workers: config.build_workers,
                retention: config.token_ttl(),
                retry: config.retry_policy(),
            },
        );

        Self {
            registry,
            store,
            objects,
            planner,
            fetcher,
            builder,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn query(
        &self,
        name: &str,
        q: &str,
        limit: Option<usize>,
        format: Format,
    ) -> Result<QueryResult> {
        self.run_page(self.planner.plan(name, q, limit, format))
            .await
    }

    pub async fn all(&self, name: &str, limit: Option<usize>, format: Format) -> Result<QueryResult> {
        self.run_page(self.planner.all(name, limit, format)).await
    }

    /// Next page of an earlier query.
    pub async fn resume(&self, token: &str, format: Option<Format>) -> Result<QueryResult> {
        self.run_page(self.planner.resume(token, format)).await
    }

    pub async fn count(&self, name: &str, q: Option<&str>) -> Result<CountResult> {
        let mut profile = Profile::default();
        let (count, elapsed) = timed(self.planner.count(name, q)).await;
        profile.record_query(elapsed);

        Ok(CountResult {
            count: count.map_err(|e| e.with_profile(profile))?,
            index: name.to_string(),
            profile,
            q: q.map(str::to_string),
        })
    }

    /// Bytes the records matching `q` occupy in object storage.
    pub async fn byte_total(&self, name: &str, q: Option<&str>) -> Result<u64> {
        self.planner.byte_total(name, q).await
    }

    pub async fn keys(&self, name: &str, limit: Option<usize>) -> Result<KeysResult> {
        let mut profile = Profile::default();
        let (keys, elapsed) = timed(self.planner.keys(name, limit)).await;
        profile.record_query(elapsed);
        let keys = keys.map_err(|e| e.with_profile(profile))?;

        Ok(KeysResult {
            count: keys.len(),
            data: keys,
            index: name.to_string(),
            limit,
            profile,
            q: None,
        })
    }

    pub async fn match_keys(
        &self,
        name: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<KeysResult> {
        let mut profile = Profile::default();
        let (keys, elapsed) = timed(self.planner.match_keys(name, prefix, limit)).await;
        profile.record_query(elapsed);
        let keys = keys.map_err(|e| e.with_profile(profile))?;

        Ok(KeysResult {
            count: keys.len(),
            data: keys,
            index: name.to_string(),
            limit: Some(self.planner.limit(limit)),
            profile,
            q: Some(prefix.to_string()),
        })
    }

    /// Rebuild one index.
    pub async fn build(&self, name: &str) -> Result<BuildReport> {
        let table = self.registry.get(name)?;
        self.builder.build(name, table).await
    }

    /// Rebuild every configured index, one at a time.
    pub async fn build_all(&self) -> Result<Vec<BuildReport>> {
        let mut reports = Vec::with_capacity(self.registry.len());
        for (name, table) in self.registry.iter() {
            reports.push(self.builder.build(name, table).await?);
        }
        Ok(reports)
    }

    /// Configured indexes with the state of their active generation.
    pub async fn indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut indexes = Vec::with_capacity(self.registry.len());
        for (name, table) in self.registry.iter() {
            let active = self.store.describe(name).await?;
            indexes.push(IndexInfo {
                index: name.to_string(),
                prefix: table.prefix.clone(),
                schema: table.schema.to_string(),
                built: active.is_some(),
                generation: active.as_ref().map(|g| g.id),
                rows: active.as_ref().map(|g| g.row_count),
                built_at: active.and_then(|g| g.committed_at),
            });
        }
        Ok(indexes)
    }

    /// Check that every prefix is listable and the index store answers.
    /// Returns the number of data objects per index.
    pub async fn check(&self) -> Result<Vec<(String, usize)>> {
        let mut found = Vec::with_capacity(self.registry.len());
        for (name, table) in self.registry.iter() {
            self.store.describe(name).await?;
            let objects = self.objects.list(&table.prefix).await?;
            found.push((name.to_string(), objects.len()));
        }
        Ok(found)
    }

    async fn run_page<F>(&self, plan: F) -> Result<QueryResult>
    where
        F: Future<Output = Result<PlannedPage>>,
    {
        let mut profile = Profile::default();

        let (planned, elapsed) = timed(plan).await;
        profile.record_query(elapsed);
        let planned = planned.map_err(|e| e.with_profile(profile))?;

        let (records, elapsed) = timed(self.fetcher.fetch(&planned.rows)).await;
        profile.record_fetch(elapsed);
        let records = records.map_err(|e| e.with_profile(profile))?;

        let data = RecordData::shape(records, planned.format);
        Ok(QueryResult {
            continuation: planned.continuation,
            count: planned.rows.len(),
            data,
            q: match &planned.query {
                QuerySpec::All => None,
                query => Some(query.to_string()),
            },
            index: planned.index,
            limit: planned.limit,
            page: planned.page,
            profile,
            progress: planned.progress,
        })
    }
}
