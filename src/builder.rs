//! Index builds.
//!
//! A build reads every object under a table's prefix, extracts one index row
//! per JSON line, and writes the rows into a fresh generation that is swapped
//! live only once complete. Readers run concurrently; a single writer owns the
//! index store.

use crate::config::TableDef;
use crate::index::{GenerationId, IndexRow, IndexStore};
use crate::profile::millis;
use crate::schema::SchemaDescriptor;
use crate::storage::{ObjectInfo, ObjectStore, RetryPolicy, read_error};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Rows per `insert_batch` call.
    pub batch_size: usize,
    /// Objects read concurrently.
    pub workers: usize,
    /// How long retired generations stay queryable.
    pub retention: Duration,
    /// Backoff for resuming an object whose stream failed mid-read.
    pub retry: RetryPolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            workers: 4,
            retention: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub index: String,
    pub generation: GenerationId,
    pub objects: usize,
    pub rows: u64,
    /// Lines that could not be indexed.
    pub skipped: u64,
    /// Retired generations dropped after the swap.
    pub reclaimed: Vec<GenerationId>,
    pub elapsed_ms: f64,
}

/// Names currently being built in this process.
#[derive(Default)]
pub struct BuildLocks {
    building: Mutex<HashSet<String>>,
}

impl BuildLocks {
    pub fn acquire(self: &Arc<Self>, name: &str) -> Result<BuildGuard> {
        if !self.building.lock().insert(name.to_string()) {
            return Err(Error::BuildInProgress(name.to_string()));
        }
        Ok(BuildGuard {
            locks: Arc::clone(self),
            name: name.to_string(),
        })
    }
}

/// Releases the build lock on drop.
pub struct BuildGuard {
    locks: Arc<BuildLocks>,
    name: String,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.locks.building.lock().remove(&self.name);
    }
}

pub struct TableBuilder {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn IndexStore>,
    locks: Arc<BuildLocks>,
    options: BuildOptions,
}

impl TableBuilder {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn IndexStore>,
        options: BuildOptions,
    ) -> Self {
        Self {
            objects,
            store,
            locks: Arc::new(BuildLocks::default()),
            options,
        }
    }

    /// Build a new generation of `name` and make it active.
    pub async fn build(&self, name: &str, table: &TableDef) -> Result<BuildReport> {
        let started = Instant::now();
        let _guard = self.locks.acquire(name)?;

        let discarded = self.store.discard_incomplete(name).await?;
        if !discarded.is_empty() {
            warn!(
                "discarded {} incomplete generation(s) of {}: {:?}",
                discarded.len(),
                name,
                discarded
            );
        }

        let objects = self.objects.list(&table.prefix).await?;
        info!(
            "building index {} from {} object(s) under {}",
            name,
            objects.len(),
            table.prefix
        );

        let generation = self
            .store
            .create_generation(name, &table.schema.to_string())
            .await?;

        let (rows, skipped) = match self.load(name, generation, &table.schema, &objects).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("build of {} failed, dropping generation {}: {}", name, generation, e);
                if let Err(abort) = self.store.abort_generation(name, generation).await {
                    warn!("failed to drop generation {} of {}: {}", generation, name, abort);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.commit_generation(name, generation).await {
            warn!("commit of {} failed, dropping generation {}: {}", name, generation, e);
            if let Err(abort) = self.store.abort_generation(name, generation).await {
                warn!("failed to drop generation {} of {}: {}", generation, name, abort);
            }
            return Err(e);
        }

        // The new generation is live; reclaim is retried by the next build.
        let reclaimed = match self.store.reclaim(name, self.options.retention).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                warn!("failed to reclaim retired generations of {}: {}", name, e);
                Vec::new()
            }
        };

        let report = BuildReport {
            index: name.to_string(),
            generation,
            objects: objects.len(),
            rows,
            skipped,
            reclaimed,
            elapsed_ms: millis(started.elapsed()),
        };
        info!(
            "built index {} generation {}: {} rows, {} skipped, {:.0} ms",
            name, generation, report.rows, report.skipped, report.elapsed_ms
        );
        Ok(report)
    }

    /// Stream every object into `generation`. Returns `(rows, skipped)`.
    async fn load(
        &self,
        name: &str,
        generation: GenerationId,
        schema: &SchemaDescriptor,
        objects: &[ObjectInfo],
    ) -> Result<(u64, u64)> {
        let workers = self.options.workers.max(1);
        let batch_size = self.options.batch_size.max(1);
        let (tx, mut rx) = mpsc::channel::<Vec<IndexRow>>(workers * 2);
        let semaphore = Arc::new(Semaphore::new(workers));
        let schema = Arc::new(schema.clone());
        let mut readers = JoinSet::new();

        for object in objects {
            let reader = ObjectReaderTask {
                objects: Arc::clone(&self.objects),
                key: object.key.clone(),
                schema: Arc::clone(&schema),
                tx: tx.clone(),
                batch_size,
                retry: self.options.retry,
            };
            let semaphore = Arc::clone(&semaphore);
            readers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("build semaphore closed: {e}")))?;
                reader.run().await
            });
        }
        drop(tx);

        let mut rows = 0u64;
        let mut skipped = 0u64;

        // Returning early drops `readers`, which aborts them.
        loop {
            tokio::select! {
                Some(batch) = rx.recv() => {
                    rows += batch.len() as u64;
                    self.store.insert_batch(name, generation, batch).await?;
                }
                Some(joined) = readers.join_next() => {
                    skipped += joined
                        .map_err(|e| Error::Internal(format!("build reader failed: {e}")))??;
                }
                else => break,
            }
        }

        Ok((rows, skipped))
    }
}

struct ObjectReaderTask {
    objects: Arc<dyn ObjectStore>,
    key: String,
    schema: Arc<SchemaDescriptor>,
    tx: mpsc::Sender<Vec<IndexRow>>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl ObjectReaderTask {
    /// Read one object line by line. Returns the number of skipped lines.
    ///
    /// A transient stream failure reopens the object at the start of the
    /// line being read, backing off per the retry policy.
    async fn run(self) -> Result<u64> {
        let mut reader = self.objects.open(&self.key).await?;
        let mut line = Vec::new();
        let mut offset = 0u64;
        let mut skipped = 0u64;
        let mut failures = 0u32;
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            line.clear();
            let read = match reader.read_until(b'\n', &mut line).await {
                Ok(read) => {
                    failures = 0;
                    read
                }
                Err(e) => {
                    let err = read_error(&self.key, offset, e);
                    if !err.is_transient() || failures + 1 >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.backoff(failures);
                    warn!("{}, resuming in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                    failures += 1;
                    reader = self.objects.open_at(&self.key, offset).await?;
                    continue;
                }
            };
            if read == 0 {
                break;
            }
            let line_offset = offset;
            offset += read as u64;

            let content = strip_line_end(&line);
            if content.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let length = match u32::try_from(content.len()) {
                Ok(length) => length,
                Err(_) => {
                    skipped += 1;
                    debug!("skipping {}@{}: line too long", self.key, line_offset);
                    continue;
                }
            };

            match self.schema.extract_line(content) {
                Ok(key) => batch.push(IndexRow {
                    key,
                    source_key: self.key.clone(),
                    byte_offset: line_offset,
                    byte_length: length,
                }),
                Err(e) => {
                    skipped += 1;
                    debug!("skipping {}@{}: {}", self.key, line_offset, e);
                }
            }

            if batch.len() >= self.batch_size {
                self.send(std::mem::take(&mut batch)).await?;
            }
        }

        if !batch.is_empty() {
            self.send(batch).await?;
        }
        Ok(skipped)
    }

    async fn send(&self, batch: Vec<IndexRow>) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| Error::Internal("index writer stopped".to_string()))
    }
}

/// A line without its `\n` or `\r\n` terminator.
fn strip_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
