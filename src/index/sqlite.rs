//! SQLite implementation of [`IndexStore`].
//!
//! Each generation's rows live in their own table, `rows_<id>`. The
//! `generations` table records state and statistics, and `active_generations`
//! holds the active pointer per indexed name. Commit builds the ordering
//! index and flips the pointer inside one transaction.
//!
//! The connection is shared behind a mutex; every call runs on the blocking
//! thread pool.

use super::{
    Cursor, GenerationId, GenerationInfo, GenerationState, IndexRow, IndexStore, Page,
};
use crate::profile::epoch_millis;
use crate::query::QuerySpec;
use crate::schema::{RowKey, SchemaDescriptor};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    schema TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    committed_at INTEGER,
    retired_at INTEGER,
    row_count INTEGER NOT NULL DEFAULT 0,
    max_span INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS generations_by_name ON generations (name, state);
CREATE TABLE IF NOT EXISTS active_generations (
    name TEXT PRIMARY KEY,
    generation INTEGER NOT NULL REFERENCES generations (id)
);
";

const PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

const LOCUS_COLUMNS: &str = "chrom, pos_start, pos_end, source_key, byte_offset, byte_length";
const VALUE_COLUMNS: &str = "value, source_key, byte_offset, byte_length";

pub struct SqliteIndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIndexStore {
    /// Open (or create) an index database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("index store task failed: {e}")))?
    }
}

fn rows_table(generation: GenerationId) -> String {
    format!("rows_{generation}")
}

fn write_err(e: rusqlite::Error) -> Error {
    Error::StoreWriteFailure(e.to_string())
}

fn to_sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::StoreWriteFailure(format!("{what} {value} too large")))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX)
}

fn get_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_u32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn locus_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexRow> {
    Ok(IndexRow {
        key: RowKey::Locus {
            chromosome: row.get(0)?,
            start: row.get(1)?,
            end: row.get(2)?,
        },
        source_key: row.get(3)?,
        byte_offset: get_u64(row, 4)?,
        byte_length: get_u32(row, 5)?,
    })
}

fn value_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexRow> {
    Ok(IndexRow {
        key: RowKey::Value(row.get(0)?),
        source_key: row.get(1)?,
        byte_offset: get_u64(row, 2)?,
        byte_length: get_u32(row, 3)?,
    })
}

fn generation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(GenerationInfo, String)> {
    let state: String = row.get(3)?;
    let committed_at: Option<i64> = row.get(6)?;
    Ok((
        GenerationInfo {
            id: row.get(0)?,
            name: row.get(1)?,
            schema: row.get(2)?,
            state: GenerationState::Building,
            row_count: get_u64(row, 4)?,
            max_span: row.get(5)?,
            committed_at: committed_at.and_then(|t| u64::try_from(t).ok()),
        },
        state,
    ))
}

const GENERATION_COLUMNS: &str =
    "id, name, schema, state, row_count, max_span, committed_at";

/// Load a generation of `name` in any state.
fn load_generation(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
) -> Result<GenerationInfo> {
    let found = conn
        .query_row(
            &format!("SELECT {GENERATION_COLUMNS} FROM generations WHERE id = ?1 AND name = ?2"),
            params![generation, name],
            generation_from_row,
        )
        .optional()?;

    let (mut info, state) = found.ok_or(Error::GenerationNotFound(generation))?;
    info.state = GenerationState::parse(&state)
        .ok_or_else(|| Error::Store(format!("generation {generation} has unknown state {state}")))?;
    Ok(info)
}

/// Load a generation that queries may read.
fn load_committed(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
) -> Result<(GenerationInfo, SchemaDescriptor)> {
    let info = load_generation(conn, name, generation)?;
    if info.state == GenerationState::Building {
        return Err(Error::GenerationNotFound(generation));
    }
    let schema = SchemaDescriptor::parse(&info.schema)?;
    Ok((info, schema))
}

fn load_active(conn: &Connection, name: &str) -> Result<Option<GenerationInfo>> {
    let generation: Option<GenerationId> = conn
        .query_row(
            "SELECT generation FROM active_generations WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    generation
        .map(|id| load_generation(conn, name, id))
        .transpose()
}

fn drop_generation(conn: &Connection, generation: GenerationId) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", rows_table(generation)))?;
    conn.execute("DELETE FROM generations WHERE id = ?1", params![generation])?;
    Ok(())
}

fn require_locus(schema: &SchemaDescriptor, name: &str, what: &str) -> Result<()> {
    if schema.is_locus() {
        Ok(())
    } else {
        Err(Error::SchemaMismatch(format!(
            "{what} requires a locus index; {name} is indexed by `{schema}`"
        )))
    }
}

fn require_value(schema: &SchemaDescriptor, name: &str, what: &str) -> Result<()> {
    if schema.is_locus() {
        Err(Error::SchemaMismatch(format!(
            "{what} requires a value index; {name} is indexed by `{schema}`"
        )))
    } else {
        Ok(())
    }
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: &[(&str, &dyn ToSql)],
    map: fn(&rusqlite::Row<'_>) -> rusqlite::Result<IndexRow>,
) -> Result<Vec<IndexRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn cursor_mismatch() -> Error {
    Error::MalformedToken("cursor does not match the query".to_string())
}

#[allow(clippy::too_many_arguments)]
fn range_query_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    chromosome: &str,
    start: i64,
    end: i64,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Result<Page> {
    let (info, schema) = load_committed(conn, name, generation)?;
    require_locus(&schema, name, "a range query")?;

    // No row starting before `start - max_span` can reach `start`.
    let floor = start.saturating_sub(info.max_span);
    let limit_param = sql_limit(limit);

    let mut sql = format!(
        "SELECT {LOCUS_COLUMNS} FROM {} \
         WHERE chrom = :chrom AND pos_start <= :end AND pos_start >= :floor AND pos_end >= :start",
        rows_table(generation)
    );
    let cursor_offset;
    let mut params: Vec<(&str, &dyn ToSql)> = vec![
        (":chrom", &chromosome),
        (":end", &end),
        (":floor", &floor),
        (":start", &start),
        (":limit", &limit_param),
    ];

    if let Some(cursor) = cursor {
        let Cursor::Locus {
            chromosome: c_chrom,
            start: c_start,
            end: c_end,
            source_key: c_key,
            byte_offset: c_offset,
        } = cursor
        else {
            return Err(cursor_mismatch());
        };
        if c_chrom != chromosome {
            return Err(cursor_mismatch());
        }
        cursor_offset = to_sql_int(*c_offset, "cursor offset")?;
        sql.push_str(
            " AND (pos_start, pos_end, source_key, byte_offset) > (:c_start, :c_end, :c_key, :c_offset)",
        );
        params.push((":c_start", c_start));
        params.push((":c_end", c_end));
        params.push((":c_key", c_key));
        params.push((":c_offset", &cursor_offset));
    }
    sql.push_str(" ORDER BY pos_start, pos_end, source_key, byte_offset LIMIT :limit");

    let rows = query_rows(conn, &sql, &params, locus_row)?;
    Ok(Page::from_overfetch(rows, limit))
}

fn value_query_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    value: &str,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Result<Page> {
    let (_, schema) = load_committed(conn, name, generation)?;
    require_value(&schema, name, "a value query")?;

    let limit_param = sql_limit(limit);
    let mut sql = format!(
        "SELECT {VALUE_COLUMNS} FROM {} WHERE value = :value",
        rows_table(generation)
    );
    let cursor_offset;
    let mut params: Vec<(&str, &dyn ToSql)> = vec![(":value", &value), (":limit", &limit_param)];

    if let Some(cursor) = cursor {
        let Cursor::Value {
            value: c_value,
            source_key: c_key,
            byte_offset: c_offset,
        } = cursor
        else {
            return Err(cursor_mismatch());
        };
        if c_value != value {
            return Err(cursor_mismatch());
        }
        cursor_offset = to_sql_int(*c_offset, "cursor offset")?;
        sql.push_str(" AND (source_key, byte_offset) > (:c_key, :c_offset)");
        params.push((":c_key", c_key));
        params.push((":c_offset", &cursor_offset));
    }
    sql.push_str(" ORDER BY source_key, byte_offset LIMIT :limit");

    let rows = query_rows(conn, &sql, &params, value_row)?;
    Ok(Page::from_overfetch(rows, limit))
}

fn scan_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Result<Page> {
    let (_, schema) = load_committed(conn, name, generation)?;
    let table = rows_table(generation);
    let limit_param = sql_limit(limit);
    let cursor_offset;
    let mut params: Vec<(&str, &dyn ToSql)> = vec![(":limit", &limit_param)];

    let rows = if schema.is_locus() {
        let mut sql = format!("SELECT {LOCUS_COLUMNS} FROM {table}");
        if let Some(cursor) = cursor {
            let Cursor::Locus {
                chromosome,
                start,
                end,
                source_key,
                byte_offset,
            } = cursor
            else {
                return Err(cursor_mismatch());
            };
            cursor_offset = to_sql_int(*byte_offset, "cursor offset")?;
            sql.push_str(
                " WHERE (chrom, pos_start, pos_end, source_key, byte_offset) \
                 > (:c_chrom, :c_start, :c_end, :c_key, :c_offset)",
            );
            params.push((":c_chrom", chromosome));
            params.push((":c_start", start));
            params.push((":c_end", end));
            params.push((":c_key", source_key));
            params.push((":c_offset", &cursor_offset));
        }
        sql.push_str(" ORDER BY chrom, pos_start, pos_end, source_key, byte_offset LIMIT :limit");
        query_rows(conn, &sql, &params, locus_row)?
    } else {
        let mut sql = format!("SELECT {VALUE_COLUMNS} FROM {table}");
        if let Some(cursor) = cursor {
            let Cursor::Value {
                value,
                source_key,
                byte_offset,
            } = cursor
            else {
                return Err(cursor_mismatch());
            };
            cursor_offset = to_sql_int(*byte_offset, "cursor offset")?;
            sql.push_str(
                " WHERE (value, source_key, byte_offset) > (:c_value, :c_key, :c_offset)",
            );
            params.push((":c_value", value));
            params.push((":c_key", source_key));
            params.push((":c_offset", &cursor_offset));
        }
        sql.push_str(" ORDER BY value, source_key, byte_offset LIMIT :limit");
        query_rows(conn, &sql, &params, value_row)?
    };

    Ok(Page::from_overfetch(rows, limit))
}

fn count_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    query: &QuerySpec,
) -> Result<u64> {
    if let QuerySpec::All = query {
        let (info, _) = load_committed(conn, name, generation)?;
        return Ok(info.row_count);
    }
    aggregate_sync(conn, name, generation, query, "COUNT(*)")
}

fn byte_total_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    query: &QuerySpec,
) -> Result<u64> {
    aggregate_sync(conn, name, generation, query, "COALESCE(SUM(byte_length), 0)")
}

/// Evaluate the aggregate `select` over the rows matching `query`.
fn aggregate_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    query: &QuerySpec,
    select: &str,
) -> Result<u64> {
    let (info, schema) = load_committed(conn, name, generation)?;
    let table = rows_table(generation);

    let total: i64 = match query {
        QuerySpec::All => {
            conn.query_row(&format!("SELECT {select} FROM {table}"), [], |row| row.get(0))?
        }
        QuerySpec::Locus {
            chromosome,
            start,
            end,
        } => {
            require_locus(&schema, name, "a locus query")?;
            let floor = start.saturating_sub(info.max_span);
            conn.query_row(
                &format!(
                    "SELECT {select} FROM {table} WHERE chrom = ?1 AND pos_start <= ?2 \
                     AND pos_start >= ?3 AND pos_end >= ?4"
                ),
                params![chromosome, end, floor, start],
                |row| row.get(0),
            )?
        }
        QuerySpec::Value { value } => {
            require_value(&schema, name, "a value query")?;
            conn.query_row(
                &format!("SELECT {select} FROM {table} WHERE value = ?1"),
                params![value],
                |row| row.get(0),
            )?
        }
    };

    Ok(u64::try_from(total).unwrap_or(0))
}

fn insert_batch_sync(
    conn: &mut Connection,
    name: &str,
    generation: GenerationId,
    rows: &[IndexRow],
) -> Result<()> {
    let info = load_generation(conn, name, generation)?;
    if info.state != GenerationState::Building {
        return Err(Error::StoreWriteFailure(format!(
            "generation {generation} of {name} is already committed"
        )));
    }
    let locus = SchemaDescriptor::parse(&info.schema)?.is_locus();

    let tx = conn.transaction().map_err(write_err)?;
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO {} (chrom, pos_start, pos_end, value, source_key, byte_offset, byte_length) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rows_table(generation)
            ))
            .map_err(write_err)?;

        for row in rows {
            let offset = to_sql_int(row.byte_offset, "byte offset")?;
            let length = i64::from(row.byte_length);
            match &row.key {
                RowKey::Locus {
                    chromosome,
                    start,
                    end,
                } if locus => stmt.execute(params![
                    chromosome,
                    start,
                    end,
                    None::<String>,
                    row.source_key,
                    offset,
                    length
                ]),
                RowKey::Value(value) if !locus => stmt.execute(params![
                    None::<String>,
                    None::<i64>,
                    None::<i64>,
                    value,
                    row.source_key,
                    offset,
                    length
                ]),
                _ => {
                    return Err(Error::SchemaMismatch(format!(
                        "row key does not match schema `{}` of {name}",
                        info.schema
                    )));
                }
            }
            .map_err(write_err)?;
        }
    }
    tx.commit().map_err(write_err)
}

fn commit_sync(conn: &mut Connection, name: &str, generation: GenerationId) -> Result<()> {
    let info = load_generation(conn, name, generation)?;
    if info.state != GenerationState::Building {
        return Err(Error::StoreWriteFailure(format!(
            "generation {generation} of {name} is not building"
        )));
    }
    let schema = SchemaDescriptor::parse(&info.schema)?;
    let table = rows_table(generation);
    let now = i64::try_from(epoch_millis()).unwrap_or(i64::MAX);

    let tx = conn.transaction().map_err(write_err)?;

    let order = if schema.is_locus() {
        "chrom, pos_start, pos_end, source_key, byte_offset"
    } else {
        "value, source_key, byte_offset"
    };
    tx.execute_batch(&format!("CREATE INDEX {table}_order ON {table} ({order})"))
        .map_err(write_err)?;

    let (row_count, max_span): (i64, i64) = tx
        .query_row(
            &format!("SELECT COUNT(*), COALESCE(MAX(pos_end - pos_start), 0) FROM {table}"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(write_err)?;

    tx.execute(
        "UPDATE generations SET state = 'retired', retired_at = ?1 \
         WHERE name = ?2 AND state = 'active'",
        params![now, name],
    )
    .map_err(write_err)?;
    tx.execute(
        "UPDATE generations SET state = 'active', committed_at = ?1, row_count = ?2, max_span = ?3 \
         WHERE id = ?4",
        params![now, row_count, max_span, generation],
    )
    .map_err(write_err)?;
    tx.execute(
        "INSERT INTO active_generations (name, generation) VALUES (?1, ?2) \
         ON CONFLICT (name) DO UPDATE SET generation = excluded.generation",
        params![name, generation],
    )
    .map_err(write_err)?;

    tx.commit().map_err(write_err)
}

fn distinct_keys_sync(
    conn: &Connection,
    name: &str,
    generation: GenerationId,
    prefix: Option<&str>,
    limit: usize,
) -> Result<Vec<String>> {
    let (_, schema) = load_committed(conn, name, generation)?;
    require_value(&schema, name, "key listing")?;

    let table = rows_table(generation);
    let prefix = prefix.unwrap_or("");
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT value FROM {table} WHERE value >= ?1 ORDER BY value"
    ))?;
    let mut rows = stmt.query(params![prefix])?;

    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        if !key.starts_with(prefix) || keys.len() >= limit {
            break;
        }
        keys.push(key);
    }
    Ok(keys)
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn create_generation(&self, name: &str, schema: &str) -> Result<GenerationId> {
        let name = name.to_string();
        let schema = schema.to_string();
        self.call(move |conn| {
            let now = i64::try_from(epoch_millis()).unwrap_or(i64::MAX);
            let tx = conn.transaction().map_err(write_err)?;
            tx.execute(
                "INSERT INTO generations (name, schema, state, created_at) VALUES (?1, ?2, 'building', ?3)",
                params![name, schema, now],
            )
            .map_err(write_err)?;
            let generation = tx.last_insert_rowid();
            tx.execute_batch(&format!(
                "CREATE TABLE {} (\
                    chrom TEXT, pos_start INTEGER, pos_end INTEGER, value TEXT, \
                    source_key TEXT NOT NULL, byte_offset INTEGER NOT NULL, byte_length INTEGER NOT NULL)",
                rows_table(generation)
            ))
            .map_err(write_err)?;
            tx.commit().map_err(write_err)?;
            Ok(generation)
        })
        .await
    }

    async fn insert_batch(
        &self,
        name: &str,
        generation: GenerationId,
        rows: Vec<IndexRow>,
    ) -> Result<()> {
        let name = name.to_string();
        self.call(move |conn| insert_batch_sync(conn, &name, generation, &rows))
            .await
    }

    async fn commit_generation(&self, name: &str, generation: GenerationId) -> Result<()> {
        let name = name.to_string();
        self.call(move |conn| commit_sync(conn, &name, generation))
            .await
    }

    async fn abort_generation(&self, name: &str, generation: GenerationId) -> Result<()> {
        let name = name.to_string();
        self.call(move |conn| {
            let info = load_generation(conn, &name, generation)?;
            if info.state != GenerationState::Building {
                return Err(Error::StoreWriteFailure(format!(
                    "cannot abort committed generation {generation} of {name}"
                )));
            }
            drop_generation(conn, generation).map_err(write_err)
        })
        .await
    }

    async fn discard_incomplete(&self, name: &str) -> Result<Vec<GenerationId>> {
        let name = name.to_string();
        self.call(move |conn| {
            let ids = {
                let mut stmt = conn
                    .prepare("SELECT id FROM generations WHERE name = ?1 AND state = 'building'")?;
                let ids = stmt.query_map(params![name], |row| row.get(0))?;
                ids.collect::<rusqlite::Result<Vec<GenerationId>>>()?
            };
            for &id in &ids {
                drop_generation(conn, id).map_err(write_err)?;
            }
            Ok(ids)
        })
        .await
    }

    async fn active_generation(&self, name: &str) -> Result<GenerationInfo> {
        let name = name.to_string();
        self.call(move |conn| load_active(conn, &name)?.ok_or(Error::IndexNotFound(name)))
            .await
    }

    async fn generation(&self, name: &str, generation: GenerationId) -> Result<GenerationInfo> {
        let name = name.to_string();
        self.call(move |conn| load_committed(conn, &name, generation).map(|(info, _)| info))
            .await
    }

    async fn describe(&self, name: &str) -> Result<Option<GenerationInfo>> {
        let name = name.to_string();
        self.call(move |conn| load_active(conn, &name)).await
    }

    async fn range_query(
        &self,
        name: &str,
        generation: GenerationId,
        chromosome: &str,
        start: i64,
        end: i64,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page> {
        let name = name.to_string();
        let chromosome = chromosome.to_string();
        let cursor = cursor.cloned();
        self.call(move |conn| {
            range_query_sync(
                conn,
                &name,
                generation,
                &chromosome,
                start,
                end,
                cursor.as_ref(),
                limit,
            )
        })
        .await
    }

    async fn value_query(
        &self,
        name: &str,
        generation: GenerationId,
        value: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page> {
        let name = name.to_string();
        let value = value.to_string();
        let cursor = cursor.cloned();
        self.call(move |conn| {
            value_query_sync(conn, &name, generation, &value, cursor.as_ref(), limit)
        })
        .await
    }

    async fn scan(
        &self,
        name: &str,
        generation: GenerationId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page> {
        let name = name.to_string();
        let cursor = cursor.cloned();
        self.call(move |conn| scan_sync(conn, &name, generation, cursor.as_ref(), limit))
            .await
    }

    async fn count(&self, name: &str, generation: GenerationId, query: &QuerySpec) -> Result<u64> {
        let name = name.to_string();
        let query = query.clone();
        self.call(move |conn| count_sync(conn, &name, generation, &query))
            .await
    }

    async fn byte_total(
        &self,
        name: &str,
        generation: GenerationId,
        query: &QuerySpec,
    ) -> Result<u64> {
        let name = name.to_string();
        let query = query.clone();
        self.call(move |conn| byte_total_sync(conn, &name, generation, &query))
            .await
    }

    async fn list_keys(&self, name: &str, generation: GenerationId) -> Result<Vec<String>> {
        let name = name.to_string();
        self.call(move |conn| distinct_keys_sync(conn, &name, generation, None, usize::MAX))
            .await
    }

    async fn match_keys(
        &self,
        name: &str,
        generation: GenerationId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let name = name.to_string();
        let prefix = prefix.to_string();
        self.call(move |conn| distinct_keys_sync(conn, &name, generation, Some(&prefix), limit))
            .await
    }

    async fn reclaim(&self, name: &str, retention: Duration) -> Result<Vec<GenerationId>> {
        let name = name.to_string();
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        self.call(move |conn| {
            let cutoff = i64::try_from(epoch_millis().saturating_sub(retention_ms)).unwrap_or(0);
            let ids = {
                let mut stmt = conn.prepare(
                    "SELECT id FROM generations \
                     WHERE name = ?1 AND state = 'retired' AND retired_at <= ?2 ORDER BY id",
                )?;
                let ids = stmt.query_map(params![name, cutoff], |row| row.get(0))?;
                ids.collect::<rusqlite::Result<Vec<GenerationId>>>()?
            };
            let tx = conn.transaction().map_err(write_err)?;
            for &id in &ids {
                drop_generation(&tx, id).map_err(write_err)?;
            }
            tx.commit().map_err(write_err)?;
            Ok(ids)
        })
        .await
    }
}
